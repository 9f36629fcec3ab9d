//! Null device
//!
//! Accepts every operation and keeps no data. Useful for measuring protocol
//! overhead without a real backend behind it.

use super::{
    Allocation, Allocator, BufferOptions, Compiler, Device, DeviceError, DeviceResult,
    LaunchParams, Program, Runtime,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct NullDevice {
    name: String,
    allocator: NullAllocator,
}

impl NullDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            allocator: NullAllocator {
                next_key: AtomicU64::new(1),
            },
        }
    }
}

struct NullAllocator {
    next_key: AtomicU64,
}

impl Allocator for NullAllocator {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> DeviceResult<Allocation> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        Ok(Allocation::new(key, size))
    }

    fn free(&self, _allocation: Allocation, _options: &BufferOptions) -> DeviceResult<()> {
        Ok(())
    }

    fn copy_in(&self, dest: &Allocation, src: &[u8]) -> DeviceResult<()> {
        check_len(dest, src.len())
    }

    fn copy_out(&self, dest: &mut [u8], src: &Allocation) -> DeviceResult<()> {
        check_len(src, dest.len())
    }
}

fn check_len(allocation: &Allocation, len: usize) -> DeviceResult<()> {
    if allocation.size() != len {
        return Err(DeviceError::SizeMismatch {
            expected: allocation.size(),
            actual: len,
        });
    }
    Ok(())
}

impl Compiler for NullDevice {
    fn compile(&self, source: &str) -> DeviceResult<Vec<u8>> {
        Ok(source.as_bytes().to_vec())
    }
}

impl Runtime for NullDevice {
    fn load(&self, _name: &str, _lib: &[u8]) -> DeviceResult<Box<dyn Program>> {
        Ok(Box::new(NullProgram))
    }
}

struct NullProgram;

impl Program for NullProgram {
    fn invoke(
        &self,
        _buffers: &[&Allocation],
        launch: &LaunchParams,
    ) -> DeviceResult<Option<Duration>> {
        launch.grid()?;
        Ok(launch.wait.then_some(Duration::ZERO))
    }
}

impl Device for NullDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocator(&self) -> &dyn Allocator {
        &self.allocator
    }

    fn compiler(&self) -> &dyn Compiler {
        self
    }

    fn runtime(&self) -> &dyn Runtime {
        self
    }

    fn synchronize(&self) -> DeviceResult<()> {
        Ok(())
    }
}
