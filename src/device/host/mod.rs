//! CPU device
//!
//! Allocations live in host memory; programs are host kernels assembled
//! from a small register language (see [`assembler`]) and interpreted once
//! per work item. Execution is synchronous, so `synchronize` has nothing to
//! wait for.

pub mod assembler;
pub mod interp;
pub mod kernel;
pub mod memory;

pub use assembler::{assemble, disassemble, AsmError};
pub use kernel::{ImageError, KInstr, KOp, KernelImage};
pub use memory::{HostMemory, MemoryUsage};

use super::{
    Allocation, Allocator, BufferOptions, Compiler, Device, DeviceError, DeviceResult,
    LaunchParams, Program, Runtime,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct HostDevice {
    name: String,
    memory: Arc<HostMemory>,
}

impl HostDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            memory: Arc::new(HostMemory::new()),
        }
    }

    /// Live allocations on this device
    pub fn memory_in_use(&self) -> MemoryUsage {
        self.memory.usage()
    }
}

impl Allocator for HostDevice {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> DeviceResult<Allocation> {
        let key = self.memory.alloc(size)?;
        Ok(Allocation::new(key, size))
    }

    fn free(&self, allocation: Allocation, _options: &BufferOptions) -> DeviceResult<()> {
        self.memory.free(allocation.key())
    }

    fn copy_in(&self, dest: &Allocation, src: &[u8]) -> DeviceResult<()> {
        self.memory.write(dest.key(), src)
    }

    fn copy_out(&self, dest: &mut [u8], src: &Allocation) -> DeviceResult<()> {
        self.memory.read(src.key(), dest)
    }
}

impl Compiler for HostDevice {
    fn compile(&self, source: &str) -> DeviceResult<Vec<u8>> {
        let image = assemble(source).map_err(|e| DeviceError::Compile {
            line: e.line(),
            message: e.to_string(),
        })?;
        Ok(image.encode())
    }
}

impl Runtime for HostDevice {
    fn load(&self, name: &str, lib: &[u8]) -> DeviceResult<Box<dyn Program>> {
        let image = KernelImage::decode(lib).map_err(|e| DeviceError::Load(e.to_string()))?;
        if image.name != name {
            return Err(DeviceError::Load(format!(
                "image contains kernel {}, not {}",
                image.name, name
            )));
        }
        Ok(Box::new(HostProgram {
            image,
            memory: Arc::clone(&self.memory),
        }))
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocator(&self) -> &dyn Allocator {
        self
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

/// A loaded host kernel bound to its device's memory
pub struct HostProgram {
    image: KernelImage,
    memory: Arc<HostMemory>,
}

impl Program for HostProgram {
    fn invoke(
        &self,
        buffers: &[&Allocation],
        launch: &LaunchParams,
    ) -> DeviceResult<Option<Duration>> {
        let start = Instant::now();
        let keys: Vec<u64> = buffers.iter().map(|a| a.key()).collect();
        self.memory.with_blocks(&keys, |slots, args| {
            interp::run(&self.image, slots, args, launch)
        })?;
        Ok(launch.wait.then(|| start.elapsed()))
    }
}
