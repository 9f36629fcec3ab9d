//! Device backends
//!
//! A device exposes three capabilities the session dispatcher calls into:
//! an allocator, a compiler and a runtime loader. Loaded programs are
//! invoked with resolved allocations and launch parameters.
//!
//! # Backends
//!
//! - `CPU`: [`host::HostDevice`], host memory and a small kernel language
//! - `NULL`: [`null::NullDevice`], accepts everything and stores nothing
//!
//! Backends are looked up by name through a [`DeviceRegistry`].

pub mod host;
pub mod null;
pub mod registry;

pub use host::HostDevice;
pub use null::NullDevice;
pub use registry::{DeviceFactory, DeviceRegistry, MAX_ORDINAL};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: usize, reason: String },

    #[error("Allocation token {0} does not belong to this device")]
    InvalidAllocation(u64),

    #[error("Size mismatch: allocation holds {expected} bytes, transfer has {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Compile error at line {line}: {message}")]
    Compile { line: usize, message: String },

    #[error("Load failed: {0}")]
    Load(String),

    #[error("Invalid launch: {0}")]
    InvalidLaunch(String),

    #[error("Execution failed: {0}")]
    Execution(String),
}

/// Result type for backend operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Allocation options passed through from the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferOptions {
    /// Bypass device caches
    pub uncached: bool,
    /// Host must be able to map the allocation
    pub cpu_access: bool,
    /// Allocate in host memory
    pub host: bool,
    /// Exclude from the allocator's reuse cache
    pub nolru: bool,
}

/// Opaque backend allocation token
///
/// Move-only: the holder owns the allocation until it hands the token back
/// to [`Allocator::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    key: u64,
    size: usize,
}

impl Allocation {
    /// Wrap a backend key; only backends create tokens
    pub fn new(key: u64, size: usize) -> Self {
        Self { key, size }
    }

    /// Backend key
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Kernel launch parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchParams {
    pub global_size: Vec<u64>,
    pub local_size: Option<Vec<u64>>,
    /// Scalar arguments
    pub vals: Vec<i64>,
    /// Block until the kernel finishes and report its duration
    pub wait: bool,
}

impl LaunchParams {
    /// Global grid padded to three dimensions
    pub fn grid(&self) -> DeviceResult<[u64; 3]> {
        let global = pad_dims(&self.global_size, "global")?;
        if let Some(local) = &self.local_size {
            pad_dims(local, "local")?;
        }
        Ok(global)
    }

    /// Number of work items in the global grid
    pub fn work_items(&self) -> DeviceResult<u64> {
        let [x, y, z] = self.grid()?;
        x.checked_mul(y)
            .and_then(|xy| xy.checked_mul(z))
            .ok_or_else(|| DeviceError::InvalidLaunch("global size overflows".into()))
    }
}

fn pad_dims(dims: &[u64], what: &str) -> DeviceResult<[u64; 3]> {
    if dims.len() > 3 {
        return Err(DeviceError::InvalidLaunch(format!(
            "{} size has {} dimensions (max 3)",
            what,
            dims.len()
        )));
    }
    let mut out = [1u64; 3];
    for (slot, &dim) in out.iter_mut().zip(dims) {
        if dim == 0 {
            return Err(DeviceError::InvalidLaunch(format!(
                "{} size has a zero dimension",
                what
            )));
        }
        *slot = dim;
    }
    Ok(out)
}

/// Device memory allocator
pub trait Allocator: Send + Sync {
    fn alloc(&self, size: usize, options: &BufferOptions) -> DeviceResult<Allocation>;

    fn free(&self, allocation: Allocation, options: &BufferOptions) -> DeviceResult<()>;

    /// Copy `src` into the allocation; `src` must match its size
    fn copy_in(&self, dest: &Allocation, src: &[u8]) -> DeviceResult<()>;

    /// Copy the allocation into `dest`; `dest` must match its size
    fn copy_out(&self, dest: &mut [u8], src: &Allocation) -> DeviceResult<()>;
}

/// Source-to-binary compiler
pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str) -> DeviceResult<Vec<u8>>;
}

/// Loader turning compiled binaries into invocable programs
pub trait Runtime: Send + Sync {
    fn load(&self, name: &str, lib: &[u8]) -> DeviceResult<Box<dyn Program>>;
}

/// A loaded executable
pub trait Program: Send {
    /// Run the program over `buffers`
    ///
    /// Returns the elapsed time when `launch.wait` is set.
    fn invoke(&self, buffers: &[&Allocation], launch: &LaunchParams)
        -> DeviceResult<Option<Duration>>;
}

/// A compute device
pub trait Device: Send + Sync {
    /// Canonical device name, e.g. `CPU` or `CPU:1`
    fn name(&self) -> &str;

    fn allocator(&self) -> &dyn Allocator;

    fn compiler(&self) -> &dyn Compiler;

    fn runtime(&self) -> &dyn Runtime;

    /// Block until all queued work has completed
    fn synchronize(&self) -> DeviceResult<()>;
}
