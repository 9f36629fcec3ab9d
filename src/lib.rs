//! Remote Device - serve compute devices over a byte stream
//!
//! A client connects over TCP and drives one device on the server through a
//! small binary protocol: select a device, allocate and free buffers, copy
//! bytes in and out, compile kernel source, load compiled binaries as
//! programs and run them over a launch grid.
//!
//! # Wire format
//!
//! ```text
//! ┌────────┬──────────────────────────────────────────────┐
//! │ opcode │ payload (depends on opcode)                  │
//! │ 1 byte │ u32/u64 LE fields, u32-prefixed JSON blocks, │
//! │        │ raw transfers sized by the target buffer     │
//! └────────┴──────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use remote_device::device::{Compiler, HostDevice};
//! use remote_device::device::host::disassemble;
//! use remote_device::device::host::KernelImage;
//!
//! let cpu = HostDevice::new("CPU");
//! let lib = cpu.compile(".kernel one\ngid r0\nli r1, 1\nst b0, r0, r1\n").unwrap();
//! let image = KernelImage::decode(&lib).unwrap();
//! assert_eq!(image.name, "one");
//! assert!(disassemble(&image).contains("st b0, r0, r1"));
//! ```
//!
//! # Modules
//!
//! - [`protocol`]: opcodes, framing and request blocks
//! - [`device`]: backend traits, the registry and the built-in backends
//! - [`session`]: per-connection state and the command dispatcher
//! - [`server`]: the TCP acceptor
//! - [`client`]: a blocking client
//! - [`config`]: `rdev.toml`

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod device;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{ClientError, RemoteClient};
pub use config::{ConfigError, ServerConfig};
pub use device::{Device, DeviceError, DeviceRegistry, HostDevice, NullDevice};
pub use protocol::{FrameError, FramedStream, Opcode, RunRequest, RunStatus};
pub use server::{Server, ServerError};
pub use session::{Session, SessionEnd, SessionError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
