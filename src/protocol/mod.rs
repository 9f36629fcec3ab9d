//! Remote device wire protocol
//!
//! One-byte opcodes, fixed little-endian integer fields, length-prefixed
//! structured blocks and raw transfers sized by the buffer they target.

pub mod framing;
pub mod messages;
pub mod opcode;

pub use framing::{FrameError, FrameResult, FramedStream, ACK};
pub use messages::{AllocRequest, FreeRequest, LoadRequest, RunRequest, RunStatus};
pub use opcode::Opcode;
