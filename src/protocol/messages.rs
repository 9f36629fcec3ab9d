//! Structured request blocks
//!
//! These travel as JSON inside length-prefixed blocks. Deserialization
//! accepts both the positional array form (`[1024, {}]`) and the named
//! object form (`{"size": 1024, "options": {}}`); serialization produces the
//! named form.

use crate::device::{BufferOptions, LaunchParams};
use serde::{Deserialize, Serialize};

/// Allocate request: `(size, options)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocRequest {
    pub size: u64,
    pub options: BufferOptions,
}

/// Free request: `(id, options)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeRequest {
    pub id: u64,
    pub options: BufferOptions,
}

/// Load header: `(name, nbytes, program)`
///
/// The compiled binary follows as `nbytes` raw bytes after the first ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub name: String,
    pub nbytes: u64,
    pub program: u64,
}

/// Run request:
/// `(name, buffers, global_size, local_size, vals, wait, program)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Kernel name, informational only
    pub name: String,
    /// Buffer identifiers in argument order
    pub buffers: Vec<u64>,
    pub global_size: Vec<u64>,
    pub local_size: Option<Vec<u64>>,
    pub vals: Vec<i64>,
    pub wait: bool,
    pub program: u64,
}

impl RunRequest {
    /// Launch parameters for the backend invocation
    pub fn launch_params(&self) -> LaunchParams {
        LaunchParams {
            global_size: self.global_size.clone(),
            local_size: self.local_size.clone(),
            vals: self.vals.clone(),
            wait: self.wait,
        }
    }
}

/// Run status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunStatus {
    Success = 0,
    Failure = 1,
}

impl RunStatus {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(RunStatus::Success),
            1 => Some(RunStatus::Failure),
            _ => None,
        }
    }
}
