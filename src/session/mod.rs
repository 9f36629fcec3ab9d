//! Session loop and command dispatcher
//!
//! A session owns one connection's framed stream, its device binding and
//! both handle tables. It reads an opcode, runs the matching handler and
//! goes back to waiting for the next opcode until the client sends Exit,
//! closes the stream, or a fatal error occurs.
//!
//! Only Run's backend invocation failures are reported to the client (as
//! status `1`). Every other error ends the session; dropping the session
//! releases all of its allocations.

pub mod handles;

pub use handles::{BufferHandle, BufferTable, ProgramTable};

use crate::config::LimitsConfig;
use crate::device::{Device, DeviceError, DeviceRegistry};
use crate::protocol::{
    AllocRequest, FrameError, FramedStream, FreeRequest, LoadRequest, Opcode, RunRequest,
    RunStatus,
};
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("Unknown buffer handle {0}")]
    UnknownBuffer(u64),

    #[error("Unknown program {0}")]
    UnknownProgram(u64),

    #[error("{what} of {size} bytes exceeds limit of {limit}")]
    TooLarge {
        what: &'static str,
        size: u64,
        limit: u64,
    },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

impl SessionError {
    /// True when the client simply went away
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SessionError::Frame(e) if e.is_disconnect())
    }
}

/// How a session loop finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client sent Exit
    Exit,
    /// Client closed the stream between commands
    PeerClosed,
}

enum Flow {
    Continue,
    Exit,
}

/// State for one connection
pub struct Session<R: Read, W: Write> {
    id: u64,
    stream: FramedStream<R, W>,
    registry: Arc<DeviceRegistry>,
    device: Arc<dyn Device>,
    buffers: BufferTable,
    programs: ProgramTable,
    limits: LimitsConfig,
    commands: u64,
}

impl<R: Read, W: Write> Session<R, W> {
    pub fn new(
        id: u64,
        stream: FramedStream<R, W>,
        registry: Arc<DeviceRegistry>,
        device: Arc<dyn Device>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            id,
            stream,
            registry,
            device,
            buffers: BufferTable::new(),
            programs: ProgramTable::new(),
            limits,
            commands: 0,
        }
    }

    /// Currently bound device
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn buffers(&self) -> &BufferTable {
        &self.buffers
    }

    pub fn programs(&self) -> &ProgramTable {
        &self.programs
    }

    pub fn stream(&self) -> &FramedStream<R, W> {
        &self.stream
    }

    /// Commands dispatched so far
    pub fn commands(&self) -> u64 {
        self.commands
    }

    /// Serve commands until the session ends
    pub fn run(&mut self) -> Result<SessionEnd, SessionError> {
        loop {
            let byte = match self.stream.read_opcode()? {
                Some(byte) => byte,
                None => return Ok(SessionEnd::PeerClosed),
            };
            let op = match Opcode::from_u8(byte) {
                Some(op) => op,
                None => {
                    // The payload length is unknown, so the stream cannot be resynchronized
                    warn!("session {}: unknown opcode 0x{:02x}", self.id, byte);
                    return Err(SessionError::UnknownOpcode(byte));
                }
            };
            self.commands += 1;
            debug!("session {}: {}", self.id, op);

            if let Flow::Exit = self.dispatch(op)? {
                return Ok(SessionEnd::Exit);
            }
        }
    }

    fn dispatch(&mut self, op: Opcode) -> Result<Flow, SessionError> {
        match op {
            Opcode::SelectDevice => self.select_device()?,
            Opcode::Synchronize => self.synchronize()?,
            Opcode::Allocate => self.allocate()?,
            Opcode::Free => self.free()?,
            Opcode::CopyIn => self.copy_in()?,
            Opcode::CopyOut => self.copy_out()?,
            Opcode::Compile => self.compile()?,
            Opcode::Load => self.load()?,
            Opcode::Run => self.run_program()?,
            Opcode::Exit => {
                info!("session {}: exit", self.id);
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    fn select_device(&mut self) -> Result<(), SessionError> {
        let name = self.stream.read_text(self.limits.block_bytes)?;
        let device = self.registry.get(&name)?;
        info!(
            "session {}: bound to {} (was {})",
            self.id,
            device.name(),
            self.device.name()
        );
        self.device = device;
        self.stream.write_ack()?;
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), SessionError> {
        self.device.synchronize()?;
        self.stream.write_ack()?;
        Ok(())
    }

    fn allocate(&mut self) -> Result<(), SessionError> {
        let req: AllocRequest = self.stream.read_message(self.limits.block_bytes)?;
        let size = self.check_transfer("allocation", req.size)?;

        let allocation = self.device.allocator().alloc(size, &req.options)?;
        let handle = BufferHandle::new(allocation, req.options, Arc::clone(&self.device));
        let id = self.buffers.insert(handle);
        debug!("session {}: buffer {} = {} bytes", self.id, id, size);

        self.stream.write_message(&id)?;
        Ok(())
    }

    fn free(&mut self) -> Result<(), SessionError> {
        let req: FreeRequest = self.stream.read_message(self.limits.block_bytes)?;
        let handle = self.buffers.remove(req.id)?;
        handle.release(&req.options)?;
        self.stream.write_ack()?;
        Ok(())
    }

    fn copy_in(&mut self) -> Result<(), SessionError> {
        let id = self.stream.read_u64()?;
        let handle = self.buffers.get_mut(id)?;
        let stream = &mut self.stream;
        handle.copy_in_with(|shadow| stream.read_exact(shadow).map_err(SessionError::from))
    }

    fn copy_out(&mut self) -> Result<(), SessionError> {
        let id = self.stream.read_u64()?;
        let data = self.buffers.get_mut(id)?.copy_out()?;
        self.stream.write_all(data)?;
        Ok(())
    }

    fn compile(&mut self) -> Result<(), SessionError> {
        let len = self.stream.read_u32()?;
        let len = self.check_transfer("compile source", len as u64)?;
        let raw = self.stream.read_vec(len)?;
        let source = String::from_utf8(raw).map_err(FrameError::from)?;

        let lib = self.device.compiler().compile(&source)?;
        debug!(
            "session {}: compiled {} source bytes to {} bytes",
            self.id,
            len,
            lib.len()
        );
        self.stream.write_block(&lib)?;
        Ok(())
    }

    fn load(&mut self) -> Result<(), SessionError> {
        let req: LoadRequest = self.stream.read_message(self.limits.block_bytes)?;
        let nbytes = self.check_transfer("program binary", req.nbytes)?;
        self.stream.write_ack()?;

        let lib = self.stream.read_vec(nbytes)?;
        let program = self.device.runtime().load(&req.name, &lib)?;
        if self.programs.insert(req.program, program) {
            debug!("session {}: program {} replaced", self.id, req.program);
        }
        self.stream.write_ack()?;
        Ok(())
    }

    fn run_program(&mut self) -> Result<(), SessionError> {
        let req: RunRequest = self.stream.read_message(self.limits.run_block_bytes)?;
        let status = {
            let buffers = self.buffers.resolve(&req.buffers)?;
            let program = self.programs.get(req.program)?;
            let launch = req.launch_params();

            match catch_unwind(AssertUnwindSafe(|| program.invoke(&buffers, &launch))) {
                Ok(Ok(elapsed)) => {
                    if let Some(elapsed) = elapsed {
                        debug!(
                            "session {}: {} took {:?}",
                            self.id, req.name, elapsed
                        );
                    }
                    RunStatus::Success
                }
                Ok(Err(e)) => {
                    warn!("session {}: {} failed: {}", self.id, req.name, e);
                    RunStatus::Failure
                }
                Err(panic) => {
                    warn!(
                        "session {}: {} panicked: {}",
                        self.id,
                        req.name,
                        panic_message(&*panic)
                    );
                    RunStatus::Failure
                }
            }
        };
        self.stream.write_u8(status as u8)?;
        Ok(())
    }

    fn check_transfer(&self, what: &'static str, size: u64) -> Result<usize, SessionError> {
        let limit = self.limits.transfer_bytes;
        if size > limit {
            return Err(SessionError::TooLarge { what, size, limit });
        }
        usize::try_from(size).map_err(|_| SessionError::TooLarge { what, size, limit })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
