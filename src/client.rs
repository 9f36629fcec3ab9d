//! Blocking client for the session protocol
//!
//! ```no_run
//! use remote_device::client::RemoteClient;
//!
//! let mut client = RemoteClient::connect("127.0.0.1:1234")?;
//! let buf = client.alloc(16)?;
//! client.copy_in(buf, &[0u8; 16])?;
//! let data = client.copy_out(buf)?;
//! assert_eq!(data.len(), 16);
//! client.exit()?;
//! # Ok::<(), remote_device::client::ClientError>(())
//! ```

use crate::device::BufferOptions;
use crate::protocol::{
    AllocRequest, FrameError, FramedStream, FreeRequest, LoadRequest, Opcode, RunRequest,
    RunStatus, ACK,
};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use thiserror::Error;

/// Ceiling for blocks the server sends back (buffer ids)
const REPLY_LIMIT: usize = 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("Buffer {id} holds {expected} bytes, got {actual}")]
    SizeMismatch {
        id: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Buffer {0} was not allocated by this client")]
    UnknownBuffer(u64),

    #[error("Expected ack, server sent 0x{0:02x}")]
    UnexpectedReply(u8),

    #[error("Size {0} does not fit the wire format")]
    Oversized(usize),
}

pub type ClientResult<T> = Result<T, ClientError>;

pub struct RemoteClient<R: Read, W: Write> {
    stream: FramedStream<R, W>,
    sizes: HashMap<u64, usize>,
}

impl RemoteClient<TcpStream, TcpStream> {
    /// Connect over TCP with Nagle disabled
    pub fn connect<A: ToSocketAddrs>(addr: A) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).map_err(ClientError::Connect)?;
        stream.set_nodelay(true).map_err(ClientError::Connect)?;
        let framed = FramedStream::from_tcp(stream).map_err(ClientError::Connect)?;
        Ok(Self::new(framed))
    }
}

impl<R: Read, W: Write> RemoteClient<R, W> {
    pub fn new(stream: FramedStream<R, W>) -> Self {
        Self {
            stream,
            sizes: HashMap::new(),
        }
    }

    /// Size of a buffer this client allocated
    pub fn buffer_size(&self, id: u64) -> Option<usize> {
        self.sizes.get(&id).copied()
    }

    pub fn select_device(&mut self, name: &str) -> ClientResult<()> {
        self.send_op(Opcode::SelectDevice)?;
        self.stream.write_block(name.as_bytes())?;
        self.expect_ack()
    }

    pub fn synchronize(&mut self) -> ClientResult<()> {
        self.send_op(Opcode::Synchronize)?;
        self.expect_ack()
    }

    /// Allocate `size` bytes with default options
    pub fn alloc(&mut self, size: usize) -> ClientResult<u64> {
        self.alloc_with(size, BufferOptions::default())
    }

    pub fn alloc_with(&mut self, size: usize, options: BufferOptions) -> ClientResult<u64> {
        self.send_op(Opcode::Allocate)?;
        self.stream.write_message(&AllocRequest {
            size: size as u64,
            options,
        })?;
        let id: u64 = self.stream.read_message(REPLY_LIMIT)?;
        self.sizes.insert(id, size);
        Ok(id)
    }

    pub fn free(&mut self, id: u64) -> ClientResult<()> {
        self.send_op(Opcode::Free)?;
        self.stream.write_message(&FreeRequest {
            id,
            options: BufferOptions::default(),
        })?;
        self.expect_ack()?;
        self.sizes.remove(&id);
        Ok(())
    }

    /// Overwrite buffer `id`; `data` must match the allocation size
    pub fn copy_in(&mut self, id: u64, data: &[u8]) -> ClientResult<()> {
        let expected = self.size_of(id)?;
        if data.len() != expected {
            return Err(ClientError::SizeMismatch {
                id,
                expected,
                actual: data.len(),
            });
        }
        let mut frame = Vec::with_capacity(9 + data.len());
        frame.push(Opcode::CopyIn.as_u8());
        frame.extend_from_slice(&id.to_le_bytes());
        frame.extend_from_slice(data);
        self.stream.write_all(&frame)?;
        Ok(())
    }

    pub fn copy_out(&mut self, id: u64) -> ClientResult<Vec<u8>> {
        let size = self.size_of(id)?;
        let mut frame = [0u8; 9];
        frame[0] = Opcode::CopyOut.as_u8();
        frame[1..].copy_from_slice(&id.to_le_bytes());
        self.stream.write_all(&frame)?;
        Ok(self.stream.read_vec(size)?)
    }

    /// Compile `source` on the bound device and return the binary
    pub fn compile(&mut self, source: &str) -> ClientResult<Vec<u8>> {
        let len = u32::try_from(source.len()).map_err(|_| ClientError::Oversized(source.len()))?;
        let mut frame = Vec::with_capacity(5 + source.len());
        frame.push(Opcode::Compile.as_u8());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(source.as_bytes());
        self.stream.write_all(&frame)?;
        Ok(self.stream.read_block(u32::MAX as usize)?)
    }

    /// Load `lib` as program `program`, replacing any earlier entry
    pub fn load(&mut self, name: &str, lib: &[u8], program: u64) -> ClientResult<()> {
        self.send_op(Opcode::Load)?;
        self.stream.write_message(&LoadRequest {
            name: name.to_string(),
            nbytes: lib.len() as u64,
            program,
        })?;
        self.expect_ack()?;
        self.stream.write_all(lib)?;
        self.expect_ack()
    }

    pub fn run(&mut self, request: &RunRequest) -> ClientResult<RunStatus> {
        self.send_op(Opcode::Run)?;
        self.stream.write_message(request)?;
        let byte = self.stream.read_u8()?;
        RunStatus::from_u8(byte).ok_or(ClientError::UnexpectedReply(byte))
    }

    /// End the session; the server sends nothing back
    pub fn exit(mut self) -> ClientResult<()> {
        self.send_op(Opcode::Exit)
    }

    fn send_op(&mut self, op: Opcode) -> ClientResult<()> {
        self.stream.write_u8(op.as_u8())?;
        Ok(())
    }

    fn expect_ack(&mut self) -> ClientResult<()> {
        match self.stream.read_u8()? {
            ACK => Ok(()),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    fn size_of(&self, id: u64) -> ClientResult<usize> {
        self.buffer_size(id).ok_or(ClientError::UnknownBuffer(id))
    }
}
