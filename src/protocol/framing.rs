//! Framed I/O over a byte stream
//!
//! Exact-length reads and complete writes on top of any `Read`/`Write` pair.
//! A receive call may return fewer bytes than requested; only a zero-length
//! read at a command boundary counts as an orderly close. Fixed-width
//! integers are little-endian throughout.
//!
//! Structured blocks are a `u32` length followed by that many bytes. The
//! length is checked against the caller's ceiling before the body is read.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use thiserror::Error;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Peer closed the stream {received} bytes into a {expected} byte frame")]
    Truncated { expected: usize, received: usize },

    #[error("Block of {len} bytes exceeds limit of {limit}")]
    BlockTooLarge { len: u64, limit: u64 },

    #[error("Malformed structured block: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Block is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl FrameError {
    /// True when the peer went away rather than sending bad data
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Truncated { .. } => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type for framing operations
pub type FrameResult<T> = Result<T, FrameError>;

/// Single ack byte
pub const ACK: u8 = 0x00;

/// Reader/writer pair with exact-length framing
pub struct FramedStream<R: Read, W: Write> {
    reader: BufReader<R>,
    writer: W,
}

impl FramedStream<TcpStream, TcpStream> {
    /// Split a TCP connection into a framed reader/writer pair
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self::new(stream, writer))
    }
}

impl<R: Read, W: Write> FramedStream<R, W> {
    /// Create a framed stream from separate read and write halves
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Read one byte at a command boundary
    ///
    /// Returns `None` when the peer closed the stream cleanly.
    pub fn read_opcode(&mut self) -> FrameResult<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fill `buf` completely, looping over short reads
    pub fn read_exact(&mut self, buf: &mut [u8]) -> FrameResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(FrameError::Truncated {
                        expected: buf.len(),
                        received: filled,
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read exactly `len` bytes into a fresh buffer
    pub fn read_vec(&mut self, len: usize) -> FrameResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a little-endian u32
    pub fn read_u32(&mut self) -> FrameResult<u32> {
        let mut raw = [0u8; 4];
        self.read_exact(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Read a little-endian u64
    pub fn read_u64(&mut self) -> FrameResult<u64> {
        let mut raw = [0u8; 8];
        self.read_exact(&mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a single byte inside a frame
    pub fn read_u8(&mut self) -> FrameResult<u8> {
        let mut raw = [0u8; 1];
        self.read_exact(&mut raw)?;
        Ok(raw[0])
    }

    /// Read a `u32` length followed by at most `limit` bytes
    pub fn read_block(&mut self, limit: usize) -> FrameResult<Vec<u8>> {
        let len = self.read_u32()?;
        if len as u64 > limit as u64 {
            return Err(FrameError::BlockTooLarge {
                len: len as u64,
                limit: limit as u64,
            });
        }
        self.read_vec(len as usize)
    }

    /// Read a length-prefixed UTF-8 block
    pub fn read_text(&mut self, limit: usize) -> FrameResult<String> {
        let raw = self.read_block(limit)?;
        Ok(String::from_utf8(raw)?)
    }

    /// Read a length-prefixed JSON block into `T`
    pub fn read_message<T: DeserializeOwned>(&mut self, limit: usize) -> FrameResult<T> {
        let raw = self.read_block(limit)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Write every byte and flush
    pub fn write_all(&mut self, bytes: &[u8]) -> FrameResult<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Write a single byte
    pub fn write_u8(&mut self, byte: u8) -> FrameResult<()> {
        self.write_all(&[byte])
    }

    /// Write the one-byte ack
    pub fn write_ack(&mut self) -> FrameResult<()> {
        self.write_u8(ACK)
    }

    /// Write a `u32` length followed by `bytes` as one write
    pub fn write_block(&mut self, bytes: &[u8]) -> FrameResult<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| FrameError::BlockTooLarge {
            len: bytes.len() as u64,
            limit: u32::MAX as u64,
        })?;
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(bytes);
        self.write_all(&frame)
    }

    /// Serialize `msg` as JSON and write it as a block
    pub fn write_message<T: Serialize>(&mut self, msg: &T) -> FrameResult<()> {
        let body = serde_json::to_vec(msg)?;
        self.write_block(&body)
    }

    /// Borrow the write half
    pub fn writer(&self) -> &W {
        &self.writer
    }
}
