//! Host kernel binary format
//!
//! # Image Layout
//!
//! ```text
//! ┌────────┬─────────┬──────────┬──────────┬──────────┬─────────────────┐
//! │ "HKRN" │ version │ name len │   name   │  count   │  instructions   │
//! │ 4 bytes│ 1 byte  │ u16 LE   │ UTF-8    │  u32 LE  │  8 bytes each   │
//! └────────┴─────────┴──────────┴──────────┴──────────┴─────────────────┘
//! ```
//!
//! # Instruction Encoding
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────────────────┐
//! │  Opcode  │   Dst    │    A     │    B     │  32-bit Immediate    │
//! │  8 bits  │  8 bits  │  8 bits  │  8 bits  │  i32 LE              │
//! └──────────┴──────────┴──────────┴──────────┴──────────────────────┘
//! ```
//!
//! `ld` uses A as the buffer and B as the index register. `st` uses A as the
//! buffer, B as the index register and Dst as the value register.

use std::fmt;
use thiserror::Error;

/// Image magic bytes
pub const KERNEL_MAGIC: &[u8; 4] = b"HKRN";

/// Current image version
pub const KERNEL_VERSION: u8 = 1;

/// Registers per work item
pub const NUM_REGISTERS: usize = 16;

/// Buffer arguments addressable by a kernel
pub const MAX_BUFFERS: usize = 16;

/// Encoded instruction size
pub const INSTR_SIZE: usize = 8;

/// Longest kernel name the image header can carry
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

/// `gid` immediate selecting the linear work-item id
pub const LINEAR_AXIS: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("Bad magic bytes")]
    BadMagic,
    #[error("Unsupported image version {0}")]
    UnsupportedVersion(u8),
    #[error("Image truncated")]
    Truncated,
    #[error("Trailing bytes after {0} instructions")]
    TrailingBytes(usize),
    #[error("Kernel name is not valid UTF-8")]
    InvalidName,
    #[error("Invalid opcode 0x{byte:02x} at instruction {index}")]
    InvalidOpcode { index: usize, byte: u8 },
    #[error("Invalid operand at instruction {index}: {message}")]
    InvalidOperand { index: usize, message: String },
}

/// Kernel opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KOp {
    Nop = 0x00,
    /// rD = imm
    Li = 0x01,
    /// rD = rA
    Mov = 0x02,
    /// rD = vals[imm]
    Val = 0x03,
    /// rD = work-item id (linear, or axis imm)
    Gid = 0x04,
    /// rD = bA[rB]
    Ld = 0x05,
    /// bA[rB] = rD
    St = 0x06,
    Add = 0x10,
    Sub = 0x11,
    Mul = 0x12,
    Div = 0x13,
    Rem = 0x14,
    And = 0x15,
    Or = 0x16,
    Xor = 0x17,
    Shl = 0x18,
    Shr = 0x19,
    Min = 0x1A,
    Max = 0x1B,
    /// Abort the invocation
    Trap = 0x3F,
}

const ALL_OPS: [KOp; 20] = [
    KOp::Nop,
    KOp::Li,
    KOp::Mov,
    KOp::Val,
    KOp::Gid,
    KOp::Ld,
    KOp::St,
    KOp::Add,
    KOp::Sub,
    KOp::Mul,
    KOp::Div,
    KOp::Rem,
    KOp::And,
    KOp::Or,
    KOp::Xor,
    KOp::Shl,
    KOp::Shr,
    KOp::Min,
    KOp::Max,
    KOp::Trap,
];

impl KOp {
    pub fn from_u8(val: u8) -> Option<Self> {
        ALL_OPS.iter().copied().find(|op| *op as u8 == val)
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        ALL_OPS.iter().copied().find(|op| op.mnemonic() == s)
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            KOp::Nop => "nop",
            KOp::Li => "li",
            KOp::Mov => "mov",
            KOp::Val => "val",
            KOp::Gid => "gid",
            KOp::Ld => "ld",
            KOp::St => "st",
            KOp::Add => "add",
            KOp::Sub => "sub",
            KOp::Mul => "mul",
            KOp::Div => "div",
            KOp::Rem => "rem",
            KOp::And => "and",
            KOp::Or => "or",
            KOp::Xor => "xor",
            KOp::Shl => "shl",
            KOp::Shr => "shr",
            KOp::Min => "min",
            KOp::Max => "max",
            KOp::Trap => "trap",
        }
    }
}

/// One decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KInstr {
    pub op: KOp,
    pub dst: u8,
    pub a: u8,
    pub b: u8,
    pub imm: i32,
}

impl KInstr {
    pub fn new(op: KOp, dst: u8, a: u8, b: u8, imm: i32) -> Self {
        Self { op, dst, a, b, imm }
    }

    pub fn encode(&self) -> [u8; INSTR_SIZE] {
        let imm = self.imm.to_le_bytes();
        [
            self.op as u8,
            self.dst,
            self.a,
            self.b,
            imm[0],
            imm[1],
            imm[2],
            imm[3],
        ]
    }

    /// Decode and validate one instruction
    pub fn decode(bytes: &[u8], index: usize) -> Result<Self, ImageError> {
        if bytes.len() < INSTR_SIZE {
            return Err(ImageError::Truncated);
        }
        let op = KOp::from_u8(bytes[0]).ok_or(ImageError::InvalidOpcode {
            index,
            byte: bytes[0],
        })?;
        let imm = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let instr = Self::new(op, bytes[1], bytes[2], bytes[3], imm);
        instr.validate().map_err(|message| ImageError::InvalidOperand { index, message })?;
        Ok(instr)
    }

    /// Check operand ranges for this opcode
    pub fn validate(&self) -> Result<(), String> {
        let reg = |r: u8| {
            if (r as usize) < NUM_REGISTERS {
                Ok(())
            } else {
                Err(format!("register r{} out of range", r))
            }
        };
        let buf = |b: u8| {
            if (b as usize) < MAX_BUFFERS {
                Ok(())
            } else {
                Err(format!("buffer b{} out of range", b))
            }
        };
        match self.op {
            KOp::Nop | KOp::Trap => Ok(()),
            KOp::Li => reg(self.dst),
            KOp::Mov => reg(self.dst).and(reg(self.a)),
            KOp::Val => {
                reg(self.dst)?;
                if self.imm < 0 {
                    return Err(format!("value index {} is negative", self.imm));
                }
                Ok(())
            }
            KOp::Gid => {
                reg(self.dst)?;
                if !(LINEAR_AXIS..=2).contains(&self.imm) {
                    return Err(format!("axis {} out of range", self.imm));
                }
                Ok(())
            }
            KOp::Ld | KOp::St => reg(self.dst).and(buf(self.a)).and(reg(self.b)),
            _ => reg(self.dst).and(reg(self.a)).and(reg(self.b)),
        }
    }
}

impl fmt::Display for KInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.op.mnemonic();
        match self.op {
            KOp::Nop | KOp::Trap => write!(f, "{}", m),
            KOp::Li => write!(f, "{} r{}, {}", m, self.dst, self.imm),
            KOp::Mov => write!(f, "{} r{}, r{}", m, self.dst, self.a),
            KOp::Val => write!(f, "{} r{}, {}", m, self.dst, self.imm),
            KOp::Gid if self.imm == LINEAR_AXIS => write!(f, "{} r{}", m, self.dst),
            KOp::Gid => write!(f, "{} r{}, {}", m, self.dst, self.imm),
            KOp::Ld => write!(f, "{} r{}, b{}, r{}", m, self.dst, self.a, self.b),
            KOp::St => write!(f, "{} b{}, r{}, r{}", m, self.a, self.b, self.dst),
            _ => write!(f, "{} r{}, r{}, r{}", m, self.dst, self.a, self.b),
        }
    }
}

/// A compiled host kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    pub name: String,
    pub instructions: Vec<KInstr>,
}

impl KernelImage {
    /// Number of buffer arguments the kernel touches
    pub fn buffer_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| matches!(i.op, KOp::Ld | KOp::St))
            .map(|i| i.a as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Serialize to the binary image format
    ///
    /// The name must fit the u16 header field; [`assemble`](super::assemble)
    /// rejects longer names.
    pub fn encode(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        debug_assert!(name.len() <= MAX_NAME_LEN);
        let mut out =
            Vec::with_capacity(4 + 1 + 2 + name.len() + 4 + self.instructions.len() * INSTR_SIZE);
        out.extend_from_slice(KERNEL_MAGIC);
        out.push(KERNEL_VERSION);
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&(self.instructions.len() as u32).to_le_bytes());
        for instr in &self.instructions {
            out.extend_from_slice(&instr.encode());
        }
        out
    }

    /// Parse and validate a binary image
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        if cursor.take(4)? != KERNEL_MAGIC {
            return Err(ImageError::BadMagic);
        }
        let version = cursor.take(1)?[0];
        if version != KERNEL_VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let name_len = u16::from_le_bytes(cursor.array()?) as usize;
        let name = std::str::from_utf8(cursor.take(name_len)?)
            .map_err(|_| ImageError::InvalidName)?
            .to_string();
        let count = u32::from_le_bytes(cursor.array()?) as usize;

        let body = cursor.rest();
        if body.len() / INSTR_SIZE < count {
            return Err(ImageError::Truncated);
        }
        if body.len() != count * INSTR_SIZE {
            return Err(ImageError::TrailingBytes(count));
        }
        let instructions = body
            .chunks_exact(INSTR_SIZE)
            .enumerate()
            .map(|(index, chunk)| KInstr::decode(chunk, index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { name, instructions })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ImageError> {
        let end = self.pos.checked_add(n).ok_or(ImageError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(ImageError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ImageError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}
