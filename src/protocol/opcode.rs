//! Command opcodes
//!
//! Every command starts with a single opcode byte. The payload that follows
//! is opcode-specific and described on each variant.

use std::fmt;

/// Session command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Rebind the session to another device: name block -> ack
    SelectDevice = 0x00,
    /// Wait for outstanding device work: no payload -> ack
    Synchronize = 0x01,
    /// Allocate a buffer: `(size, options)` block -> identifier block
    Allocate = 0x02,
    /// Free a buffer: `(id, options)` block -> ack
    Free = 0x03,
    /// Host to device copy: u64 id + raw payload, no response
    CopyIn = 0x04,
    /// Device to host copy: u64 id -> raw payload
    CopyOut = 0x05,
    /// Compile source: u32 length + UTF-8 -> u32 length + binary
    Compile = 0x06,
    /// Load a program: header block -> ack, raw binary -> ack
    Load = 0x07,
    /// Invoke a loaded program: run block -> status byte
    Run = 0x08,
    /// End the session, no response
    Exit = 0xFF,
}

impl Opcode {
    /// Decode an opcode byte, returning None for unknown values
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(Opcode::SelectDevice),
            0x01 => Some(Opcode::Synchronize),
            0x02 => Some(Opcode::Allocate),
            0x03 => Some(Opcode::Free),
            0x04 => Some(Opcode::CopyIn),
            0x05 => Some(Opcode::CopyOut),
            0x06 => Some(Opcode::Compile),
            0x07 => Some(Opcode::Load),
            0x08 => Some(Opcode::Run),
            0xFF => Some(Opcode::Exit),
            _ => None,
        }
    }

    /// Wire byte for this opcode
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Short lowercase name used in logs
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::SelectDevice => "device",
            Opcode::Synchronize => "synchronize",
            Opcode::Allocate => "alloc",
            Opcode::Free => "free",
            Opcode::CopyIn => "copyin",
            Opcode::CopyOut => "copyout",
            Opcode::Compile => "compile",
            Opcode::Load => "load",
            Opcode::Run => "run",
            Opcode::Exit => "exit",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.mnemonic(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_opcodes_decode() {
        for byte in 0x00..=0x08u8 {
            let op = Opcode::from_u8(byte).unwrap();
            assert_eq!(op.as_u8(), byte);
        }
        assert_eq!(Opcode::from_u8(0xFF), Some(Opcode::Exit));
    }

    #[test]
    fn test_unknown_opcodes_rejected() {
        for byte in 0x09..0xFFu8 {
            assert!(Opcode::from_u8(byte).is_none(), "0x{:02x} decoded", byte);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Opcode::CopyOut.to_string(), "copyout (0x05)");
    }
}
