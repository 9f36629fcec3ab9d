//! Assembler and disassembler for host kernels
//!
//! Source is line oriented. A kernel starts with a `.kernel NAME`
//! directive; `;` and `#` start comments.
//!
//! ```text
//! .kernel add
//! gid r0              ; linear work-item id
//! ld  r1, b1, r0
//! ld  r2, b2, r0
//! add r3, r1, r2
//! st  b0, r0, r3
//! ```

use super::kernel::{
    KInstr, KOp, KernelImage, LINEAR_AXIS, MAX_BUFFERS, MAX_NAME_LEN, NUM_REGISTERS,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmError {
    #[error("Missing .kernel directive")]
    MissingKernel,
    #[error("Duplicate .kernel directive at line {0}")]
    DuplicateKernel(usize),
    #[error("Instruction before .kernel directive at line {0}")]
    InstructionBeforeKernel(usize),
    #[error("Kernel name at line {line} is {len} bytes (max {max})", max = MAX_NAME_LEN)]
    NameTooLong { line: usize, len: usize },
    #[error("Unknown directive at line {line}: {directive}")]
    UnknownDirective { line: usize, directive: String },
    #[error("Invalid opcode at line {line}: {mnemonic}")]
    InvalidOpcode { line: usize, mnemonic: String },
    #[error("Invalid register at line {line}: {operand}")]
    InvalidRegister { line: usize, operand: String },
    #[error("Invalid buffer at line {line}: {operand}")]
    InvalidBuffer { line: usize, operand: String },
    #[error("Invalid immediate at line {line}: {operand}")]
    InvalidImmediate { line: usize, operand: String },
    #[error("{mnemonic} at line {line} takes {expected} operands, found {found}")]
    OperandCount {
        line: usize,
        mnemonic: String,
        expected: String,
        found: usize,
    },
}

impl AsmError {
    /// Source line the error refers to (0 when not tied to a line)
    pub fn line(&self) -> usize {
        match self {
            AsmError::MissingKernel => 0,
            AsmError::DuplicateKernel(line) | AsmError::InstructionBeforeKernel(line) => *line,
            AsmError::NameTooLong { line, .. }
            | AsmError::UnknownDirective { line, .. }
            | AsmError::InvalidOpcode { line, .. }
            | AsmError::InvalidRegister { line, .. }
            | AsmError::InvalidBuffer { line, .. }
            | AsmError::InvalidImmediate { line, .. }
            | AsmError::OperandCount { line, .. } => *line,
        }
    }
}

/// Assemble kernel source into an image
pub fn assemble(source: &str) -> Result<KernelImage, AsmError> {
    let mut name: Option<String> = None;
    let mut instructions = Vec::new();

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }

        if let Some(directive) = text.strip_prefix('.') {
            let mut parts = directive.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("kernel"), Some(kernel), None) => {
                    if name.is_some() {
                        return Err(AsmError::DuplicateKernel(line));
                    }
                    if kernel.len() > MAX_NAME_LEN {
                        return Err(AsmError::NameTooLong {
                            line,
                            len: kernel.len(),
                        });
                    }
                    name = Some(kernel.to_string());
                }
                _ => {
                    return Err(AsmError::UnknownDirective {
                        line,
                        directive: text.to_string(),
                    })
                }
            }
            continue;
        }

        if name.is_none() {
            return Err(AsmError::InstructionBeforeKernel(line));
        }
        instructions.push(parse_instruction(text, line)?);
    }

    let name = name.ok_or(AsmError::MissingKernel)?;
    Ok(KernelImage { name, instructions })
}

/// Render an image back to source form
pub fn disassemble(image: &KernelImage) -> String {
    let mut out = format!(".kernel {}\n", image.name);
    for instr in &image.instructions {
        out.push_str(&instr.to_string());
        out.push('\n');
    }
    out
}

fn strip_comment(line: &str) -> &str {
    match line.find([';', '#']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_instruction(text: &str, line: usize) -> Result<KInstr, AsmError> {
    let (mnemonic, rest) = match text.split_once(char::is_whitespace) {
        Some((m, rest)) => (m, rest.trim()),
        None => (text, ""),
    };
    let mnemonic = mnemonic.to_lowercase();
    let op = KOp::from_mnemonic(&mnemonic).ok_or_else(|| AsmError::InvalidOpcode {
        line,
        mnemonic: mnemonic.clone(),
    })?;

    let operands: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(',').map(str::trim).collect()
    };
    let arity = |expected: &str, ok: bool| {
        if ok {
            Ok(())
        } else {
            Err(AsmError::OperandCount {
                line,
                mnemonic: mnemonic.clone(),
                expected: expected.to_string(),
                found: operands.len(),
            })
        }
    };

    let instr = match op {
        KOp::Nop | KOp::Trap => {
            arity("0", operands.is_empty())?;
            KInstr::new(op, 0, 0, 0, 0)
        }
        KOp::Li => {
            arity("2", operands.len() == 2)?;
            KInstr::new(
                op,
                parse_register(operands[0], line)?,
                0,
                0,
                parse_immediate(operands[1], line)?,
            )
        }
        KOp::Mov => {
            arity("2", operands.len() == 2)?;
            KInstr::new(
                op,
                parse_register(operands[0], line)?,
                parse_register(operands[1], line)?,
                0,
                0,
            )
        }
        KOp::Val => {
            arity("2", operands.len() == 2)?;
            let index = parse_immediate(operands[1], line)?;
            if index < 0 {
                return Err(AsmError::InvalidImmediate {
                    line,
                    operand: operands[1].to_string(),
                });
            }
            KInstr::new(op, parse_register(operands[0], line)?, 0, 0, index)
        }
        KOp::Gid => {
            arity("1 or 2", operands.len() == 1 || operands.len() == 2)?;
            let axis = match operands.get(1) {
                Some(axis) => {
                    let value = parse_immediate(axis, line)?;
                    if !(0..=2).contains(&value) {
                        return Err(AsmError::InvalidImmediate {
                            line,
                            operand: axis.to_string(),
                        });
                    }
                    value
                }
                None => LINEAR_AXIS,
            };
            KInstr::new(op, parse_register(operands[0], line)?, 0, 0, axis)
        }
        KOp::Ld => {
            arity("3", operands.len() == 3)?;
            KInstr::new(
                op,
                parse_register(operands[0], line)?,
                parse_buffer(operands[1], line)?,
                parse_register(operands[2], line)?,
                0,
            )
        }
        KOp::St => {
            arity("3", operands.len() == 3)?;
            KInstr::new(
                op,
                parse_register(operands[2], line)?,
                parse_buffer(operands[0], line)?,
                parse_register(operands[1], line)?,
                0,
            )
        }
        _ => {
            arity("3", operands.len() == 3)?;
            KInstr::new(
                op,
                parse_register(operands[0], line)?,
                parse_register(operands[1], line)?,
                parse_register(operands[2], line)?,
                0,
            )
        }
    };
    Ok(instr)
}

fn parse_indexed(s: &str, prefix: char, limit: usize) -> Option<u8> {
    let s = s.trim().to_lowercase();
    let n: usize = s.strip_prefix(prefix)?.parse().ok()?;
    (n < limit).then_some(n as u8)
}

fn parse_register(s: &str, line: usize) -> Result<u8, AsmError> {
    parse_indexed(s, 'r', NUM_REGISTERS).ok_or_else(|| AsmError::InvalidRegister {
        line,
        operand: s.to_string(),
    })
}

fn parse_buffer(s: &str, line: usize) -> Result<u8, AsmError> {
    parse_indexed(s, 'b', MAX_BUFFERS).ok_or_else(|| AsmError::InvalidBuffer {
        line,
        operand: s.to_string(),
    })
}

fn parse_immediate(s: &str, line: usize) -> Result<i32, AsmError> {
    let err = || AsmError::InvalidImmediate {
        line,
        operand: s.to_string(),
    };
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let magnitude = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).map_err(|_| err())?
    } else {
        digits.parse::<i64>().map_err(|_| err())?
    };
    let value = if negative { -magnitude } else { magnitude };
    // Hex literals may spell out the full 32-bit pattern
    if (i32::MIN as i64..=u32::MAX as i64).contains(&value) {
        Ok(value as u32 as i32)
    } else {
        Err(err())
    }
}
