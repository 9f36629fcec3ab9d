//! Host kernel interpreter
//!
//! Runs the instruction list once per work item. Each work item starts with
//! zeroed registers; buffers are shared across work items and viewed as
//! little-endian `i32` elements.

use super::kernel::{KOp, KernelImage, LINEAR_AXIS, NUM_REGISTERS};
use crate::device::{DeviceError, DeviceResult, LaunchParams};

/// Execute `image` over the launch grid
///
/// `slots` holds the backing memory; `args[i]` is the slot bound to kernel
/// buffer `bi`.
pub fn run(
    image: &KernelImage,
    slots: &mut [Vec<u8>],
    args: &[usize],
    launch: &LaunchParams,
) -> DeviceResult<()> {
    let [gx, gy, gz] = launch.grid()?;
    launch.work_items()?;

    let needed = image.buffer_count();
    if args.len() < needed {
        return Err(DeviceError::InvalidLaunch(format!(
            "kernel {} uses {} buffers, {} given",
            image.name,
            needed,
            args.len()
        )));
    }

    for z in 0..gz {
        for y in 0..gy {
            for x in 0..gx {
                let item = WorkItem {
                    ids: [x, y, z],
                    linear: x + gx * (y + gy * z),
                };
                execute_item(image, slots, args, launch, &item)?;
            }
        }
    }
    Ok(())
}

struct WorkItem {
    ids: [u64; 3],
    linear: u64,
}

fn execute_item(
    image: &KernelImage,
    slots: &mut [Vec<u8>],
    args: &[usize],
    launch: &LaunchParams,
    item: &WorkItem,
) -> DeviceResult<()> {
    let mut regs = [0i32; NUM_REGISTERS];

    for (pc, instr) in image.instructions.iter().enumerate() {
        let d = instr.dst as usize;
        let a = instr.a as usize;
        let b = instr.b as usize;

        match instr.op {
            KOp::Nop => {}
            KOp::Li => regs[d] = instr.imm,
            KOp::Mov => regs[d] = regs[a],
            KOp::Val => {
                let value = launch.vals.get(instr.imm as usize).ok_or_else(|| {
                    DeviceError::Execution(format!(
                        "val {} requested but only {} values given",
                        instr.imm,
                        launch.vals.len()
                    ))
                })?;
                regs[d] = *value as i32;
            }
            KOp::Gid => {
                let id = if instr.imm == LINEAR_AXIS {
                    item.linear
                } else {
                    item.ids[instr.imm as usize]
                };
                regs[d] = id as i32;
            }
            KOp::Ld => {
                let slot = &slots[args[a]];
                regs[d] = load(slot, regs[b], a, pc)?;
            }
            KOp::St => {
                let slot = &mut slots[args[a]];
                store(slot, regs[b], regs[d], a, pc)?;
            }
            KOp::Add => regs[d] = regs[a].wrapping_add(regs[b]),
            KOp::Sub => regs[d] = regs[a].wrapping_sub(regs[b]),
            KOp::Mul => regs[d] = regs[a].wrapping_mul(regs[b]),
            KOp::Div | KOp::Rem => {
                if regs[b] == 0 {
                    return Err(DeviceError::Execution(format!(
                        "division by zero at instruction {} (work item {})",
                        pc, item.linear
                    )));
                }
                regs[d] = if instr.op == KOp::Div {
                    regs[a].wrapping_div(regs[b])
                } else {
                    regs[a].wrapping_rem(regs[b])
                };
            }
            KOp::And => regs[d] = regs[a] & regs[b],
            KOp::Or => regs[d] = regs[a] | regs[b],
            KOp::Xor => regs[d] = regs[a] ^ regs[b],
            KOp::Shl => regs[d] = regs[a].wrapping_shl(regs[b] as u32),
            KOp::Shr => regs[d] = regs[a].wrapping_shr(regs[b] as u32),
            KOp::Min => regs[d] = regs[a].min(regs[b]),
            KOp::Max => regs[d] = regs[a].max(regs[b]),
            KOp::Trap => {
                return Err(DeviceError::Execution(format!(
                    "trap at instruction {} (work item {})",
                    pc, item.linear
                )))
            }
        }
    }
    Ok(())
}

fn element_range(slot: &[u8], index: i32, buffer: usize, pc: usize) -> DeviceResult<usize> {
    let offset = usize::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(4))
        .filter(|off| off + 4 <= slot.len());
    offset.ok_or_else(|| {
        DeviceError::Execution(format!(
            "index {} out of bounds for b{} ({} elements) at instruction {}",
            index,
            buffer,
            slot.len() / 4,
            pc
        ))
    })
}

fn load(slot: &[u8], index: i32, buffer: usize, pc: usize) -> DeviceResult<i32> {
    let off = element_range(slot, index, buffer, pc)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&slot[off..off + 4]);
    Ok(i32::from_le_bytes(raw))
}

fn store(slot: &mut [u8], index: i32, value: i32, buffer: usize, pc: usize) -> DeviceResult<()> {
    let off = element_range(slot, index, buffer, pc)?;
    slot[off..off + 4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}
