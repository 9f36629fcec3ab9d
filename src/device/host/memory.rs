//! Host memory blocks backing CPU allocations

use crate::device::{DeviceError, DeviceResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

// Keys are unique across every HostMemory in the process, so a token handed
// to the wrong device is rejected instead of aliasing another block.
static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Live allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub allocations: usize,
    pub bytes: usize,
}

/// Keyed host memory blocks
#[derive(Default)]
pub struct HostMemory {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed block and return its key
    pub fn alloc(&self, size: usize) -> DeviceResult<u64> {
        let mut block = Vec::new();
        block
            .try_reserve_exact(size)
            .map_err(|e| DeviceError::AllocationFailed {
                size,
                reason: e.to_string(),
            })?;
        block.resize(size, 0);

        let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock().insert(key, block);
        Ok(key)
    }

    /// Release the block for `key`
    pub fn free(&self, key: u64) -> DeviceResult<()> {
        self.blocks
            .lock()
            .remove(&key)
            .map(|_| ())
            .ok_or(DeviceError::InvalidAllocation(key))
    }

    /// Overwrite the block with `src` (lengths must match)
    pub fn write(&self, key: u64, src: &[u8]) -> DeviceResult<()> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(&key)
            .ok_or(DeviceError::InvalidAllocation(key))?;
        check_len(block.len(), src.len())?;
        block.copy_from_slice(src);
        Ok(())
    }

    /// Copy the block into `dest` (lengths must match)
    pub fn read(&self, key: u64, dest: &mut [u8]) -> DeviceResult<()> {
        let blocks = self.blocks.lock();
        let block = blocks.get(&key).ok_or(DeviceError::InvalidAllocation(key))?;
        check_len(block.len(), dest.len())?;
        dest.copy_from_slice(block);
        Ok(())
    }

    /// Run `f` with exclusive access to the blocks named by `keys`
    ///
    /// `f` receives one slot per distinct key plus, for each position in
    /// `keys`, the index of its slot. Repeated keys share a slot.
    pub fn with_blocks<T, F>(&self, keys: &[u64], f: F) -> DeviceResult<T>
    where
        F: FnOnce(&mut [Vec<u8>], &[usize]) -> DeviceResult<T>,
    {
        let mut blocks = self.blocks.lock();

        let mut unique: Vec<u64> = Vec::with_capacity(keys.len());
        let mut args = Vec::with_capacity(keys.len());
        for key in keys {
            let slot = match unique.iter().position(|k| k == key) {
                Some(slot) => slot,
                None => {
                    if !blocks.contains_key(key) {
                        return Err(DeviceError::InvalidAllocation(*key));
                    }
                    unique.push(*key);
                    unique.len() - 1
                }
            };
            args.push(slot);
        }

        let mut slots: Vec<Vec<u8>> = unique
            .iter()
            .map(|key| blocks.remove(key).unwrap_or_default())
            .collect();
        let result = f(&mut slots, &args);
        for (key, block) in unique.into_iter().zip(slots) {
            blocks.insert(key, block);
        }
        result
    }

    pub fn usage(&self) -> MemoryUsage {
        let blocks = self.blocks.lock();
        MemoryUsage {
            allocations: blocks.len(),
            bytes: blocks.values().map(Vec::len).sum(),
        }
    }
}

fn check_len(expected: usize, actual: usize) -> DeviceResult<()> {
    if expected != actual {
        return Err(DeviceError::SizeMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed() {
        let mem = HostMemory::new();
        let key = mem.alloc(8).unwrap();
        let mut out = [0xFFu8; 8];
        mem.read(key, &mut out).unwrap();
        assert_eq!(out, [0; 8]);
        assert_eq!(
            mem.usage(),
            MemoryUsage {
                allocations: 1,
                bytes: 8
            }
        );
    }

    #[test]
    fn test_free_releases() {
        let mem = HostMemory::new();
        let key = mem.alloc(4).unwrap();
        mem.free(key).unwrap();
        assert_eq!(mem.usage(), MemoryUsage::default());
        assert!(matches!(mem.free(key), Err(DeviceError::InvalidAllocation(k)) if k == key));
    }

    #[test]
    fn test_length_checked() {
        let mem = HostMemory::new();
        let key = mem.alloc(4).unwrap();
        assert!(matches!(
            mem.write(key, &[1, 2]),
            Err(DeviceError::SizeMismatch {
                expected: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_keys_unique_across_instances() {
        let a = HostMemory::new();
        let b = HostMemory::new();
        let ka = a.alloc(1).unwrap();
        let kb = b.alloc(1).unwrap();
        assert_ne!(ka, kb);
        assert!(b.write(ka, &[1]).is_err());
    }

    #[test]
    fn test_with_blocks_restores_and_dedups() {
        let mem = HostMemory::new();
        let k1 = mem.alloc(1).unwrap();
        let k2 = mem.alloc(1).unwrap();
        mem.with_blocks(&[k1, k2, k1], |slots, args| {
            assert_eq!(slots.len(), 2);
            assert_eq!(args, &[0, 1, 0]);
            slots[0][0] = 7;
            Ok(())
        })
        .unwrap();

        let mut out = [0u8; 1];
        mem.read(k1, &mut out).unwrap();
        assert_eq!(out, [7]);
        assert_eq!(mem.usage().allocations, 2);

        let missing = mem.with_blocks(&[k1, 9999_9999], |_, _| Ok(()));
        assert!(missing.is_err());
        assert_eq!(mem.usage().allocations, 2);
    }
}
