//! Per-session handle tables
//!
//! Buffer handles pair a backend allocation with a host shadow buffer of the
//! same size and are addressed by counter-assigned identifiers. Program
//! handles are keyed by identifiers the client picks.

use super::SessionError;
use crate::device::{Allocation, BufferOptions, Device, DeviceResult, Program};
use std::collections::HashMap;
use std::sync::Arc;

/// One device allocation visible to the client
pub struct BufferHandle {
    allocation: Option<Allocation>,
    shadow: Vec<u8>,
    options: BufferOptions,
    device: Arc<dyn Device>,
}

impl BufferHandle {
    pub fn new(allocation: Allocation, options: BufferOptions, device: Arc<dyn Device>) -> Self {
        let shadow = vec![0u8; allocation.size()];
        Self {
            allocation: Some(allocation),
            shadow,
            options,
            device,
        }
    }

    /// Backend token; present until the handle is released
    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    /// Shadow buffer length, fixed at allocation time
    pub fn len(&self) -> usize {
        self.shadow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shadow.is_empty()
    }

    /// Device that owns the allocation
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Fill the shadow buffer (via `fill`) then copy it to the device
    pub fn copy_in_with<E, F>(&mut self, fill: F) -> Result<(), E>
    where
        F: FnOnce(&mut [u8]) -> Result<(), E>,
        E: From<crate::device::DeviceError>,
    {
        fill(&mut self.shadow)?;
        if let Some(allocation) = &self.allocation {
            self.device.allocator().copy_in(allocation, &self.shadow)?;
        }
        Ok(())
    }

    /// Copy the device allocation into the shadow buffer and return it
    pub fn copy_out(&mut self) -> DeviceResult<&[u8]> {
        if let Some(allocation) = &self.allocation {
            self.device
                .allocator()
                .copy_out(&mut self.shadow, allocation)?;
        }
        Ok(&self.shadow)
    }

    /// Hand the allocation back to its device
    pub fn release(mut self, options: &BufferOptions) -> DeviceResult<()> {
        match self.allocation.take() {
            Some(allocation) => self.device.allocator().free(allocation, options),
            None => Ok(()),
        }
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let size = allocation.size();
            if let Err(e) = self.device.allocator().free(allocation, &self.options) {
                log::warn!(
                    "failed to release {} byte allocation on {}: {}",
                    size,
                    self.device.name(),
                    e
                );
            }
        }
    }
}

/// Buffer identifier -> handle
#[derive(Default)]
pub struct BufferTable {
    handles: HashMap<u64, BufferHandle>,
    next_id: u64,
}

impl BufferTable {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register a handle under a fresh identifier
    pub fn insert(&mut self, handle: BufferHandle) -> u64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.handles.insert(id, handle);
        id
    }

    pub fn get(&self, id: u64) -> Result<&BufferHandle, SessionError> {
        self.handles.get(&id).ok_or(SessionError::UnknownBuffer(id))
    }

    pub fn get_mut(&mut self, id: u64) -> Result<&mut BufferHandle, SessionError> {
        self.handles
            .get_mut(&id)
            .ok_or(SessionError::UnknownBuffer(id))
    }

    pub fn remove(&mut self, id: u64) -> Result<BufferHandle, SessionError> {
        self.handles
            .remove(&id)
            .ok_or(SessionError::UnknownBuffer(id))
    }

    /// Resolve identifiers to backend tokens, in order
    pub fn resolve(&self, ids: &[u64]) -> Result<Vec<&Allocation>, SessionError> {
        ids.iter()
            .map(|&id| {
                self.get(id)?
                    .allocation()
                    .ok_or(SessionError::UnknownBuffer(id))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Program identifier -> loaded executable
#[derive(Default)]
pub struct ProgramTable {
    programs: HashMap<u64, Box<dyn Program>>,
}

impl ProgramTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `program`, returning true if it replaced an earlier entry
    pub fn insert(&mut self, id: u64, program: Box<dyn Program>) -> bool {
        self.programs.insert(id, program).is_some()
    }

    pub fn get(&self, id: u64) -> Result<&dyn Program, SessionError> {
        self.programs
            .get(&id)
            .map(|p| p.as_ref())
            .ok_or(SessionError::UnknownProgram(id))
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HostDevice, NullDevice};

    fn host() -> (Arc<HostDevice>, Arc<dyn Device>) {
        let host = Arc::new(HostDevice::new("CPU"));
        let device: Arc<dyn Device> = host.clone();
        (host, device)
    }

    fn handle(device: &Arc<dyn Device>, size: usize) -> BufferHandle {
        let opts = BufferOptions::default();
        let alloc = device.allocator().alloc(size, &opts).unwrap();
        BufferHandle::new(alloc, opts, Arc::clone(device))
    }

    #[test]
    fn test_ids_are_counter_assigned() {
        let (_, device) = host();
        let mut table = BufferTable::new();
        let a = table.insert(handle(&device, 4));
        let b = table.insert(handle(&device, 4));
        assert_eq!((a, b), (1, 2));
        table.remove(a).unwrap();
        let c = table.insert(handle(&device, 4));
        assert_eq!(c, 3);
    }

    #[test]
    fn test_shadow_matches_allocation() {
        let (_, device) = host();
        let mut table = BufferTable::new();
        let id = table.insert(handle(&device, 24));
        assert_eq!(table.get(id).unwrap().len(), 24);
    }

    #[test]
    fn test_unknown_ids() {
        let mut table = BufferTable::new();
        assert!(matches!(table.get(5), Err(SessionError::UnknownBuffer(5))));
        assert!(matches!(table.remove(5), Err(SessionError::UnknownBuffer(5))));
        assert!(matches!(table.resolve(&[5]), Err(SessionError::UnknownBuffer(5))));

        let programs = ProgramTable::new();
        assert!(matches!(programs.get(1), Err(SessionError::UnknownProgram(1))));
    }

    #[test]
    fn test_release_and_drop_free_backend_memory() {
        let (host, device) = host();
        let mut table = BufferTable::new();
        let a = table.insert(handle(&device, 8));
        table.insert(handle(&device, 8));
        assert_eq!(host.memory_in_use().allocations, 2);

        table
            .remove(a)
            .unwrap()
            .release(&BufferOptions::default())
            .unwrap();
        assert_eq!(host.memory_in_use().allocations, 1);

        drop(table);
        assert_eq!(host.memory_in_use().allocations, 0);
    }

    #[test]
    fn test_copy_through_shadow() {
        let (_, device) = host();
        let mut buf = handle(&device, 3);
        buf.copy_in_with(|shadow| {
            shadow.copy_from_slice(&[7, 8, 9]);
            Ok::<(), crate::device::DeviceError>(())
        })
        .unwrap();
        assert_eq!(buf.copy_out().unwrap(), &[7, 8, 9]);
    }

    #[test]
    fn test_program_overwrite() {
        let null = NullDevice::new("NULL");
        let mut programs = ProgramTable::new();
        let rt = crate::device::Runtime::load(&null, "k", b"").unwrap();
        assert!(!programs.insert(4, rt));
        let rt = crate::device::Runtime::load(&null, "k", b"").unwrap();
        assert!(programs.insert(4, rt));
        assert_eq!(programs.len(), 1);
    }
}
