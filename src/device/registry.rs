//! Device registry
//!
//! Maps device kinds to factories and caches one instance per canonical
//! name. Names are `KIND` or `KIND:N` with `N` at most [`MAX_ORDINAL`];
//! the kind is matched case-insensitively. Only registered kinds are
//! cached, so the cache holds at most `MAX_ORDINAL + 2` devices per kind.

use super::{Device, DeviceError, DeviceResult, HostDevice, NullDevice};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Highest accepted `KIND:N` ordinal
pub const MAX_ORDINAL: u32 = 15;

/// Builds a device instance for a canonical name
pub type DeviceFactory = Box<dyn Fn(&str) -> DeviceResult<Arc<dyn Device>> + Send + Sync>;

/// Named device lookup shared by all sessions of a server
pub struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
    instances: Mutex<HashMap<String, Arc<dyn Device>>>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the built-in `CPU` and `NULL` backends
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("CPU", |name| Ok(Arc::new(HostDevice::new(name)) as Arc<dyn Device>));
        registry.register("NULL", |name| Ok(Arc::new(NullDevice::new(name)) as Arc<dyn Device>));
        registry
    }

    /// Register (or replace) the factory for a device kind
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&str) -> DeviceResult<Arc<dyn Device>> + Send + Sync + 'static,
    {
        self.factories
            .insert(kind.trim().to_uppercase(), Box::new(factory));
    }

    /// Normalize `cpu:1` to `CPU:1`
    pub fn canonical_name(name: &str) -> DeviceResult<String> {
        let trimmed = name.trim();
        let (kind, ordinal) = match trimmed.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (trimmed, None),
        };
        if kind.is_empty() || !kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DeviceError::UnknownDevice(name.to_string()));
        }
        let kind = kind.to_uppercase();
        match ordinal {
            None => Ok(kind),
            Some(ordinal) => {
                match ordinal.parse::<u32>() {
                    Ok(n) if n <= MAX_ORDINAL => Ok(format!("{}:{}", kind, n)),
                    _ => Err(DeviceError::UnknownDevice(name.to_string())),
                }
            }
        }
    }

    /// Look up (creating on first use) the device called `name`
    pub fn get(&self, name: &str) -> DeviceResult<Arc<dyn Device>> {
        let canonical = Self::canonical_name(name)?;
        let kind = canonical.split(':').next().unwrap_or(&canonical);
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))?;

        let mut instances = self.instances.lock();
        if let Some(device) = instances.get(&canonical) {
            return Ok(Arc::clone(device));
        }
        let device = factory(&canonical)?;
        log::debug!("created device {}", canonical);
        instances.insert(canonical, Arc::clone(&device));
        Ok(device)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
