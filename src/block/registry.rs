// ============================================================================
// src/block/registry.rs - Injectable Block Device Registry
// ============================================================================
//! Registry of live block devices, keyed by opaque handles.
//!
//! Deliberately not process-global: callers construct a registry and pass
//! it by reference, so tests can build independent registries without
//! shared state. Slots are recycled, which keeps handles dense.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::device::BlockDevice;

/// Opaque handle into a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(usize);

/// Block device registry (arena + index)
pub struct DeviceRegistry {
    slots: Mutex<Vec<Option<Arc<dyn BlockDevice>>>>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Register a device, returning its handle
    pub fn register(&self, device: Arc<dyn BlockDevice>) -> DeviceHandle {
        let mut slots = self.slots.lock();
        // Reuse a freed slot if one exists
        if let Some(idx) = slots.iter().position(|s| s.is_none()) {
            slots[idx] = Some(device);
            return DeviceHandle(idx);
        }
        slots.push(Some(device));
        DeviceHandle(slots.len() - 1)
    }

    /// Look up a device by handle
    pub fn get(&self, handle: DeviceHandle) -> Option<Arc<dyn BlockDevice>> {
        self.slots.lock().get(handle.0)?.clone()
    }

    /// Remove a device, returning it if it was present
    pub fn unregister(&self, handle: DeviceHandle) -> Option<Arc<dyn BlockDevice>> {
        self.slots.lock().get_mut(handle.0)?.take()
    }

    /// Handles of all registered devices
    pub fn handles(&self) -> Vec<DeviceHandle> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| DeviceHandle(i))
            .collect()
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
