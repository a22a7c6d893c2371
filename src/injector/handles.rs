//! Links from native instances to their managed counterparts
//!
//! Each native instance of an injected class carries an [`InjectedClassData`]
//! record in its last pointer-sized slot. The record stores the id of a strong
//! handle in a [`GcHandleTable`], which owns the `ManagedObject` until the
//! native finalizer releases it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::managed::ManagedObject;
use crate::memory::{self, NativeHandle, SIZE_OF_PTR};

/// Trailing side record of an injected instance
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectedClassData {
    /// Id in the injector's handle table, 0 before construction
    pub managed_gc_handle: usize,
}

impl InjectedClassData {
    pub const SIZE: usize = SIZE_OF_PTR;

    /// Offset of the record inside an instance of `instance_size` bytes
    pub fn offset(instance_size: u32) -> usize {
        (instance_size as usize).saturating_sub(Self::SIZE)
    }

    /// # Safety
    /// `object` must be an instance of an injected class of `instance_size` bytes.
    pub unsafe fn read(object: NativeHandle, instance_size: u32) -> Self {
        memory::read(object, Self::offset(instance_size))
    }

    /// # Safety
    /// Same as [`InjectedClassData::read`].
    pub unsafe fn write(object: NativeHandle, instance_size: u32, data: Self) {
        memory::write(object, Self::offset(instance_size), data)
    }
}

/// Strong handles to managed objects, keyed by a non-zero id
#[derive(Debug)]
pub struct GcHandleTable {
    objects: DashMap<u32, Arc<ManagedObject>>,
    next: AtomicU32,
}

impl Default for GcHandleTable {
    fn default() -> Self {
        GcHandleTable { objects: DashMap::new(), next: AtomicU32::new(1) }
    }
}

impl GcHandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: Arc<ManagedObject>) -> u32 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(id, object);
        id
    }

    pub fn get(&self, id: u32) -> Option<Arc<ManagedObject>> {
        self.objects.get(&id).map(|entry| entry.value().clone())
    }

    /// Release a handle; `None` if it was already freed
    pub fn remove(&self, id: u32) -> Option<Arc<ManagedObject>> {
        self.objects.remove(&id).map(|(_, object)| object)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
