//! Typed views of the bridged fields of an injected instance

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::warn;

use super::managed::FieldKind;
use crate::il2cpp::Il2CppBridge;
use crate::memory::{self, NativeHandle};

#[derive(Debug, Clone)]
struct FieldSlot {
    offset: usize,
    kind: FieldKind,
}

/// Resolved offsets of one injected class's bridged fields
pub struct FieldBindings {
    bridge: Arc<Il2CppBridge>,
    slots: HashMap<String, FieldSlot>,
}

impl FieldBindings {
    pub(crate) fn new(bridge: Arc<Il2CppBridge>) -> Self {
        FieldBindings { bridge, slots: HashMap::new() }
    }

    /// Start from the bindings of an injected base class
    pub(crate) fn inherit(&mut self, base: &FieldBindings) {
        self.slots.extend(base.slots.iter().map(|(name, slot)| (name.clone(), slot.clone())));
    }

    pub(crate) fn bind(&mut self, name: &str, offset: usize, kind: FieldKind) {
        self.slots.insert(name.to_string(), FieldSlot { offset, kind });
    }

    pub fn offset(&self, name: &str) -> Option<usize> {
        self.slots.get(name).map(|slot| slot.offset)
    }

    pub(crate) fn reference(&self, object: NativeHandle, name: &str) -> Option<ReferenceField> {
        let slot = self.slots.get(name)?;
        match slot.kind {
            FieldKind::Reference(_) => {
                Some(ReferenceField { bridge: self.bridge.clone(), object, offset: slot.offset })
            }
            _ => None,
        }
    }

    pub(crate) fn value<T: Copy>(&self, object: NativeHandle, name: &str) -> Option<ValueField<T>> {
        let slot = self.slots.get(name)?;
        let FieldKind::Value(code) = slot.kind else {
            return None;
        };
        if std::mem::size_of::<T>() != code.size() {
            warn!(
                "Field {} is {} ({} bytes), not a {}-byte value",
                name,
                code,
                code.size(),
                std::mem::size_of::<T>()
            );
            return None;
        }
        Some(ValueField { object, offset: slot.offset, _marker: PhantomData })
    }

    pub(crate) fn string(&self, object: NativeHandle, name: &str) -> Option<StringField> {
        let slot = self.slots.get(name)?;
        match slot.kind {
            FieldKind::String => Some(StringField { bridge: self.bridge.clone(), object, offset: slot.offset }),
            _ => None,
        }
    }
}

impl fmt::Debug for FieldBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.slots.iter().map(|(name, slot)| (name, slot.offset))).finish()
    }
}

/// An object reference stored in the native instance
#[derive(Clone)]
pub struct ReferenceField {
    bridge: Arc<Il2CppBridge>,
    object: NativeHandle,
    offset: usize,
}

impl ReferenceField {
    pub fn get(&self) -> NativeHandle {
        // Safety: the offset was laid out inside the instance at registration
        unsafe { memory::read_handle(self.object, self.offset) }
    }

    /// Store through the write barrier
    pub fn set(&self, value: NativeHandle) {
        self.bridge.api().gc_wbarrier_set_field(self.object, self.object.add(self.offset), value)
    }
}

/// An inline value stored in the native instance
#[derive(Debug, Clone, Copy)]
pub struct ValueField<T> {
    object: NativeHandle,
    offset: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> ValueField<T> {
    pub fn get(&self) -> T {
        // Safety: the slot was sized for `T` at registration
        unsafe { memory::read(self.object, self.offset) }
    }

    pub fn set(&self, value: T) {
        // Safety: as above
        unsafe { memory::write(self.object, self.offset, value) }
    }
}

/// A `System.String` reference stored in the native instance
#[derive(Clone)]
pub struct StringField {
    bridge: Arc<Il2CppBridge>,
    object: NativeHandle,
    offset: usize,
}

impl StringField {
    pub fn get(&self) -> Option<String> {
        // Safety: see `ReferenceField::get`
        let string = unsafe { memory::read_handle(self.object, self.offset) };
        self.bridge.string_to_managed(string)
    }

    pub fn set(&self, value: Option<&str>) {
        let string = self.bridge.managed_to_string(value);
        self.bridge.api().gc_wbarrier_set_field(self.object, self.object.add(self.offset), string)
    }
}
