//! Synthetic class tokens
//!
//! Injected classes have no metadata definition, so their type descriptors
//! carry a negative token in the `data` slot instead of a definition index.
//! The `Class::FromIl2CppType` interceptor maps those back to the class and
//! hands every other type to the runtime's own implementation.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use tracing::error;

use crate::error::{InteropError, Result};
use crate::il2cpp::ClassFromTypeFn;
use crate::memory::{self, NativeHandle};

static CLASSES: Lazy<DashMap<i64, NativeHandle>> = Lazy::new(DashMap::new);
static NEXT_TOKEN: AtomicI64 = AtomicI64::new(-2);
static ORIGINAL: OnceCell<ClassFromTypeFn> = OnceCell::new();
static DATA_OFFSET: OnceCell<usize> = OnceCell::new();

/// Reserve a fresh token for `class`
pub fn assign(class: NativeHandle) -> i64 {
    let token = NEXT_TOKEN.fetch_sub(1, Ordering::Relaxed);
    CLASSES.insert(token, class);
    token
}

pub fn class_for_token(token: i64) -> Option<NativeHandle> {
    CLASSES.get(&token).map(|entry| *entry.value())
}

/// Remember the intercepted function and where type descriptors keep `data`
///
/// Recording the same values again is fine; anything else is refused since
/// the interceptor already forwards to the first original.
pub(crate) fn set_original(original: ClassFromTypeFn, data_offset: usize) -> Result<()> {
    let stored = *ORIGINAL.get_or_init(|| original);
    if stored as usize != original as usize {
        return Err(InteropError::Hook {
            target: NativeHandle::from_addr(original as usize),
            reason: format!("Class::FromIl2CppType already forwards to {}", NativeHandle::from_addr(stored as usize)),
        });
    }
    let stored_offset = *DATA_OFFSET.get_or_init(|| data_offset);
    if stored_offset != data_offset {
        return Err(InteropError::Hook {
            target: NativeHandle::from_addr(original as usize),
            reason: format!("type data is already read at offset {}, not {}", stored_offset, data_offset),
        });
    }
    Ok(())
}

/// Replacement for `Class::FromIl2CppType`
///
/// # Safety
/// Called by the runtime with a type descriptor or null.
pub(crate) unsafe extern "C" fn class_from_type_hook(ty: NativeHandle) -> NativeHandle {
    if !ty.is_null() {
        let data = memory::read::<i64>(ty, DATA_OFFSET.get().copied().unwrap_or_default());
        if data < 0 {
            if let Some(class) = class_for_token(data) {
                return class;
            }
        }
    }
    match ORIGINAL.get() {
        Some(original) => original(ty),
        None => {
            error!("Class::FromIl2CppType is intercepted but the original was not recorded");
            NativeHandle::NULL
        }
    }
}

pub(crate) fn hook_address() -> NativeHandle {
    NativeHandle::from_addr(class_from_type_hook as usize)
}
