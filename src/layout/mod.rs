//! Version-adaptive layouts of the runtime's internal structs
//!
//! Each struct kind has one offset table per runtime lineage, declared as a
//! `static` in its module. A table names only the fields its lineage has;
//! wrappers capture the table they were created with, so accessors can never
//! read a field under a layout that lacks it.

use std::fmt;

use serde::Serialize;

use crate::memory::{self, NativeHandle};
use crate::version::UnityVersion;

#[macro_use]
mod accessors;

pub mod assembly;
pub mod class;
pub mod event;
pub mod exception;
pub mod field;
pub mod image;
pub mod method;
pub mod parameter;
pub mod property;
pub mod registry;
pub mod types;

pub use assembly::{AssemblyLayout, AssemblyNameLayout, AssemblyNameStruct, AssemblyStruct};
pub use class::{ClassLayout, ClassStruct, InterfaceOffsetPair, VirtualInvokeData};
pub use event::{EventLayout, EventStruct};
pub use exception::{ExceptionLayout, ExceptionStruct};
pub use field::{FieldLayout, FieldStruct};
pub use image::{ImageLayout, ImageStruct};
pub use method::{MethodLayout, MethodNameSlot, MethodStruct};
pub use parameter::{ParameterLayout, ParameterStruct};
pub use property::{PropertyLayout, PropertyStruct};
pub use registry::{ActiveLayouts, LayoutCatalog, LayoutRegistry};
pub use types::{TypeLayout, TypeStruct};

/// The native struct families that have version-specific layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum StructKind {
    Class,
    MethodInfo,
    FieldInfo,
    Image,
    Type,
    Assembly,
    AssemblyName,
    Exception,
    EventInfo,
    PropertyInfo,
    ParameterInfo,
}

impl StructKind {
    pub const ALL: [StructKind; 11] = [
        StructKind::Class,
        StructKind::MethodInfo,
        StructKind::FieldInfo,
        StructKind::Image,
        StructKind::Type,
        StructKind::Assembly,
        StructKind::AssemblyName,
        StructKind::Exception,
        StructKind::EventInfo,
        StructKind::PropertyInfo,
        StructKind::ParameterInfo,
    ];
}

impl fmt::Display for StructKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One lineage's layout of one struct kind
pub trait LayoutDescriptor: Send + Sync + 'static {
    const KIND: StructKind;

    /// Name of the lineage, e.g. `Class_24_1`
    fn label(&self) -> &'static str;

    /// First runtime version this layout applies to
    fn since(&self) -> UnityVersion;

    /// Native size in bytes
    fn size(&self) -> usize;
}

/// Pick the layout with the greatest `since` that is still `<= version`
///
/// `candidates` must be sorted descending by `since`.
pub fn select<L: LayoutDescriptor>(candidates: &[&'static L], version: UnityVersion) -> Option<&'static L> {
    candidates.iter().copied().find(|layout| layout.since() <= version)
}

/// Sort a layout family newest first
pub fn sort_descending<L: LayoutDescriptor>(candidates: &mut [&'static L]) {
    candidates.sort_by(|a, b| b.since().cmp(&a.since()));
}

/// Location of one boolean packed into a bitfield byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSlot {
    pub byte: u16,
    pub bit: u8,
}

impl BitSlot {
    pub const fn new(byte: u16, bit: u8) -> Self {
        BitSlot { byte, bit }
    }

    pub(crate) fn get(self, base: NativeHandle) -> bool {
        // Safety: bit slots always lie inside the struct they describe
        unsafe { memory::check_bit(base, self.byte as usize, self.bit) }
    }

    pub(crate) fn set(self, base: NativeHandle, value: bool) {
        // Safety: see `get`
        unsafe { memory::set_bit(base, self.byte as usize, self.bit, value) }
    }
}

/// How a struct holds an `Il2CppType`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSlot {
    /// Embedded in the struct at this offset
    Inline(u16),
    /// A pointer to a separately allocated type at this offset
    Pointer(u16),
}

/// Shared plumbing of every struct wrapper: a pointer and the layout it was wrapped with
#[derive(Clone, Copy)]
pub(crate) struct Raw(NativeHandle);

impl Raw {
    pub(crate) fn new(ptr: NativeHandle) -> Self {
        Raw(ptr)
    }

    pub(crate) fn ptr(self) -> NativeHandle {
        self.0
    }

    pub(crate) fn get<T: Copy>(self, offset: u16) -> T {
        // Safety: wrappers are only built over blocks of the layout's size,
        // and every offset comes from that layout's table
        unsafe { memory::read::<T>(self.0, offset as usize) }
    }

    pub(crate) fn set<T: Copy>(self, offset: u16, value: T) {
        // Safety: see `get`
        unsafe { memory::write::<T>(self.0, offset as usize, value) }
    }

    pub(crate) fn handle(self, offset: u16) -> NativeHandle {
        NativeHandle::from_addr(self.get::<usize>(offset))
    }

    pub(crate) fn set_handle(self, offset: u16, value: NativeHandle) {
        self.set::<usize>(offset, value.addr())
    }

    pub(crate) fn cstr(self, offset: u16) -> Option<String> {
        // Safety: string slots hold null or a NUL-terminated C string
        unsafe { memory::read_cstr(self.handle(offset)) }
    }
}
