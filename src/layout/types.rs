//! `Il2CppType` layouts

use super::{BitSlot, Raw, StructKind};
use crate::common::{FieldAttributes, TypeCode};
use crate::memory::{self, NativeHandle};
use crate::version::UnityVersion;

/// Offsets of `Il2CppType` for one lineage
#[derive(Debug)]
pub struct TypeLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,
    /// Class index, generic class, element type... depending on `type`
    pub data: u16,
    pub attrs: u16,
    pub type_code: u16,
    pub byref: BitSlot,
    pub pinned: BitSlot,
    /// Only packed since 2021.1
    pub valuetype: Option<BitSlot>,
}

/// `num_mods:6, byref:1, pinned:1`
pub static TYPE_16_0: TypeLayout = TypeLayout {
    label: "Type_16_0",
    since: UnityVersion::new(5, 2, 0),
    size: 16,
    data: 0,
    attrs: 8,
    type_code: 10,
    byref: BitSlot::new(11, 6),
    pinned: BitSlot::new(11, 7),
    valuetype: None,
};

/// `num_mods:5, byref:1, pinned:1, valuetype:1`
pub static TYPE_27_0: TypeLayout = TypeLayout {
    label: "Type_27_0",
    since: UnityVersion::new(2021, 1, 0),
    size: 16,
    data: 0,
    attrs: 8,
    type_code: 10,
    byref: BitSlot::new(11, 5),
    pinned: BitSlot::new(11, 6),
    valuetype: Some(BitSlot::new(11, 7)),
};

pub static LAYOUTS: [&TypeLayout; 2] = [&TYPE_16_0, &TYPE_27_0];

/// A native `Il2CppType`
#[derive(Clone, Copy)]
pub struct TypeStruct {
    raw: Raw,
    layout: &'static TypeLayout,
}

layout_descriptor!(TypeLayout, TypeStruct, StructKind::Type);

impl TypeStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static TypeLayout) -> Self {
        TypeStruct { raw: Raw::new(ptr), layout }
    }

    handle_fields! {
        data, set_data => data;
    }

    bit_fields! {
        by_ref, set_by_ref => byref;
        pinned, set_pinned => pinned;
    }

    optional_bit_fields! {
        value_type, set_value_type => valuetype;
    }

    pub fn attrs(&self) -> FieldAttributes {
        FieldAttributes::from_bits_retain(self.raw.get::<u16>(self.layout.attrs))
    }

    pub fn set_attrs(&self, attrs: FieldAttributes) {
        self.raw.set::<u16>(self.layout.attrs, attrs.bits())
    }

    pub fn type_code(&self) -> TypeCode {
        TypeCode::from_raw(self.raw.get::<u8>(self.layout.type_code))
    }

    pub fn set_type_code(&self, code: TypeCode) {
        self.raw.set::<u8>(self.layout.type_code, code as u8)
    }

    /// Overwrite this type with the bytes of `other`
    pub fn copy_from(&self, other: &TypeStruct) {
        let len = self.layout.size.min(other.layout.size) as usize;
        // Safety: both wrappers cover at least `len` bytes
        unsafe { memory::copy(other.ptr(), self.ptr(), len) }
    }
}
