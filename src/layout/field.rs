//! `FieldInfo` layouts

use super::{Raw, StructKind};
use crate::memory::NativeHandle;
use crate::version::UnityVersion;

#[derive(Debug)]
pub struct FieldLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,
    pub name: u16,
    pub type_: u16,
    pub parent: u16,
    pub offset: u16,
    /// Slot 28 holds the custom attribute index before 2019.1 ...
    pub custom_attribute_index: Option<u16>,
    /// ... and the metadata token after
    pub token: Option<u16>,
}

pub static FIELD_19_0: FieldLayout = FieldLayout {
    label: "FieldInfo_19_0",
    since: UnityVersion::new(5, 3, 2),
    size: 32,
    name: 0,
    type_: 8,
    parent: 16,
    offset: 24,
    custom_attribute_index: Some(28),
    token: None,
};

pub static FIELD_24_1: FieldLayout = FieldLayout {
    label: "FieldInfo_24_1",
    since: UnityVersion::new(2019, 1, 0),
    size: 32,
    name: 0,
    type_: 8,
    parent: 16,
    offset: 24,
    custom_attribute_index: None,
    token: Some(28),
};

pub static LAYOUTS: [&FieldLayout; 2] = [&FIELD_19_0, &FIELD_24_1];

/// A native `FieldInfo`
#[derive(Clone, Copy)]
pub struct FieldStruct {
    raw: Raw,
    layout: &'static FieldLayout,
}

layout_descriptor!(FieldLayout, FieldStruct, StructKind::FieldInfo);

impl FieldStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static FieldLayout) -> Self {
        FieldStruct { raw: Raw::new(ptr), layout }
    }

    handle_fields! {
        name, set_name => name;
        /// The field's `Il2CppType`
        field_type, set_field_type => type_;
        parent, set_parent => parent;
    }

    value_fields! {
        /// Byte offset inside an instance, header included
        offset, set_offset: i32 => offset;
    }

    optional_value_fields! {
        custom_attribute_index, set_custom_attribute_index: i32 => custom_attribute_index;
        token, set_token: u32 => token;
    }

    pub fn name_str(&self) -> Option<String> {
        self.raw.cstr(self.layout.name)
    }
}
