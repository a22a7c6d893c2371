//! `PropertyInfo` layouts

use super::{Raw, StructKind};
use crate::memory::NativeHandle;
use crate::version::UnityVersion;

#[derive(Debug)]
pub struct PropertyLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,
    pub parent: u16,
    pub name: u16,
    pub get: u16,
    pub set: u16,
    pub attrs: u16,
    pub custom_attribute_index: Option<u16>,
    pub token: u16,
}

pub static PROPERTY_16_0: PropertyLayout = PropertyLayout {
    label: "PropertyInfo_16_0",
    since: UnityVersion::new(5, 2, 0),
    size: 48,
    parent: 0,
    name: 8,
    get: 16,
    set: 24,
    attrs: 32,
    custom_attribute_index: Some(36),
    token: 40,
};

pub static PROPERTY_24_1: PropertyLayout = PropertyLayout {
    label: "PropertyInfo_24_1",
    since: UnityVersion::new(2018, 3, 0),
    size: 40,
    parent: 0,
    name: 8,
    get: 16,
    set: 24,
    attrs: 32,
    custom_attribute_index: None,
    token: 36,
};

pub static LAYOUTS: [&PropertyLayout; 2] = [&PROPERTY_16_0, &PROPERTY_24_1];

/// A native `PropertyInfo`
#[derive(Clone, Copy)]
pub struct PropertyStruct {
    raw: Raw,
    layout: &'static PropertyLayout,
}

layout_descriptor!(PropertyLayout, PropertyStruct, StructKind::PropertyInfo);

impl PropertyStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static PropertyLayout) -> Self {
        PropertyStruct { raw: Raw::new(ptr), layout }
    }

    handle_fields! {
        parent, set_parent => parent;
        name, set_name => name;
        /// Getter `MethodInfo*`
        get_method, set_get_method => get;
        /// Setter `MethodInfo*`
        set_method, set_set_method => set;
    }

    value_fields! {
        attrs, set_attrs: u32 => attrs;
        token, set_token: u32 => token;
    }

    optional_value_fields! {
        custom_attribute_index, set_custom_attribute_index: i32 => custom_attribute_index;
    }

    pub fn name_str(&self) -> Option<String> {
        self.raw.cstr(self.layout.name)
    }
}
