//! `ParameterInfo` layouts
//!
//! From 2021.2 the runtime stores bare `Il2CppType*` entries instead of
//! `ParameterInfo` records, so names, positions and tokens are gone.

use super::{Raw, StructKind};
use crate::memory::NativeHandle;
use crate::version::UnityVersion;

#[derive(Debug)]
pub struct ParameterLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,
    pub name: Option<u16>,
    pub position: Option<u16>,
    pub token: Option<u16>,
    pub parameter_type: u16,
}

pub static PARAMETER_16_0: ParameterLayout = ParameterLayout {
    label: "ParameterInfo_16_0",
    since: UnityVersion::new(5, 2, 0),
    size: 24,
    name: Some(0),
    position: Some(8),
    token: Some(12),
    parameter_type: 16,
};

pub static PARAMETER_27_0: ParameterLayout = ParameterLayout {
    label: "ParameterInfo_27_0",
    since: UnityVersion::new(2021, 2, 0),
    size: 8,
    name: None,
    position: None,
    token: None,
    parameter_type: 0,
};

pub static LAYOUTS: [&ParameterLayout; 2] = [&PARAMETER_16_0, &PARAMETER_27_0];

impl ParameterLayout {
    pub fn has_name_position_token(&self) -> bool {
        self.name.is_some()
    }
}

/// A native `ParameterInfo` (or bare type entry)
#[derive(Clone, Copy)]
pub struct ParameterStruct {
    raw: Raw,
    layout: &'static ParameterLayout,
}

layout_descriptor!(ParameterLayout, ParameterStruct, StructKind::ParameterInfo);

impl ParameterStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static ParameterLayout) -> Self {
        ParameterStruct { raw: Raw::new(ptr), layout }
    }

    handle_fields! {
        parameter_type, set_parameter_type => parameter_type;
    }

    optional_handle_fields! {
        name, set_name => name;
    }

    optional_value_fields! {
        position, set_position: i32 => position;
        token, set_token: u32 => token;
    }

    pub fn name_str(&self) -> Option<String> {
        self.layout.name.and_then(|offset| self.raw.cstr(offset))
    }
}
