//! `Il2CppAssembly` and `Il2CppAssemblyName` layouts
//!
//! The assembly embeds its name struct, so an assembly wrapper also carries the
//! name layout that was active when it was wrapped.

use super::{Raw, StructKind};
use crate::memory::NativeHandle;
use crate::version::UnityVersion;

#[derive(Debug)]
pub struct AssemblyNameLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,
    pub name: u16,
    pub culture: u16,
    /// Dropped in 2018.3
    pub hash_value: Option<u16>,
    pub public_key: u16,
    pub hash_alg: u16,
    pub hash_len: u16,
    pub flags: u16,
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
    pub public_key_token: u16,
}

pub static ASSEMBLY_NAME_16_0: AssemblyNameLayout = AssemblyNameLayout {
    label: "AssemblyName_16_0",
    since: UnityVersion::new(5, 2, 0),
    size: 72,
    name: 0,
    culture: 8,
    hash_value: Some(16),
    public_key: 24,
    hash_alg: 32,
    hash_len: 36,
    flags: 40,
    major: 44,
    minor: 48,
    build: 52,
    revision: 56,
    public_key_token: 60,
};

pub static ASSEMBLY_NAME_24_1: AssemblyNameLayout = AssemblyNameLayout {
    label: "AssemblyName_24_1",
    since: UnityVersion::new(2018, 3, 0),
    size: 64,
    name: 0,
    culture: 8,
    hash_value: None,
    public_key: 16,
    hash_alg: 24,
    hash_len: 28,
    flags: 32,
    major: 36,
    minor: 40,
    build: 44,
    revision: 48,
    public_key_token: 52,
};

pub static NAME_LAYOUTS: [&AssemblyNameLayout; 2] = [&ASSEMBLY_NAME_16_0, &ASSEMBLY_NAME_24_1];

#[derive(Debug)]
pub struct AssemblyLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,
    pub image: u16,
    pub custom_attribute_index: Option<u16>,
    pub token: Option<u16>,
    pub referenced_assembly_start: u16,
    pub referenced_assembly_count: u16,
    /// Inline `Il2CppAssemblyName`
    pub aname: u16,
}

pub static ASSEMBLY_16_0: AssemblyLayout = AssemblyLayout {
    label: "Assembly_16_0",
    since: UnityVersion::new(5, 2, 0),
    size: 24 + 72,
    image: 0,
    custom_attribute_index: Some(8),
    token: None,
    referenced_assembly_start: 12,
    referenced_assembly_count: 16,
    aname: 24,
};

pub static ASSEMBLY_24_1: AssemblyLayout = AssemblyLayout {
    label: "Assembly_24_1",
    since: UnityVersion::new(2018, 3, 0),
    size: 24 + 64,
    image: 0,
    custom_attribute_index: None,
    token: Some(8),
    referenced_assembly_start: 12,
    referenced_assembly_count: 16,
    aname: 24,
};

pub static LAYOUTS: [&AssemblyLayout; 2] = [&ASSEMBLY_16_0, &ASSEMBLY_24_1];

/// A native `Il2CppAssemblyName`
#[derive(Clone, Copy)]
pub struct AssemblyNameStruct {
    raw: Raw,
    layout: &'static AssemblyNameLayout,
}

layout_descriptor!(AssemblyNameLayout, AssemblyNameStruct, StructKind::AssemblyName);

impl AssemblyNameStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static AssemblyNameLayout) -> Self {
        AssemblyNameStruct { raw: Raw::new(ptr), layout }
    }

    handle_fields! {
        name, set_name => name;
        culture, set_culture => culture;
        public_key, set_public_key => public_key;
    }

    optional_handle_fields! {
        hash_value, set_hash_value => hash_value;
    }

    value_fields! {
        hash_alg, set_hash_alg: u32 => hash_alg;
        hash_len, set_hash_len: i32 => hash_len;
        flags, set_flags: u32 => flags;
        major, set_major: i32 => major;
        minor, set_minor: i32 => minor;
        build, set_build: i32 => build;
        revision, set_revision: i32 => revision;
        public_key_token, set_public_key_token: [u8; 8] => public_key_token;
    }

    pub fn name_str(&self) -> Option<String> {
        self.raw.cstr(self.layout.name)
    }
}

/// A native `Il2CppAssembly`
#[derive(Clone, Copy)]
pub struct AssemblyStruct {
    raw: Raw,
    layout: &'static AssemblyLayout,
    names: &'static AssemblyNameLayout,
}

layout_descriptor!(AssemblyLayout, AssemblyStruct, StructKind::Assembly);

impl AssemblyStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static AssemblyLayout, names: &'static AssemblyNameLayout) -> Self {
        AssemblyStruct { raw: Raw::new(ptr), layout, names }
    }

    handle_fields! {
        image, set_image => image;
    }

    value_fields! {
        referenced_assembly_start, set_referenced_assembly_start: i32 => referenced_assembly_start;
        referenced_assembly_count, set_referenced_assembly_count: i32 => referenced_assembly_count;
    }

    optional_value_fields! {
        token, set_token: u32 => token;
        custom_attribute_index, set_custom_attribute_index: i32 => custom_attribute_index;
    }

    /// The embedded assembly name
    pub fn name(&self) -> AssemblyNameStruct {
        AssemblyNameStruct::new(self.ptr().add(self.layout.aname as usize), self.names)
    }
}
