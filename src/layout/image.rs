//! `Il2CppImage` layouts

use super::{Raw, StructKind};
use crate::memory::NativeHandle;
use crate::version::UnityVersion;

#[derive(Debug)]
pub struct ImageLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,
    pub name: u16,
    /// Only present from 2018.1
    pub name_no_ext: Option<u16>,
    pub assembly: u16,
    pub type_count: u16,
    pub exported_type_count: u16,
    pub name_to_class_hash_table: u16,
    pub token: u16,
    pub dynamic: u16,
}

pub static IMAGE_19_0: ImageLayout = ImageLayout {
    label: "Image_19_0",
    since: UnityVersion::new(5, 3, 2),
    size: 56,
    name: 0,
    name_no_ext: None,
    assembly: 8,
    type_count: 20,
    exported_type_count: 28,
    name_to_class_hash_table: 40,
    token: 48,
    dynamic: 52,
};

pub static IMAGE_24_2: ImageLayout = ImageLayout {
    label: "Image_24_2",
    since: UnityVersion::new(2018, 1, 0),
    size: 64,
    name: 0,
    name_no_ext: Some(8),
    assembly: 16,
    type_count: 28,
    exported_type_count: 36,
    name_to_class_hash_table: 48,
    token: 56,
    dynamic: 60,
};

/// 2020.2 onwards: type ranges are replaced by a metadata handle
pub static IMAGE_27_0: ImageLayout = ImageLayout {
    label: "Image_27_0",
    since: UnityVersion::new(2020, 2, 0),
    size: 72,
    name: 0,
    name_no_ext: Some(8),
    assembly: 16,
    type_count: 24,
    exported_type_count: 28,
    name_to_class_hash_table: 48,
    token: 64,
    dynamic: 68,
};

pub static LAYOUTS: [&ImageLayout; 3] = [&IMAGE_19_0, &IMAGE_24_2, &IMAGE_27_0];

/// A native `Il2CppImage`
#[derive(Clone, Copy)]
pub struct ImageStruct {
    raw: Raw,
    layout: &'static ImageLayout,
}

layout_descriptor!(ImageLayout, ImageStruct, StructKind::Image);

impl ImageStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static ImageLayout) -> Self {
        ImageStruct { raw: Raw::new(ptr), layout }
    }

    /// Whether this lineage stores the file name without extension
    pub fn has_name_no_ext(&self) -> bool {
        self.layout.name_no_ext.is_some()
    }

    handle_fields! {
        name, set_name => name;
        assembly, set_assembly => assembly;
        name_to_class_hash_table, set_name_to_class_hash_table => name_to_class_hash_table;
    }

    optional_handle_fields! {
        name_no_ext, set_name_no_ext => name_no_ext;
    }

    value_fields! {
        type_count, set_type_count: u32 => type_count;
        exported_type_count, set_exported_type_count: u32 => exported_type_count;
        token, set_token: u32 => token;
    }

    pub fn dynamic(&self) -> bool {
        self.raw.get::<u8>(self.layout.dynamic) != 0
    }

    pub fn set_dynamic(&self, dynamic: bool) {
        self.raw.set::<u8>(self.layout.dynamic, dynamic as u8)
    }

    pub fn name_str(&self) -> Option<String> {
        self.raw.cstr(self.layout.name)
    }
}
