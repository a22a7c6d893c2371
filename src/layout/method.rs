//! `MethodInfo` layouts

use super::{BitSlot, Raw, StructKind};
use crate::common::MethodAttributes;
use crate::memory::{self, NativeHandle};
use crate::version::UnityVersion;

/// Where a lineage keeps the method name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodNameSlot {
    /// A C string pointer in the struct itself
    Direct(u16),
    /// A pointer to a side table that holds the name pointer
    ExtraInfo { pointer: u16, name: u16, table_size: u16 },
}

/// Offsets of `MethodInfo` for one lineage
#[derive(Debug)]
pub struct MethodLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,

    pub method_pointer: u16,
    /// Separate entry for virtual calls, 2021.2 onwards
    pub virtual_method_pointer: Option<u16>,
    pub invoker_method: u16,
    pub name: MethodNameSlot,
    pub klass: u16,
    pub return_type: Option<u16>,
    pub parameters: Option<u16>,
    /// `genericMethod` for inflated methods, `genericContainer` for definitions
    pub generic_method: Option<u16>,
    pub token: Option<u16>,
    pub flags: Option<u16>,
    pub iflags: Option<u16>,
    pub slot: u16,
    pub parameters_count: u16,

    pub is_generic: Option<BitSlot>,
    pub is_inflated: Option<BitSlot>,
    pub is_marshaled_from_native: Option<BitSlot>,
}

/// Unity 5.3.6 to 2017.4, name kept in the extra info table; signature,
/// token and attribute offsets are unknown
pub static METHOD_21_0: MethodLayout = MethodLayout {
    label: "MethodInfo_21_0",
    since: UnityVersion::new(5, 3, 6),
    size: 200,
    method_pointer: 8,
    virtual_method_pointer: None,
    invoker_method: 16,
    name: MethodNameSlot::ExtraInfo { pointer: 0x40, name: 16, table_size: 24 },
    klass: 0,
    return_type: None,
    parameters: None,
    generic_method: None,
    token: None,
    flags: None,
    iflags: None,
    slot: 0x30,
    parameters_count: 0x32,
    is_generic: None,
    is_inflated: None,
    is_marshaled_from_native: None,
};

/// Unity 2018.1 to 2021.1
pub static METHOD_24_0: MethodLayout = MethodLayout {
    label: "MethodInfo_24_0",
    since: UnityVersion::new(2018, 1, 0),
    size: 80,
    method_pointer: 0,
    virtual_method_pointer: None,
    invoker_method: 8,
    name: MethodNameSlot::Direct(16),
    klass: 24,
    return_type: Some(32),
    parameters: Some(40),
    generic_method: Some(56),
    token: Some(64),
    flags: Some(68),
    iflags: Some(70),
    slot: 72,
    parameters_count: 74,
    is_generic: Some(BitSlot::new(75, 0)),
    is_inflated: Some(BitSlot::new(75, 1)),
    is_marshaled_from_native: Some(BitSlot::new(75, 3)),
};

/// Unity 2021.2 onwards
pub static METHOD_27_0: MethodLayout = MethodLayout {
    label: "MethodInfo_27_0",
    since: UnityVersion::new(2021, 2, 0),
    size: 88,
    method_pointer: 0,
    virtual_method_pointer: Some(8),
    invoker_method: 16,
    name: MethodNameSlot::Direct(24),
    klass: 32,
    return_type: Some(40),
    parameters: Some(48),
    generic_method: Some(64),
    token: Some(72),
    flags: Some(76),
    iflags: Some(78),
    slot: 80,
    parameters_count: 82,
    is_generic: Some(BitSlot::new(83, 0)),
    is_inflated: Some(BitSlot::new(83, 1)),
    is_marshaled_from_native: None,
};

pub static LAYOUTS: [&MethodLayout; 3] = [&METHOD_21_0, &METHOD_24_0, &METHOD_27_0];

impl MethodLayout {
    /// Whether the signature, token and attribute fields all have offsets
    pub fn is_complete(&self) -> bool {
        let offsets = [self.return_type, self.parameters, self.generic_method, self.token, self.flags, self.iflags];
        offsets.iter().all(Option::is_some) && self.is_generic.is_some() && self.is_inflated.is_some()
    }
}

/// A native `MethodInfo`
#[derive(Clone, Copy)]
pub struct MethodStruct {
    raw: Raw,
    layout: &'static MethodLayout,
}

layout_descriptor!(MethodLayout, MethodStruct, StructKind::MethodInfo);

impl MethodStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static MethodLayout) -> Self {
        MethodStruct { raw: Raw::new(ptr), layout }
    }

    handle_fields! {
        /// The compiled entry point
        method_pointer, set_method_pointer => method_pointer;
        /// `InvokerMethod` used by `il2cpp_runtime_invoke`
        invoker_method, set_invoker_method => invoker_method;
        declaring_class, set_declaring_class => klass;
    }

    optional_handle_fields! {
        virtual_method_pointer, set_virtual_method_pointer => virtual_method_pointer;
        return_type, set_return_type => return_type;
        /// `ParameterInfo` array of `parameters_count` entries
        parameters, set_parameters => parameters;
        generic_method, set_generic_method => generic_method;
    }

    value_fields! {
        slot, set_slot: u16 => slot;
        parameters_count, set_parameters_count: u8 => parameters_count;
    }

    optional_value_fields! {
        token, set_token: u32 => token;
        iflags, set_iflags: u16 => iflags;
    }

    optional_bit_fields! {
        is_generic, set_is_generic => is_generic;
        is_inflated, set_is_inflated => is_inflated;
        is_marshaled_from_native, set_is_marshaled_from_native => is_marshaled_from_native;
    }

    pub fn flags(&self) -> Option<MethodAttributes> {
        self.layout.flags.map(|offset| MethodAttributes::from_bits_retain(self.raw.get::<u16>(offset)))
    }

    pub fn set_flags(&self, flags: MethodAttributes) -> bool {
        match self.layout.flags {
            Some(offset) => {
                self.raw.set::<u16>(offset, flags.bits());
                true
            }
            None => false,
        }
    }

    /// Pointer to the C string name, following the side table where needed
    pub fn name(&self) -> NativeHandle {
        match self.layout.name {
            MethodNameSlot::Direct(offset) => self.raw.handle(offset),
            MethodNameSlot::ExtraInfo { pointer, name, .. } => {
                let extra = self.raw.handle(pointer);
                if extra.is_null() {
                    return NativeHandle::NULL;
                }
                Raw::new(extra).handle(name)
            }
        }
    }

    /// Store the name pointer, creating the side table if this method has none yet
    pub fn set_name(&self, value: NativeHandle) {
        match self.layout.name {
            MethodNameSlot::Direct(offset) => self.raw.set_handle(offset, value),
            MethodNameSlot::ExtraInfo { pointer, name, table_size } => {
                let mut extra = self.raw.handle(pointer);
                if extra.is_null() {
                    extra = memory::alloc_zeroed(table_size as usize);
                    self.raw.set_handle(pointer, extra);
                }
                Raw::new(extra).set_handle(name, value)
            }
        }
    }

    pub fn name_str(&self) -> Option<String> {
        // Safety: the name slot holds null or a C string
        unsafe { memory::read_cstr(self.name()) }
    }
}
