//! `Il2CppClass` layouts
//!
//! The virtual dispatch table is not part of the declared size: it trails the
//! struct as `vtable_count` [`VirtualInvokeData`] entries.

use super::types::{TypeLayout, TypeStruct};
use super::{BitSlot, Raw, StructKind, TypeSlot};
use crate::common::ClassAttributes;
use crate::memory::{self, NativeHandle};
use crate::version::UnityVersion;

/// One vtable entry
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualInvokeData {
    pub method_ptr: NativeHandle,
    pub method: NativeHandle,
}

/// `Il2CppRuntimeInterfaceOffsetPair`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceOffsetPair {
    pub interface_type: NativeHandle,
    pub offset: i32,
}

/// Offsets of `Il2CppClass` for one lineage
#[derive(Debug)]
pub struct ClassLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,

    pub image: Option<u16>,
    pub name: Option<u16>,
    pub namespace: Option<u16>,
    pub byval_arg: TypeSlot,
    pub this_arg: Option<TypeSlot>,
    pub element_class: Option<u16>,
    pub cast_class: Option<u16>,
    pub declaring_type: Option<u16>,
    pub parent: Option<u16>,
    pub generic_class: Option<u16>,
    /// Self pointer, absent before 2019.1
    pub klass: Option<u16>,

    pub fields: Option<u16>,
    pub events: Option<u16>,
    pub properties: Option<u16>,
    pub methods: u16,
    pub nested_types: Option<u16>,
    pub implemented_interfaces: Option<u16>,
    pub interface_offsets: Option<u16>,
    pub static_fields: Option<u16>,
    pub type_hierarchy: Option<u16>,

    pub instance_size: u16,
    pub actual_size: Option<u16>,
    pub native_size: Option<u16>,
    pub flags: Option<u16>,
    pub token: Option<u16>,

    pub method_count: u16,
    pub property_count: Option<u16>,
    pub field_count: Option<u16>,
    pub event_count: Option<u16>,
    pub nested_type_count: Option<u16>,
    pub vtable_count: u16,
    pub interfaces_count: Option<u16>,
    pub interface_offsets_count: Option<u16>,
    pub type_hierarchy_depth: Option<u16>,

    pub initialized_and_no_error: Option<BitSlot>,
    pub valuetype: Option<BitSlot>,
    pub initialized: Option<BitSlot>,
    pub enumtype: Option<BitSlot>,
    pub is_generic: Option<BitSlot>,
    pub has_references: Option<BitSlot>,
    pub init_pending: Option<BitSlot>,
    pub size_inited: Option<BitSlot>,
    pub has_finalize: Option<BitSlot>,
    pub has_cctor: Option<BitSlot>,
    pub is_blittable: Option<BitSlot>,
    pub is_import_or_windows_runtime: Option<BitSlot>,
    pub is_vtable_initialized: Option<BitSlot>,
    pub has_initialization_error: Option<BitSlot>,
}

/// Unity 5.6 to 2017.4: only the fields needed to read the method block
/// and size the vtable are known; `byval_arg` sits behind the method block
pub static CLASS_23_0: ClassLayout = ClassLayout {
    label: "Class_23_0",
    since: UnityVersion::new(5, 6, 0),
    size: 328,
    image: None,
    name: None,
    namespace: None,
    byval_arg: TypeSlot::Inline(208),
    this_arg: None,
    element_class: None,
    cast_class: None,
    declaring_type: None,
    parent: None,
    generic_class: None,
    klass: None,
    fields: None,
    events: None,
    properties: None,
    methods: 168,
    nested_types: None,
    implemented_interfaces: None,
    interface_offsets: None,
    static_fields: None,
    type_hierarchy: None,
    instance_size: 252,
    actual_size: None,
    native_size: None,
    flags: None,
    token: None,
    method_count: 298,
    property_count: None,
    field_count: None,
    event_count: None,
    nested_type_count: None,
    vtable_count: 302,
    interfaces_count: None,
    interface_offsets_count: None,
    type_hierarchy_depth: None,
    initialized_and_no_error: None,
    valuetype: None,
    initialized: None,
    enumtype: None,
    is_generic: None,
    has_references: None,
    init_pending: None,
    size_inited: None,
    has_finalize: None,
    has_cctor: None,
    is_blittable: None,
    is_import_or_windows_runtime: None,
    is_vtable_initialized: None,
    has_initialization_error: None,
};

/// Unity 2018.1 to 2018.4
pub static CLASS_24_0: ClassLayout = ClassLayout {
    label: "Class_24_0",
    since: UnityVersion::new(2018, 1, 0),
    size: 280,
    image: Some(0),
    name: Some(16),
    namespace: Some(24),
    byval_arg: TypeSlot::Inline(32),
    this_arg: Some(TypeSlot::Inline(48)),
    element_class: Some(64),
    cast_class: Some(72),
    declaring_type: Some(80),
    parent: Some(88),
    generic_class: Some(96),
    klass: None,
    fields: Some(120),
    events: Some(128),
    properties: Some(136),
    methods: 144,
    nested_types: Some(152),
    implemented_interfaces: Some(160),
    interface_offsets: Some(168),
    static_fields: Some(176),
    type_hierarchy: Some(192),
    instance_size: 220,
    actual_size: Some(224),
    native_size: Some(232),
    flags: Some(248),
    token: Some(252),
    method_count: 256,
    property_count: Some(258),
    field_count: Some(260),
    event_count: Some(262),
    nested_type_count: Some(264),
    vtable_count: 266,
    interfaces_count: Some(268),
    interface_offsets_count: Some(270),
    type_hierarchy_depth: Some(272),
    initialized_and_no_error: None,
    valuetype: Some(BitSlot::new(278, 0)),
    initialized: Some(BitSlot::new(278, 1)),
    enumtype: Some(BitSlot::new(278, 2)),
    is_generic: Some(BitSlot::new(278, 3)),
    has_references: Some(BitSlot::new(278, 4)),
    init_pending: Some(BitSlot::new(278, 5)),
    size_inited: Some(BitSlot::new(278, 6)),
    has_finalize: Some(BitSlot::new(278, 7)),
    has_cctor: Some(BitSlot::new(279, 0)),
    is_blittable: Some(BitSlot::new(279, 1)),
    is_import_or_windows_runtime: Some(BitSlot::new(279, 2)),
    is_vtable_initialized: Some(BitSlot::new(279, 3)),
    has_initialization_error: Some(BitSlot::new(279, 4)),
};

/// Unity 2019.1 to 2021.1: adds the self pointer, user data and the
/// `initialized_and_no_error` fast-path bit that shifts every flag by one
pub static CLASS_24_1: ClassLayout = ClassLayout {
    label: "Class_24_1",
    since: UnityVersion::new(2019, 1, 0),
    size: 304,
    image: Some(0),
    name: Some(16),
    namespace: Some(24),
    byval_arg: TypeSlot::Inline(32),
    this_arg: Some(TypeSlot::Inline(48)),
    element_class: Some(64),
    cast_class: Some(72),
    declaring_type: Some(80),
    parent: Some(88),
    generic_class: Some(96),
    klass: Some(120),
    fields: Some(128),
    events: Some(136),
    properties: Some(144),
    methods: 152,
    nested_types: Some(160),
    implemented_interfaces: Some(168),
    interface_offsets: Some(176),
    static_fields: Some(184),
    type_hierarchy: Some(200),
    instance_size: 244,
    actual_size: Some(248),
    native_size: Some(256),
    flags: Some(272),
    token: Some(276),
    method_count: 280,
    property_count: Some(282),
    field_count: Some(284),
    event_count: Some(286),
    nested_type_count: Some(288),
    vtable_count: 290,
    interfaces_count: Some(292),
    interface_offsets_count: Some(294),
    type_hierarchy_depth: Some(296),
    initialized_and_no_error: Some(BitSlot::new(302, 0)),
    valuetype: Some(BitSlot::new(302, 1)),
    initialized: Some(BitSlot::new(302, 2)),
    enumtype: Some(BitSlot::new(302, 3)),
    is_generic: Some(BitSlot::new(302, 4)),
    has_references: Some(BitSlot::new(302, 5)),
    init_pending: Some(BitSlot::new(302, 6)),
    size_inited: Some(BitSlot::new(302, 7)),
    has_finalize: Some(BitSlot::new(303, 0)),
    has_cctor: Some(BitSlot::new(303, 1)),
    is_blittable: Some(BitSlot::new(303, 2)),
    is_import_or_windows_runtime: Some(BitSlot::new(303, 3)),
    is_vtable_initialized: Some(BitSlot::new(303, 4)),
    has_initialization_error: Some(BitSlot::new(303, 5)),
};

/// Unity 2021.2 onwards: metadata handles replace indices and
/// `size_init_pending` pushes `size_inited` into the second byte
pub static CLASS_27_0: ClassLayout = ClassLayout {
    label: "Class_27_0",
    since: UnityVersion::new(2021, 2, 0),
    size: 312,
    image: Some(0),
    name: Some(16),
    namespace: Some(24),
    byval_arg: TypeSlot::Inline(32),
    this_arg: Some(TypeSlot::Inline(48)),
    element_class: Some(64),
    cast_class: Some(72),
    declaring_type: Some(80),
    parent: Some(88),
    generic_class: Some(96),
    klass: Some(120),
    fields: Some(128),
    events: Some(136),
    properties: Some(144),
    methods: 152,
    nested_types: Some(160),
    implemented_interfaces: Some(168),
    interface_offsets: Some(176),
    static_fields: Some(184),
    type_hierarchy: Some(200),
    instance_size: 248,
    actual_size: Some(252),
    native_size: Some(260),
    flags: Some(276),
    token: Some(280),
    method_count: 284,
    property_count: Some(286),
    field_count: Some(288),
    event_count: Some(290),
    nested_type_count: Some(292),
    vtable_count: 294,
    interfaces_count: Some(296),
    interface_offsets_count: Some(298),
    type_hierarchy_depth: Some(300),
    initialized_and_no_error: Some(BitSlot::new(306, 0)),
    valuetype: Some(BitSlot::new(306, 1)),
    initialized: Some(BitSlot::new(306, 2)),
    enumtype: Some(BitSlot::new(306, 3)),
    is_generic: Some(BitSlot::new(306, 4)),
    has_references: Some(BitSlot::new(306, 5)),
    init_pending: Some(BitSlot::new(306, 6)),
    size_inited: Some(BitSlot::new(307, 0)),
    has_finalize: Some(BitSlot::new(307, 1)),
    has_cctor: Some(BitSlot::new(307, 2)),
    is_blittable: Some(BitSlot::new(307, 3)),
    is_import_or_windows_runtime: Some(BitSlot::new(307, 4)),
    is_vtable_initialized: Some(BitSlot::new(307, 5)),
    has_initialization_error: Some(BitSlot::new(307, 6)),
};

pub static LAYOUTS: [&ClassLayout; 4] = [&CLASS_23_0, &CLASS_24_0, &CLASS_24_1, &CLASS_27_0];

impl ClassLayout {
    /// Whether every field needed to build a class from scratch has an offset
    pub fn is_complete(&self) -> bool {
        let offsets = [
            self.image,
            self.name,
            self.namespace,
            self.element_class,
            self.cast_class,
            self.declaring_type,
            self.parent,
            self.generic_class,
            self.fields,
            self.events,
            self.properties,
            self.nested_types,
            self.implemented_interfaces,
            self.interface_offsets,
            self.static_fields,
            self.type_hierarchy,
            self.actual_size,
            self.native_size,
            self.flags,
            self.token,
            self.property_count,
            self.field_count,
            self.event_count,
            self.nested_type_count,
            self.interfaces_count,
            self.interface_offsets_count,
            self.type_hierarchy_depth,
        ];
        let bits = [
            self.valuetype,
            self.initialized,
            self.enumtype,
            self.is_generic,
            self.has_references,
            self.init_pending,
            self.size_inited,
            self.has_finalize,
            self.has_cctor,
            self.is_blittable,
            self.is_import_or_windows_runtime,
            self.is_vtable_initialized,
        ];
        self.this_arg.is_some() && offsets.iter().all(Option::is_some) && bits.iter().all(Option::is_some)
    }
}

const VTABLE_ENTRY_SIZE: usize = std::mem::size_of::<VirtualInvokeData>();
const INTERFACE_PAIR_SIZE: usize = std::mem::size_of::<InterfaceOffsetPair>();

/// A native `Il2CppClass`
#[derive(Clone, Copy)]
pub struct ClassStruct {
    raw: Raw,
    layout: &'static ClassLayout,
    types: &'static TypeLayout,
}

layout_descriptor!(ClassLayout, ClassStruct, StructKind::Class);

impl ClassStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static ClassLayout, types: &'static TypeLayout) -> Self {
        ClassStruct { raw: Raw::new(ptr), layout, types }
    }

    /// Bytes to allocate for a class with `vtable_slots` trailing entries
    pub fn allocation_size(layout: &ClassLayout, vtable_slots: usize) -> usize {
        layout.size as usize + vtable_slots * VTABLE_ENTRY_SIZE
    }

    handle_fields! {
        /// `MethodInfo*` array of `method_count` entries
        methods, set_methods => methods;
    }

    optional_handle_fields! {
        image, set_image => image;
        /// Pointer to the C string name
        name, set_name => name;
        namespace, set_namespace => namespace;
        element_class, set_element_class => element_class;
        cast_class, set_cast_class => cast_class;
        declaring_type, set_declaring_type => declaring_type;
        parent, set_parent => parent;
        generic_class, set_generic_class => generic_class;
        /// `FieldInfo` array of `field_count` entries
        fields, set_fields => fields;
        events, set_events => events;
        properties, set_properties => properties;
        nested_types, set_nested_types => nested_types;
        implemented_interfaces, set_implemented_interfaces => implemented_interfaces;
        interface_offsets, set_interface_offsets => interface_offsets;
        static_fields, set_static_fields => static_fields;
        /// `Il2CppClass*` array of `type_hierarchy_depth` entries, root first
        type_hierarchy, set_type_hierarchy => type_hierarchy;
        /// The class pointing at itself
        class_self, set_class_self => klass;
    }

    value_fields! {
        instance_size, set_instance_size: u32 => instance_size;
        method_count, set_method_count: u16 => method_count;
        vtable_count, set_vtable_count: u16 => vtable_count;
    }

    optional_value_fields! {
        actual_size, set_actual_size: u32 => actual_size;
        native_size, set_native_size: i32 => native_size;
        token, set_token: u32 => token;
        property_count, set_property_count: u16 => property_count;
        field_count, set_field_count: u16 => field_count;
        event_count, set_event_count: u16 => event_count;
        nested_type_count, set_nested_type_count: u16 => nested_type_count;
        interfaces_count, set_interfaces_count: u16 => interfaces_count;
        interface_offsets_count, set_interface_offsets_count: u16 => interface_offsets_count;
        type_hierarchy_depth, set_type_hierarchy_depth: u8 => type_hierarchy_depth;
    }

    optional_bit_fields! {
        value_type, set_value_type => valuetype;
        initialized, set_initialized => initialized;
        enum_type, set_enum_type => enumtype;
        is_generic, set_is_generic => is_generic;
        has_references, set_has_references => has_references;
        init_pending, set_init_pending => init_pending;
        size_inited, set_size_inited => size_inited;
        has_finalize, set_has_finalize => has_finalize;
        has_cctor, set_has_cctor => has_cctor;
        is_blittable, set_is_blittable => is_blittable;
        is_import_or_windows_runtime, set_is_import_or_windows_runtime => is_import_or_windows_runtime;
        is_vtable_initialized, set_is_vtable_initialized => is_vtable_initialized;
        initialized_and_no_error, set_initialized_and_no_error => initialized_and_no_error;
        has_initialization_error, set_has_initialization_error => has_initialization_error;
    }

    pub fn flags(&self) -> Option<ClassAttributes> {
        self.layout.flags.map(|offset| ClassAttributes::from_bits_retain(self.raw.get::<u32>(offset)))
    }

    pub fn set_flags(&self, flags: ClassAttributes) -> bool {
        match self.layout.flags {
            Some(offset) => {
                self.raw.set::<u32>(offset, flags.bits());
                true
            }
            None => false,
        }
    }

    /// Whether `flag` is known to be set
    pub fn has_flag(&self, flag: ClassAttributes) -> bool {
        self.flags().is_some_and(|flags| flags.contains(flag))
    }

    pub fn name_str(&self) -> Option<String> {
        self.layout.name.and_then(|offset| self.raw.cstr(offset))
    }

    pub fn namespace_str(&self) -> Option<String> {
        self.layout.namespace.and_then(|offset| self.raw.cstr(offset))
    }

    /// `Namespace.Name`, or just `Name` in the global namespace
    pub fn full_name(&self) -> String {
        let name = self.name_str().unwrap_or_default();
        match self.namespace_str() {
            Some(ns) if !ns.is_empty() => format!("{}.{}", ns, name),
            _ => name,
        }
    }

    /// The by-value type descriptor of this class
    pub fn byval_arg(&self) -> Option<TypeStruct> {
        self.type_slot(self.layout.byval_arg)
    }

    /// The by-reference (`this`) type descriptor of this class
    pub fn this_arg(&self) -> Option<TypeStruct> {
        self.layout.this_arg.and_then(|slot| self.type_slot(slot))
    }

    /// Install `ty` as the by-value type: copied for inline slots, linked for pointer slots
    pub fn attach_byval_arg(&self, ty: &TypeStruct) {
        self.attach_type_slot(self.layout.byval_arg, ty)
    }

    pub fn attach_this_arg(&self, ty: &TypeStruct) -> bool {
        match self.layout.this_arg {
            Some(slot) => {
                self.attach_type_slot(slot, ty);
                true
            }
            None => false,
        }
    }

    fn type_slot(&self, slot: TypeSlot) -> Option<TypeStruct> {
        match slot {
            TypeSlot::Inline(offset) => Some(TypeStruct::new(self.ptr().add(offset as usize), self.types)),
            TypeSlot::Pointer(offset) => self.raw.handle(offset).non_null().map(|p| TypeStruct::new(p, self.types)),
        }
    }

    fn attach_type_slot(&self, slot: TypeSlot, ty: &TypeStruct) {
        match slot {
            TypeSlot::Inline(offset) => {
                TypeStruct::new(self.ptr().add(offset as usize), self.types).copy_from(ty)
            }
            TypeSlot::Pointer(offset) => self.raw.set_handle(offset, ty.ptr()),
        }
    }

    /// Entry `index` of the `methods` array
    pub fn method_at(&self, index: usize) -> NativeHandle {
        pointer_at(self.methods(), index)
    }

    /// Entry `index` of the `nested_types` array
    pub fn nested_type_at(&self, index: usize) -> NativeHandle {
        pointer_at(self.nested_types().unwrap_or(NativeHandle::NULL), index)
    }

    pub fn implemented_interface_at(&self, index: usize) -> NativeHandle {
        pointer_at(self.implemented_interfaces().unwrap_or(NativeHandle::NULL), index)
    }

    pub fn type_hierarchy_at(&self, index: usize) -> NativeHandle {
        pointer_at(self.type_hierarchy().unwrap_or(NativeHandle::NULL), index)
    }

    pub fn interface_offset_at(&self, index: usize) -> InterfaceOffsetPair {
        match self.interface_offsets().and_then(NativeHandle::non_null) {
            // Safety: the array holds `interface_offsets_count` pairs
            Some(pairs) => unsafe { memory::read(pairs, index * INTERFACE_PAIR_SIZE) },
            None => InterfaceOffsetPair::default(),
        }
    }

    /// Start of the trailing vtable
    pub fn vtable(&self) -> NativeHandle {
        self.ptr().add(self.layout.size as usize)
    }

    pub fn vtable_entry(&self, slot: usize) -> VirtualInvokeData {
        // Safety: the class was allocated with at least `vtable_count` slots
        unsafe { memory::read(self.vtable(), slot * VTABLE_ENTRY_SIZE) }
    }

    pub fn set_vtable_entry(&self, slot: usize, entry: VirtualInvokeData) {
        // Safety: see `vtable_entry`
        unsafe { memory::write(self.vtable(), slot * VTABLE_ENTRY_SIZE, entry) }
    }
}

fn pointer_at(array: NativeHandle, index: usize) -> NativeHandle {
    if array.is_null() {
        return NativeHandle::NULL;
    }
    // Safety: callers pass arrays holding more than `index` pointers
    unsafe { memory::read_handle(array, index * memory::SIZE_OF_PTR) }
}

/// Fill a freshly allocated interface-offset array
pub(crate) fn write_interface_offsets(array: NativeHandle, pairs: &[InterfaceOffsetPair]) {
    for (i, pair) in pairs.iter().enumerate() {
        // Safety: `array` was allocated for `pairs.len()` entries
        unsafe { memory::write(array, i * INTERFACE_PAIR_SIZE, *pair) }
    }
}

pub(crate) const fn interface_pair_size() -> usize {
    INTERFACE_PAIR_SIZE
}
