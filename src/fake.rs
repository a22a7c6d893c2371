//! An in-process stand-in for the native runtime, for tests
//!
//! Metadata is laid out with the registry's active layouts in ordinary heap
//! memory, so the bridge and the injector run against the same structs they
//! would see inside a game. Objects, strings and arrays use the stable object
//! header offsets.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{ClassAttributes, MethodAttributes, TypeCode};
use crate::error::{InteropError, Result};
use crate::il2cpp::api::{invoke_unboxing, ClassFromTypeFn, GenericMethodGetMethodFn, Il2CppApi, InvokerFn};
use crate::il2cpp::offsets::{ARRAY_ELEMENTS, ARRAY_LENGTH, OBJECT_HEADER_SIZE, STRING_CHARS, STRING_LENGTH};
use crate::injector::{Detour, HookTargets};
use crate::layout::{ClassStruct, LayoutRegistry, VirtualInvokeData};
use crate::memory::{self, NativeHandle, SIZE_OF_PTR};
use crate::version::UnityVersion;

type Behaviour = Arc<dyn Fn(NativeHandle, &[*mut c_void]) -> std::result::Result<NativeHandle, NativeHandle> + Send + Sync>;

const DEFAULT_VERSION: UnityVersion = UnityVersion::new(2021, 3, 14);
const VTABLE_HEADROOM: usize = 16;

/// Stand-in for compiled method bodies
unsafe extern "C" fn native_stub(_this: NativeHandle, _method: NativeHandle) -> NativeHandle {
    NativeHandle::NULL
}

/// `Class::FromIl2CppType` for fake types: `data` holds the class
unsafe extern "C" fn fake_class_from_type(ty: NativeHandle) -> NativeHandle {
    if ty.is_null() {
        return NativeHandle::NULL;
    }
    // `data` leads every type layout
    let data = memory::read::<usize>(ty, 0);
    if (data as isize) <= 0 {
        NativeHandle::NULL
    } else {
        NativeHandle::from_addr(data)
    }
}

/// The fake runtime never inflates methods itself
unsafe extern "C" fn fake_generic_method_get_method(_gmethod: NativeHandle, _copy: bool) -> NativeHandle {
    NativeHandle::NULL
}

/// Description of a class to add to the fake runtime
#[derive(Debug, Clone)]
pub(crate) struct ClassSpec {
    namespace: String,
    name: String,
    parent: Option<NativeHandle>,
    instance_size: Option<u32>,
    value_size: Option<u32>,
    type_code: Option<TypeCode>,
    flags: ClassAttributes,
    generic: bool,
}

impl ClassSpec {
    pub(crate) fn new(namespace: &str, name: &str) -> Self {
        ClassSpec {
            namespace: namespace.to_string(),
            name: name.to_string(),
            parent: None,
            instance_size: None,
            value_size: None,
            type_code: None,
            flags: ClassAttributes::PUBLIC,
            generic: false,
        }
    }

    pub(crate) fn parent(mut self, parent: NativeHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    pub(crate) fn instance_size(mut self, size: u32) -> Self {
        self.instance_size = Some(size);
        self
    }

    pub(crate) fn value_type(mut self, size: u32) -> Self {
        self.value_size = Some(size);
        self
    }

    pub(crate) fn type_code(mut self, code: TypeCode) -> Self {
        self.type_code = Some(code);
        self
    }

    pub(crate) fn flags(mut self, flags: ClassAttributes) -> Self {
        self.flags |= flags;
        self
    }

    pub(crate) fn interface(self) -> Self {
        self.flags(ClassAttributes::INTERFACE | ClassAttributes::ABSTRACT)
    }

    pub(crate) fn generic(mut self) -> Self {
        self.generic = true;
        self
    }
}

#[derive(Default)]
struct FakeState {
    domain: NativeHandle,
    assemblies: Vec<NativeHandle>,
    corlib: NativeHandle,
    classes: HashMap<(NativeHandle, String, String), NativeHandle>,
    corlib_classes: HashMap<String, NativeHandle>,
    fields: HashMap<NativeHandle, Vec<(String, NativeHandle)>>,
    behaviours: HashMap<NativeHandle, Behaviour>,
    icalls: HashMap<String, NativeHandle>,
    modules: HashMap<String, NativeHandle>,
    gchandles: Vec<NativeHandle>,
}

pub(crate) struct FakeRuntime {
    layouts: Arc<LayoutRegistry>,
    state: Mutex<FakeState>,
    invocations: AtomicUsize,
    barriers: AtomicUsize,
    class_from_type_fn: AtomicUsize,
    generic_get_method_fn: AtomicUsize,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::for_version(DEFAULT_VERSION)
    }

    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub(crate) fn shared_for(version: UnityVersion) -> Arc<Self> {
        Arc::new(Self::for_version(version))
    }

    fn for_version(version: UnityVersion) -> Self {
        let layouts = match LayoutRegistry::new(version) {
            Ok(layouts) => Arc::new(layouts),
            Err(e) => panic!("fake runtime needs a supported version: {}", e),
        };
        let fake = FakeRuntime {
            layouts,
            state: Mutex::new(FakeState { domain: memory::alloc_zeroed(SIZE_OF_PTR), ..Default::default() }),
            invocations: AtomicUsize::new(0),
            barriers: AtomicUsize::new(0),
            class_from_type_fn: AtomicUsize::new(fake_class_from_type as ClassFromTypeFn as usize),
            generic_get_method_fn: AtomicUsize::new(fake_generic_method_get_method as GenericMethodGetMethodFn as usize),
        };
        fake.bootstrap_corlib();
        fake
    }

    fn bootstrap_corlib(&self) {
        let corlib = self.add_image("mscorlib.dll");
        self.state.lock().corlib = corlib;

        let object = self.add_class(corlib, ClassSpec::new("System", "Object").type_code(TypeCode::OBJECT));
        let value_types: [(&str, TypeCode, u32); 13] = [
            ("Void", TypeCode::VOID, 1),
            ("Boolean", TypeCode::BOOLEAN, 1),
            ("Char", TypeCode::CHAR, 2),
            ("SByte", TypeCode::I1, 1),
            ("Byte", TypeCode::U1, 1),
            ("Int16", TypeCode::I2, 2),
            ("UInt16", TypeCode::U2, 2),
            ("Int32", TypeCode::I4, 4),
            ("UInt32", TypeCode::U4, 4),
            ("Int64", TypeCode::I8, 8),
            ("UInt64", TypeCode::U8, 8),
            ("Single", TypeCode::R4, 4),
            ("Double", TypeCode::R8, 8),
        ];
        for (name, code, size) in value_types {
            let spec = ClassSpec::new("System", name)
                .parent(object.ptr())
                .value_type(size)
                .type_code(code)
                .flags(ClassAttributes::SEALED);
            self.add_class(corlib, spec);
        }
        for (name, code) in [("IntPtr", TypeCode::I), ("UIntPtr", TypeCode::U)] {
            let spec = ClassSpec::new("System", name).parent(object.ptr()).value_type(8).type_code(code);
            self.add_class(corlib, spec);
        }
        let string = ClassSpec::new("System", "String")
            .parent(object.ptr())
            .type_code(TypeCode::STRING)
            .flags(ClassAttributes::SEALED);
        self.add_class(corlib, string);
        let exception_size = self.layouts.exception_size() as u32;
        self.add_class(corlib, ClassSpec::new("System", "Exception").parent(object.ptr()).instance_size(exception_size));
        self.add_class(corlib, ClassSpec::new("System", "Array").parent(object.ptr()).instance_size(ARRAY_ELEMENTS as u32));

        let void = self.primitive_type(TypeCode::VOID);
        let boolean = self.primitive_type(TypeCode::BOOLEAN);
        let int = self.primitive_type(TypeCode::I4);
        let string = self.primitive_type(TypeCode::STRING);
        let any = self.primitive_type(TypeCode::OBJECT);
        self.add_virtual_method(object, "Equals", boolean, &[any], false);
        self.add_virtual_method(object, "Finalize", void, &[], false);
        self.add_virtual_method(object, "GetHashCode", int, &[], false);
        self.add_virtual_method(object, "ToString", string, &[], false);
    }

    pub(crate) fn layouts(&self) -> &Arc<LayoutRegistry> {
        &self.layouts
    }

    fn class(&self, class: NativeHandle) -> Option<ClassStruct> {
        // Safety: the fake only hands out classes it laid out
        unsafe { self.layouts.wrap_class(class) }
    }

    // Building metadata

    pub(crate) fn add_image(&self, name: &str) -> NativeHandle {
        let image = self.layouts.new_image();
        image.set_name(memory::leak_cstring(name));
        image.set_name_no_ext(memory::leak_cstring(name.strip_suffix(".dll").unwrap_or(name)));
        let assembly = self.layouts.new_assembly();
        assembly.set_image(image.ptr());
        assembly.name().set_name(memory::leak_cstring(name.strip_suffix(".dll").unwrap_or(name)));
        image.set_assembly(assembly.ptr());
        self.state.lock().assemblies.push(assembly.ptr());
        image.ptr()
    }

    pub(crate) fn add_class(&self, image: NativeHandle, spec: ClassSpec) -> ClassStruct {
        let is_object = spec.namespace == "System" && spec.name == "Object";
        let is_interface = spec.flags.contains(ClassAttributes::INTERFACE);
        let parent = match spec.parent {
            Some(parent) => self.class(parent),
            None if is_object || is_interface => None,
            None => self.class(self.corlib_class("Object")),
        };
        let parent_vtable = parent.map_or(0, |p| p.vtable_count() as usize);

        let class = self.layouts.new_class(parent_vtable + VTABLE_HEADROOM);
        class.set_image(image);
        class.set_name(memory::leak_cstring(&spec.name));
        class.set_namespace(memory::leak_cstring(&spec.namespace));
        class.set_element_class(class.ptr());
        class.set_cast_class(class.ptr());
        class.set_class_self(class.ptr());
        class.set_flags(spec.flags);
        class.set_is_generic(spec.generic);
        class.set_initialized(true);
        let _ = class.set_initialized_and_no_error(true);
        class.set_size_inited(true);
        class.set_is_vtable_initialized(true);

        let instance_size = match (spec.instance_size, spec.value_size) {
            (Some(size), _) => size,
            (None, Some(value)) => OBJECT_HEADER_SIZE as u32 + value,
            (None, None) => parent.map_or(OBJECT_HEADER_SIZE as u32, |p| p.instance_size()),
        };
        class.set_instance_size(instance_size);
        class.set_actual_size(instance_size);
        class.set_value_type(spec.value_size.is_some());

        let code = spec.type_code.unwrap_or(if spec.value_size.is_some() { TypeCode::VALUETYPE } else { TypeCode::CLASS });
        let byval = self.layouts.new_type();
        byval.set_type_code(code);
        byval.set_data(class.ptr());
        class.attach_byval_arg(&byval);
        let this = self.layouts.new_type();
        this.set_type_code(code);
        this.set_data(class.ptr());
        this.set_by_ref(true);
        class.attach_this_arg(&this);

        if let Some(parent) = parent {
            class.set_parent(parent.ptr());
            for slot in 0..parent_vtable {
                class.set_vtable_entry(slot, parent.vtable_entry(slot));
            }
            class.set_vtable_count(parent_vtable as u16);
            class.set_implemented_interfaces(parent.implemented_interfaces().unwrap_or_default());
            class.set_interfaces_count(parent.interfaces_count().unwrap_or(0));
            class.set_interface_offsets(parent.interface_offsets().unwrap_or_default());
            class.set_interface_offsets_count(parent.interface_offsets_count().unwrap_or(0));
        }
        let depth = parent.and_then(|p| p.type_hierarchy_depth()).unwrap_or(0) as usize + 1;
        let hierarchy = memory::alloc_array(depth, SIZE_OF_PTR);
        for i in 0..depth - 1 {
            // Safety: `hierarchy` holds `depth` pointers
            unsafe { memory::write_handle(hierarchy, i * SIZE_OF_PTR, parent.map_or(NativeHandle::NULL, |p| p.type_hierarchy_at(i))) };
        }
        // Safety: as above
        unsafe { memory::write_handle(hierarchy, (depth - 1) * SIZE_OF_PTR, class.ptr()) };
        class.set_type_hierarchy(hierarchy);
        class.set_type_hierarchy_depth(depth as u8);

        let mut state = self.state.lock();
        state.classes.insert((image, spec.namespace.clone(), spec.name.clone()), class.ptr());
        if image == state.corlib && spec.namespace == "System" {
            state.corlib_classes.insert(spec.name.clone(), class.ptr());
        }
        class
    }

    pub(crate) fn add_field(&self, class: ClassStruct, name: &str, ty: NativeHandle, offset: i32) -> NativeHandle {
        let field = self.layouts.new_field();
        field.set_name(memory::leak_cstring(name));
        field.set_field_type(ty);
        field.set_parent(class.ptr());
        field.set_offset(offset);
        self.state.lock().fields.entry(class.ptr()).or_default().push((name.to_string(), field.ptr()));
        field.ptr()
    }

    pub(crate) fn add_nested_type(&self, outer: ClassStruct, inner: ClassStruct) {
        let count = outer.nested_type_count().unwrap_or(0) as usize;
        let nested = memory::alloc_array(count + 1, SIZE_OF_PTR);
        for i in 0..count {
            // Safety: the new array has room for `count + 1` pointers
            unsafe { memory::write_handle(nested, i * SIZE_OF_PTR, outer.nested_type_at(i)) };
        }
        // Safety: as above
        unsafe { memory::write_handle(nested, count * SIZE_OF_PTR, inner.ptr()) };
        outer.set_nested_types(nested);
        outer.set_nested_type_count(count as u16 + 1);
        inner.set_declaring_type(outer.ptr());
    }

    pub(crate) fn add_method(&self, class: ClassStruct, name: &str, ret: NativeHandle, params: &[NativeHandle]) -> NativeHandle {
        let method = self.layouts.new_method();
        method.set_name(memory::leak_cstring(name));
        method.set_declaring_class(class.ptr());
        method.set_return_type(ret);
        method.set_method_pointer(NativeHandle::from_addr(native_stub as usize));
        method.set_slot(u16::MAX);
        method.set_flags(MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG);
        if !params.is_empty() {
            let array = self.layouts.new_parameter_array(params.len());
            for (i, ty) in params.iter().enumerate() {
                // Safety: the array was sized for `params`
                if let Some(param) = unsafe { self.layouts.wrap_parameter_at(array, i) } {
                    param.set_parameter_type(*ty);
                    param.set_name(memory::leak_cstring(&format!("arg{}", i)));
                    param.set_position(i as i32);
                }
            }
            method.set_parameters(array);
            method.set_parameters_count(params.len() as u8);
        }

        let count = class.method_count() as usize;
        let methods = memory::alloc_array(count + 1, SIZE_OF_PTR);
        for i in 0..count {
            // Safety: the new array has room for `count + 1` pointers
            unsafe { memory::write_handle(methods, i * SIZE_OF_PTR, class.method_at(i)) };
        }
        // Safety: as above
        unsafe { memory::write_handle(methods, count * SIZE_OF_PTR, method.ptr()) };
        class.set_methods(methods);
        class.set_method_count(count as u16 + 1);
        method.ptr()
    }

    /// Add a method occupying the next vtable slot; abstract slots stay empty
    pub(crate) fn add_virtual_method(
        &self,
        class: ClassStruct,
        name: &str,
        ret: NativeHandle,
        params: &[NativeHandle],
        is_abstract: bool,
    ) -> NativeHandle {
        let handle = self.add_method(class, name, ret, params);
        let Some(method) = (unsafe { self.layouts.wrap_method(handle) }) else {
            return handle;
        };
        let slot = class.vtable_count();
        let mut flags = MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG | MethodAttributes::VIRTUAL;
        if is_abstract {
            flags |= MethodAttributes::ABSTRACT;
            method.set_method_pointer(NativeHandle::NULL);
        } else {
            class.set_vtable_entry(slot as usize, VirtualInvokeData { method_ptr: method.method_pointer(), method: handle });
        }
        method.set_flags(flags);
        method.set_slot(slot);
        class.set_vtable_count(slot + 1);
        handle
    }

    pub(crate) fn corlib_class(&self, name: &str) -> NativeHandle {
        self.state.lock().corlib_classes.get(name).copied().unwrap_or_default()
    }

    /// By-value type of the corlib class behind `code`
    pub(crate) fn primitive_type(&self, code: TypeCode) -> NativeHandle {
        let name = code.system_name().and_then(|n| n.strip_prefix("System.")).unwrap_or_default();
        self.class_get_type(self.corlib_class(name))
    }

    pub(crate) fn on_invoke<F>(&self, method: NativeHandle, behaviour: F)
    where
        F: Fn(NativeHandle, &[*mut c_void]) -> std::result::Result<NativeHandle, NativeHandle> + Send + Sync + 'static,
    {
        self.state.lock().behaviours.insert(method, Arc::new(behaviour));
    }

    /// An exception object of `namespace.name` carrying `message`
    pub(crate) fn new_exception(&self, namespace: &str, name: &str, message: &str) -> NativeHandle {
        let corlib = self.state.lock().corlib;
        let existing = self.class_from_name(corlib, namespace, name);
        let class = if existing.is_null() {
            let base = self.corlib_class("Exception");
            self.add_class(corlib, ClassSpec::new(namespace, name).parent(base)).ptr()
        } else {
            existing
        };
        let object = self.object_new(class);
        // Safety: exception classes are sized for the exception layout
        if let Some(exception) = unsafe { self.layouts.wrap_exception(object) } {
            let full_name: Vec<u16> = format!("{}.{}", namespace, name).encode_utf16().collect();
            let text: Vec<u16> = message.encode_utf16().collect();
            exception.set_class_name(self.string_new_utf16(&full_name));
            exception.set_message(self.string_new_utf16(&text));
        }
        object
    }

    pub(crate) fn register_icall(&self, name: &str, address: NativeHandle) {
        self.state.lock().icalls.insert(name.to_string(), address);
    }

    pub(crate) fn set_module_base(&self, module: &str, base: NativeHandle) {
        self.state.lock().modules.insert(module.to_string(), base);
    }

    pub(crate) fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub(crate) fn barrier_count(&self) -> usize {
        self.barriers.load(Ordering::SeqCst)
    }

    /// Addresses of the interceptable internals
    pub(crate) fn hook_targets(&self) -> HookTargets {
        HookTargets {
            class_from_type: NativeHandle::from_addr(fake_class_from_type as ClassFromTypeFn as usize),
            generic_method_get_method: NativeHandle::from_addr(
                fake_generic_method_get_method as GenericMethodGetMethodFn as usize,
            ),
        }
    }

    /// `GenericMethod::GetMethod` as the runtime would call it
    pub(crate) fn generic_method_get_method(&self, gmethod: NativeHandle) -> NativeHandle {
        let addr = self.generic_get_method_fn.load(Ordering::SeqCst);
        // Safety: the slot only ever holds `GenericMethodGetMethodFn` pointers
        unsafe { std::mem::transmute::<usize, GenericMethodGetMethodFn>(addr)(gmethod, true) }
    }

    fn value_size(&self, class: NativeHandle) -> usize {
        match self.class(class) {
            Some(c) if c.value_type() == Some(true) => (c.instance_size() as usize).saturating_sub(OBJECT_HEADER_SIZE),
            _ => SIZE_OF_PTR,
        }
    }
}

impl Detour for FakeRuntime {
    unsafe fn attach(&self, target: NativeHandle, hook: NativeHandle) -> Result<NativeHandle> {
        let targets = self.hook_targets();
        let slot = if target == targets.class_from_type {
            &self.class_from_type_fn
        } else if target == targets.generic_method_get_method {
            &self.generic_get_method_fn
        } else {
            return Err(InteropError::Hook { target, reason: "not an interceptable function".to_string() });
        };
        slot.store(hook.addr(), Ordering::SeqCst);
        Ok(target)
    }
}

impl Il2CppApi for FakeRuntime {
    fn domain_get(&self) -> NativeHandle {
        self.state.lock().domain
    }

    fn domain_get_assemblies(&self, _domain: NativeHandle) -> Vec<NativeHandle> {
        self.state.lock().assemblies.clone()
    }

    fn assembly_get_image(&self, assembly: NativeHandle) -> NativeHandle {
        // Safety: assemblies come from `add_image`
        unsafe { self.layouts.wrap_assembly(assembly) }.map_or(NativeHandle::NULL, |a| a.image())
    }

    fn image_get_name(&self, image: NativeHandle) -> Option<String> {
        // Safety: images come from `add_image`
        unsafe { self.layouts.wrap_image(image) }.and_then(|i| i.name_str())
    }

    fn thread_attach(&self, domain: NativeHandle) -> NativeHandle {
        domain
    }

    fn class_from_name(&self, image: NativeHandle, namespace: &str, name: &str) -> NativeHandle {
        let key = (image, namespace.to_string(), name.to_string());
        self.state.lock().classes.get(&key).copied().unwrap_or_default()
    }

    fn class_get_methods(&self, class: NativeHandle, iter: &mut usize) -> NativeHandle {
        match self.class(class) {
            Some(c) if *iter < c.method_count() as usize => {
                let method = c.method_at(*iter);
                *iter += 1;
                method
            }
            _ => NativeHandle::NULL,
        }
    }

    fn class_get_nested_types(&self, class: NativeHandle, iter: &mut usize) -> NativeHandle {
        match self.class(class) {
            Some(c) if *iter < c.nested_type_count().unwrap_or(0) as usize => {
                let nested = c.nested_type_at(*iter);
                *iter += 1;
                nested
            }
            _ => NativeHandle::NULL,
        }
    }

    fn class_get_field_from_name(&self, class: NativeHandle, name: &str) -> NativeHandle {
        let mut current = self.class(class);
        while let Some(c) = current {
            let added = self.state.lock().fields.get(&c.ptr()).and_then(|fields| {
                fields.iter().find(|(n, _)| n == name).map(|(_, field)| *field)
            });
            if let Some(field) = added {
                return field;
            }
            // Injected classes carry a contiguous field table
            for i in 0..c.field_count().unwrap_or(0) as usize {
                // Safety: `fields` holds `field_count` entries when set
                if let Some(field) = unsafe { self.layouts.wrap_field_at(c.fields().unwrap_or_default(), i) } {
                    if field.name_str().as_deref() == Some(name) {
                        return field.ptr();
                    }
                }
            }
            current = self.class(c.parent().unwrap_or_default());
        }
        NativeHandle::NULL
    }

    fn class_get_method_from_name(&self, class: NativeHandle, name: &str, argc: i32) -> NativeHandle {
        let mut current = self.class(class);
        while let Some(c) = current {
            for i in 0..c.method_count() as usize {
                let method = c.method_at(i);
                if self.method_get_name(method).as_deref() == Some(name)
                    && (argc < 0 || self.method_get_param_count(method) as i32 == argc)
                {
                    return method;
                }
            }
            current = self.class(c.parent().unwrap_or_default());
        }
        NativeHandle::NULL
    }

    fn class_get_name(&self, class: NativeHandle) -> Option<String> {
        self.class(class).and_then(|c| c.name_str())
    }

    fn class_get_namespace(&self, class: NativeHandle) -> Option<String> {
        self.class(class).and_then(|c| c.namespace_str())
    }

    fn class_get_parent(&self, class: NativeHandle) -> NativeHandle {
        self.class(class).and_then(|c| c.parent()).unwrap_or_default()
    }

    fn class_get_type(&self, class: NativeHandle) -> NativeHandle {
        self.class(class).and_then(|c| c.byval_arg()).map_or(NativeHandle::NULL, |t| t.ptr())
    }

    fn class_from_type(&self, ty: NativeHandle) -> NativeHandle {
        let addr = self.class_from_type_fn.load(Ordering::SeqCst);
        // Safety: the slot only ever holds `ClassFromTypeFn` pointers
        unsafe { std::mem::transmute::<usize, ClassFromTypeFn>(addr)(ty) }
    }

    fn class_is_valuetype(&self, class: NativeHandle) -> bool {
        self.class(class).is_some_and(|c| c.value_type() == Some(true))
    }

    fn class_value_size(&self, class: NativeHandle) -> i32 {
        self.value_size(class) as i32
    }

    fn runtime_class_init(&self, _class: NativeHandle) {}

    fn method_get_name(&self, method: NativeHandle) -> Option<String> {
        // Safety: methods come from this fake or the injector
        unsafe { self.layouts.wrap_method(method) }.and_then(|m| m.name_str())
    }

    fn method_get_token(&self, method: NativeHandle) -> u32 {
        unsafe { self.layouts.wrap_method(method) }.and_then(|m| m.token()).unwrap_or(0)
    }

    fn method_get_param_count(&self, method: NativeHandle) -> u32 {
        unsafe { self.layouts.wrap_method(method) }.map_or(0, |m| m.parameters_count() as u32)
    }

    fn method_get_param(&self, method: NativeHandle, index: u32) -> NativeHandle {
        let Some(m) = (unsafe { self.layouts.wrap_method(method) }) else {
            return NativeHandle::NULL;
        };
        if index >= m.parameters_count() as u32 {
            return NativeHandle::NULL;
        }
        // Safety: the index is within the parameter array
        unsafe { self.layouts.wrap_parameter_at(m.parameters().unwrap_or_default(), index as usize) }
            .map_or(NativeHandle::NULL, |p| p.parameter_type())
    }

    fn method_get_return_type(&self, method: NativeHandle) -> NativeHandle {
        unsafe { self.layouts.wrap_method(method) }.and_then(|m| m.return_type()).unwrap_or_default()
    }

    fn method_is_generic(&self, method: NativeHandle) -> bool {
        unsafe { self.layouts.wrap_method(method) }.is_some_and(|m| m.is_generic() == Some(true))
    }

    fn method_get_flags(&self, method: NativeHandle) -> u32 {
        unsafe { self.layouts.wrap_method(method) }.and_then(|m| m.flags()).map_or(0, |f| f.bits() as u32)
    }

    fn type_get_name(&self, ty: NativeHandle) -> Option<String> {
        // Safety: types come from this fake or the injector
        let ty_struct = unsafe { self.layouts.wrap_type(ty) }?;
        if ty_struct.type_code() == TypeCode::MVAR {
            return Some("T".to_string());
        }
        self.class(self.class_from_type(ty)).map(|c| c.full_name())
    }

    fn field_get_offset(&self, field: NativeHandle) -> u32 {
        unsafe { self.layouts.wrap_field(field) }.map_or(0, |f| f.offset() as u32)
    }

    fn field_get_type(&self, field: NativeHandle) -> NativeHandle {
        unsafe { self.layouts.wrap_field(field) }.map_or(NativeHandle::NULL, |f| f.field_type())
    }

    fn string_new_utf16(&self, chars: &[u16]) -> NativeHandle {
        let string = memory::alloc_zeroed(STRING_CHARS + (chars.len() + 1) * 2);
        // Safety: the block was sized for the header and every unit
        unsafe {
            memory::write_handle(string, 0, self.corlib_class("String"));
            memory::write::<i32>(string, STRING_LENGTH, chars.len() as i32);
            for (i, unit) in chars.iter().enumerate() {
                memory::write::<u16>(string, STRING_CHARS + i * 2, *unit);
            }
        }
        string
    }

    fn string_length(&self, string: NativeHandle) -> i32 {
        // Safety: strings come from `string_new_utf16`
        unsafe { memory::read::<i32>(string, STRING_LENGTH) }
    }

    fn string_chars(&self, string: NativeHandle) -> *const u16 {
        string.add(STRING_CHARS).as_ptr::<u16>() as *const u16
    }

    fn object_new(&self, class: NativeHandle) -> NativeHandle {
        let size = self.class(class).map_or(0, |c| c.instance_size() as usize).max(OBJECT_HEADER_SIZE);
        let object = memory::alloc_zeroed(size);
        // Safety: every object starts with its class pointer
        unsafe { memory::write_handle(object, 0, class) };
        object
    }

    fn object_get_class(&self, object: NativeHandle) -> NativeHandle {
        if object.is_null() {
            return NativeHandle::NULL;
        }
        // Safety: objects come from `object_new`
        unsafe { memory::read_handle(object, 0) }
    }

    fn object_unbox(&self, object: NativeHandle) -> NativeHandle {
        object.add(OBJECT_HEADER_SIZE)
    }

    fn value_box(&self, class: NativeHandle, data: NativeHandle) -> NativeHandle {
        let object = self.object_new(class);
        let size = self.value_size(class);
        // Safety: `data` holds one unboxed value of `class`
        unsafe { memory::copy(data, object.add(OBJECT_HEADER_SIZE), size) };
        object
    }

    fn array_new(&self, element_class: NativeHandle, length: usize) -> NativeHandle {
        let array = memory::alloc_zeroed(ARRAY_ELEMENTS + length * self.value_size(element_class));
        // Safety: the block covers the array header
        unsafe {
            memory::write_handle(array, 0, self.corlib_class("Array"));
            memory::write::<usize>(array, ARRAY_LENGTH, length);
        }
        array
    }

    fn gchandle_new(&self, object: NativeHandle, _pinned: bool) -> u32 {
        let mut state = self.state.lock();
        state.gchandles.push(object);
        state.gchandles.len() as u32
    }

    fn gchandle_get_target(&self, handle: u32) -> NativeHandle {
        let state = self.state.lock();
        state.gchandles.get((handle as usize).wrapping_sub(1)).copied().unwrap_or_default()
    }

    fn gchandle_free(&self, handle: u32) {
        let mut state = self.state.lock();
        if let Some(slot) = state.gchandles.get_mut((handle as usize).wrapping_sub(1)) {
            *slot = NativeHandle::NULL;
        }
    }

    fn gc_wbarrier_set_field(&self, _object: NativeHandle, field_addr: NativeHandle, value: NativeHandle) {
        self.barriers.fetch_add(1, Ordering::SeqCst);
        // Safety: callers pass a reference slot inside `object`
        unsafe { memory::write_handle(field_addr, 0, value) }
    }

    unsafe fn runtime_invoke(
        &self,
        method: NativeHandle,
        object: NativeHandle,
        params: *mut *mut c_void,
        exception: *mut NativeHandle,
    ) -> NativeHandle {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let Some(m) = self.layouts.wrap_method(method) else {
            return NativeHandle::NULL;
        };
        let invoker = m.invoker_method();
        if !invoker.is_null() {
            let invoker = std::mem::transmute::<usize, InvokerFn>(invoker.addr());
            return invoker(m.method_pointer(), method, object, params);
        }

        let behaviour = self.state.lock().behaviours.get(&method).cloned();
        let Some(behaviour) = behaviour else {
            return NativeHandle::NULL;
        };
        let count = m.parameters_count() as usize;
        let args: &[*mut c_void] = if params.is_null() || count == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(params, count)
        };
        match behaviour(object, args) {
            Ok(value) => value,
            Err(thrown) => {
                if !exception.is_null() {
                    *exception = thrown;
                }
                NativeHandle::NULL
            }
        }
    }

    unsafe fn runtime_invoke_convert_args(
        &self,
        method: NativeHandle,
        object: NativeHandle,
        params: *mut NativeHandle,
        count: i32,
        exception: *mut NativeHandle,
    ) -> NativeHandle {
        invoke_unboxing(self, method, object, params, count, exception)
    }

    fn resolve_icall(&self, name: &str) -> NativeHandle {
        self.state.lock().icalls.get(name).copied().unwrap_or_default()
    }

    fn module_base(&self, module: &str) -> NativeHandle {
        self.state.lock().modules.get(module).copied().unwrap_or_default()
    }
}
