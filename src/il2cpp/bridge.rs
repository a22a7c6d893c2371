//! Resolution and invocation across the runtime boundary
//!
//! Lookups never fail hard: a missing image, class or field yields the null
//! handle and an error log, and a missing method yields a sentinel MethodInfo
//! that later calls recognise and refuse to invoke.

use std::borrow::Cow;
use std::ffi::c_void;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, trace, warn};
use widestring::U16Str;

use super::api::Il2CppApi;
use super::icall::{ICall, IcallTable};
use super::offsets::{
    ARRAY_ELEMENTS, ARRAY_LENGTH, DELEGATE_INVOKE_IMPL, DELEGATE_METHOD, DELEGATE_METHOD_PTR, DELEGATE_TARGET,
    UNITY_PLAYER_LIBRARY,
};
use crate::layout::LayoutRegistry;
use crate::memory::{self, NativeHandle, SIZE_OF_PTR};

static GENERIC_ARITY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"`\d+").ok());

/// Strip generic arity suffixes and unify nested type separators
pub fn normalize_type_name(name: &str) -> String {
    let stripped = match GENERIC_ARITY.as_ref() {
        Some(arity) => arity.replace_all(name, ""),
        None => Cow::Borrowed(name),
    };
    stripped.replace(['/', '+'], ".")
}

/// One argument of a converting invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Argument<'a> {
    Null,
    Object(NativeHandle),
    String(&'a str),
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Argument<'_> {
    fn corlib_class(&self) -> Option<&'static str> {
        Some(match self {
            Argument::Bool(_) => "Boolean",
            Argument::I32(_) => "Int32",
            Argument::U32(_) => "UInt32",
            Argument::I64(_) => "Int64",
            Argument::U64(_) => "UInt64",
            Argument::F32(_) => "Single",
            Argument::F64(_) => "Double",
            _ => return None,
        })
    }

    /// Little-endian bytes of a value argument
    fn value_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        match *self {
            Argument::Bool(v) => bytes[0] = v as u8,
            Argument::I32(v) => bytes[..4].copy_from_slice(&v.to_le_bytes()),
            Argument::U32(v) => bytes[..4].copy_from_slice(&v.to_le_bytes()),
            Argument::I64(v) => bytes.copy_from_slice(&v.to_le_bytes()),
            Argument::U64(v) => bytes.copy_from_slice(&v.to_le_bytes()),
            Argument::F32(v) => bytes[..4].copy_from_slice(&v.to_le_bytes()),
            Argument::F64(v) => bytes.copy_from_slice(&v.to_le_bytes()),
            _ => {}
        }
        bytes
    }
}

/// Outcome of a runtime invocation
///
/// `value` is null both for void returns and for calls that threw; check
/// `exception` where the two must be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Invocation {
    pub value: NativeHandle,
    pub exception: NativeHandle,
}

impl Invocation {
    pub fn threw(&self) -> bool {
        !self.exception.is_null()
    }
}

/// Bounds-checked view of a native `Il2CppArray`
#[derive(Clone, Copy)]
pub struct ArrayView<'a> {
    bridge: &'a Il2CppBridge,
    ptr: NativeHandle,
}

impl ArrayView<'_> {
    pub fn ptr(&self) -> NativeHandle {
        self.ptr
    }

    pub fn len(&self) -> usize {
        // Safety: the view was created over a live array
        unsafe { memory::read::<usize>(self.ptr, ARRAY_LENGTH) }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `index` of a value-type array
    pub fn get<T: Copy>(&self, index: usize) -> Option<T> {
        if index >= self.len() {
            return None;
        }
        // Safety: index is in bounds and elements are `T`-sized
        Some(unsafe { memory::read::<T>(self.ptr, ARRAY_ELEMENTS + index * std::mem::size_of::<T>()) })
    }

    pub fn set<T: Copy>(&self, index: usize, value: T) -> bool {
        if index >= self.len() {
            return false;
        }
        // Safety: see `get`
        unsafe { memory::write::<T>(self.ptr, ARRAY_ELEMENTS + index * std::mem::size_of::<T>(), value) };
        true
    }

    /// Element `index` of a reference array
    pub fn get_reference(&self, index: usize) -> Option<NativeHandle> {
        self.get::<NativeHandle>(index)
    }

    /// Store a reference through the write barrier
    pub fn set_reference(&self, index: usize, value: NativeHandle) -> bool {
        if index >= self.len() {
            return false;
        }
        let slot = self.ptr.add(ARRAY_ELEMENTS + index * SIZE_OF_PTR);
        self.bridge.api.gc_wbarrier_set_field(self.ptr, slot, value);
        true
    }
}

/// Name-, token- and signature-based access to the running runtime
pub struct Il2CppBridge {
    api: Arc<dyn Il2CppApi>,
    layouts: Arc<LayoutRegistry>,
    icalls: IcallTable,
    icall_module: String,
    images: DashMap<String, NativeHandle>,
    /// Missing-method descriptor to its sentinel
    missing: DashMap<String, NativeHandle>,
    sentinels: DashMap<NativeHandle, String>,
    corlib_classes: DashMap<&'static str, NativeHandle>,
}

impl std::fmt::Debug for Il2CppBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Il2CppBridge").field("images", &self.images.len()).finish_non_exhaustive()
    }
}

impl Il2CppBridge {
    pub fn new(api: Arc<dyn Il2CppApi>, layouts: Arc<LayoutRegistry>) -> Self {
        Self::with_icalls(api, layouts, IcallTable::builtin(), UNITY_PLAYER_LIBRARY)
    }

    pub fn with_icalls(
        api: Arc<dyn Il2CppApi>,
        layouts: Arc<LayoutRegistry>,
        icalls: IcallTable,
        icall_module: &str,
    ) -> Self {
        Il2CppBridge {
            api,
            layouts,
            icalls,
            icall_module: icall_module.to_string(),
            images: DashMap::new(),
            missing: DashMap::new(),
            sentinels: DashMap::new(),
            corlib_classes: DashMap::new(),
        }
    }

    pub fn api(&self) -> &dyn Il2CppApi {
        self.api.as_ref()
    }

    pub fn layouts(&self) -> &LayoutRegistry {
        &self.layouts
    }

    pub fn layouts_arc(&self) -> &Arc<LayoutRegistry> {
        &self.layouts
    }

    // Images

    /// Index every image of the domain by name; returns how many were found
    pub fn load_images(&self) -> usize {
        let domain = self.api.domain_get();
        self.api.thread_attach(domain);
        let mut count = 0;
        for assembly in self.api.domain_get_assemblies(domain) {
            let image = self.api.assembly_get_image(assembly);
            let name = self.api.image_get_name(image).or_else(|| {
                // Safety: the runtime returned this image
                unsafe { self.layouts.wrap_image(image) }.and_then(|i| i.name_str())
            });
            if let Some(name) = name {
                self.register_image(&name, image);
                count += 1;
            }
        }
        debug!("indexed {} images", count);
        count
    }

    /// Make `image` resolvable as `name` (and without its `.dll` extension)
    pub fn register_image(&self, name: &str, image: NativeHandle) {
        if let Some(stem) = name.strip_suffix(".dll") {
            self.images.insert(stem.to_string(), image);
        }
        self.images.insert(name.to_string(), image);
    }

    fn lookup_image(&self, name: &str) -> Option<NativeHandle> {
        let stem = name.strip_suffix(".dll").unwrap_or(name);
        self.images.get(name).or_else(|| self.images.get(stem)).map(|image| *image)
    }

    pub fn get_image(&self, name: &str) -> NativeHandle {
        let found = self.lookup_image(name).or_else(|| {
            // Assemblies may have loaded since the last scan
            self.load_images();
            self.lookup_image(name)
        });
        match found {
            Some(image) => image,
            None => {
                error!("Assembly {} is not registered in il2cpp", name);
                NativeHandle::NULL
            }
        }
    }

    // Classes and fields

    pub fn get_class(&self, assembly: &str, namespace: &str, name: &str) -> NativeHandle {
        let image = self.get_image(assembly);
        if image.is_null() {
            return NativeHandle::NULL;
        }
        let class = self.api.class_from_name(image, namespace, name);
        if class.is_null() {
            error!("Class {}.{} not found in {}", namespace, name, assembly);
        }
        class
    }

    /// A class of the core library, cached
    pub fn corlib_class(&self, name: &'static str) -> NativeHandle {
        if let Some(class) = self.corlib_classes.get(name) {
            return *class;
        }
        let class = self.get_class("mscorlib", "System", name);
        if !class.is_null() {
            self.corlib_classes.insert(name, class);
        }
        class
    }

    pub fn get_nested_type(&self, enclosing: NativeHandle, name: &str) -> NativeHandle {
        if enclosing.is_null() {
            return NativeHandle::NULL;
        }
        let mut iter = 0usize;
        loop {
            let nested = self.api.class_get_nested_types(enclosing, &mut iter);
            if nested.is_null() {
                break;
            }
            if self.api.class_get_name(nested).as_deref() == Some(name) {
                return nested;
            }
        }
        error!("Nested type {} not found in {}", name, self.class_name(enclosing));
        NativeHandle::NULL
    }

    pub fn get_field(&self, class: NativeHandle, name: &str) -> NativeHandle {
        if class.is_null() {
            return NativeHandle::NULL;
        }
        let field = self.api.class_get_field_from_name(class, name);
        if field.is_null() {
            error!("Field {} was not found on class {}", name, self.class_name(class));
        }
        field
    }

    /// `Namespace.Name` of a class, for logs and matching
    pub fn class_name(&self, class: NativeHandle) -> String {
        // Safety: callers pass classes the runtime handed out
        match unsafe { self.layouts.wrap_class(class) } {
            Some(class) => class.full_name(),
            None => "<null>".to_string(),
        }
    }

    /// Normalized name of an `Il2CppType`
    pub fn type_name(&self, ty: NativeHandle) -> Option<String> {
        self.api.type_get_name(ty).map(|name| normalize_type_name(&name))
    }

    // Methods

    fn methods_of(&self, class: NativeHandle) -> Vec<NativeHandle> {
        let mut methods = Vec::new();
        let mut iter = 0usize;
        loop {
            let method = self.api.class_get_methods(class, &mut iter);
            if method.is_null() {
                return methods;
            }
            methods.push(method);
        }
    }

    pub fn get_method_by_token(&self, class: NativeHandle, token: u32) -> NativeHandle {
        if !class.is_null() {
            if let Some(method) = self.methods_of(class).into_iter().find(|m| self.api.method_get_token(*m) == token) {
                return method;
            }
        }
        let descriptor = format!("{}::<token 0x{:08x}>", self.class_name(class), token);
        error!("Unable to find method {}", descriptor);
        self.missing_method_for(class, &descriptor)
    }

    /// Find a method by name, genericity, return type and parameter types
    ///
    /// Type names are compared after [`normalize_type_name`]. A single
    /// candidate with the right name and arity is accepted even when the
    /// types disagree.
    pub fn get_method(
        &self,
        class: NativeHandle,
        is_generic: bool,
        name: &str,
        return_type: &str,
        arg_types: &[&str],
    ) -> NativeHandle {
        let descriptor = format!("{}::{}({})", self.class_name(class), name, arg_types.join(", "));
        if class.is_null() {
            error!("Unable to find method {} on a null class", descriptor);
            return self.missing_method_for(class, &descriptor);
        }

        let candidates: Vec<NativeHandle> = self
            .methods_of(class)
            .into_iter()
            .filter(|m| {
                self.api.method_get_name(*m).as_deref() == Some(name)
                    && self.api.method_get_param_count(*m) as usize == arg_types.len()
                    && self.api.method_is_generic(*m) == is_generic
            })
            .collect();

        let wanted_return = normalize_type_name(return_type);
        let wanted_args: Vec<String> = arg_types.iter().map(|t| normalize_type_name(t)).collect();
        let exact = candidates.iter().copied().find(|m| {
            self.type_name(self.api.method_get_return_type(*m)).as_deref() == Some(wanted_return.as_str())
                && wanted_args
                    .iter()
                    .enumerate()
                    .all(|(i, t)| self.type_name(self.api.method_get_param(*m, i as u32)).as_deref() == Some(t))
        });
        if let Some(method) = exact {
            return method;
        }

        match candidates.as_slice() {
            [only] => {
                warn!("Method {} matched by name and arity only, type names differ", descriptor);
                *only
            }
            _ => {
                error!("Unable to find method {} ({} candidates)", descriptor, candidates.len());
                self.missing_method_for(class, &descriptor)
            }
        }
    }

    /// The sentinel standing in for `descriptor`, created once
    pub fn missing_method(&self, descriptor: &str) -> NativeHandle {
        self.missing_method_for(NativeHandle::NULL, descriptor)
    }

    fn missing_method_for(&self, class: NativeHandle, descriptor: &str) -> NativeHandle {
        let sentinel = *self.missing.entry(descriptor.to_string()).or_insert_with(|| {
            let method = self.layouts.new_method();
            method.set_name(memory::leak_cstring(descriptor));
            method.set_declaring_class(class);
            method.set_slot(u16::MAX);
            method.ptr()
        });
        self.sentinels.entry(sentinel).or_insert_with(|| descriptor.to_string());
        sentinel
    }

    pub fn is_missing_method(&self, method: NativeHandle) -> bool {
        self.sentinels.contains_key(&method)
    }

    /// `Class::Method` for logs
    pub fn method_label(&self, method: NativeHandle) -> String {
        if let Some(descriptor) = self.sentinels.get(&method) {
            return descriptor.clone();
        }
        // Safety: callers pass methods the runtime handed out
        match unsafe { self.layouts.wrap_method(method) } {
            Some(m) => format!(
                "{}::{}",
                self.class_name(m.declaring_class()),
                self.api.method_get_name(method).or_else(|| m.name_str()).unwrap_or_default()
            ),
            None => "<null method>".to_string(),
        }
    }

    // Strings

    /// Decode a native string; `None` for null, never for empty
    pub fn string_to_managed(&self, string: NativeHandle) -> Option<String> {
        if string.is_null() {
            return None;
        }
        let len = self.api.string_length(string).max(0) as usize;
        let chars = self.api.string_chars(string);
        if len == 0 || chars.is_null() {
            return Some(String::new());
        }
        // Safety: the runtime string holds `len` UTF-16 units at `chars`
        let units = unsafe { U16Str::from_ptr(chars, len) };
        Some(units.to_string_lossy())
    }

    /// Allocate a native string; null for `None`
    pub fn managed_to_string(&self, value: Option<&str>) -> NativeHandle {
        match value {
            Some(s) => {
                let units: Vec<u16> = s.encode_utf16().collect();
                self.api.string_new_utf16(&units)
            }
            None => NativeHandle::NULL,
        }
    }

    // Invocation

    fn log_exception(&self, method: NativeHandle, exception: NativeHandle) {
        error!("Exception in {}: {}", self.method_label(method), self.exception_to_string(exception));
    }

    /// Call `method` with pre-marshaled arguments
    ///
    /// Value-type arguments must already be pointers to their values.
    pub fn invoke_raw(&self, method: NativeHandle, object: NativeHandle, args: &mut [*mut c_void]) -> Invocation {
        if self.is_missing_method(method) {
            error!("Attempted to invoke missing method {}", self.method_label(method));
            return Invocation::default();
        }
        let mut exception = NativeHandle::NULL;
        let params = if args.is_empty() { std::ptr::null_mut() } else { args.as_mut_ptr() };
        // Safety: the caller matched `args` to the method's signature
        let value = unsafe { self.api.runtime_invoke(method, object, params, &mut exception) };
        self.finish(method, value, exception)
    }

    /// Call `method`, boxing value arguments and allocating strings
    pub fn invoke(&self, method: NativeHandle, object: NativeHandle, args: &[Argument<'_>]) -> Invocation {
        if self.is_missing_method(method) {
            error!("Attempted to invoke missing method {}", self.method_label(method));
            return Invocation::default();
        }
        let mut boxed: Vec<NativeHandle> = args.iter().map(|arg| self.box_argument(arg)).collect();
        let mut exception = NativeHandle::NULL;
        let params = if boxed.is_empty() { std::ptr::null_mut() } else { boxed.as_mut_ptr() };
        // Safety: every argument is now an object reference
        let value = unsafe {
            self.api.runtime_invoke_convert_args(method, object, params, boxed.len() as i32, &mut exception)
        };
        self.finish(method, value, exception)
    }

    fn finish(&self, method: NativeHandle, value: NativeHandle, exception: NativeHandle) -> Invocation {
        if exception.is_null() {
            Invocation { value, exception }
        } else {
            self.log_exception(method, exception);
            Invocation { value: NativeHandle::NULL, exception }
        }
    }

    fn box_argument(&self, arg: &Argument<'_>) -> NativeHandle {
        match *arg {
            Argument::Null => NativeHandle::NULL,
            Argument::Object(object) => object,
            Argument::String(s) => self.managed_to_string(Some(s)),
            _ => {
                let Some(name) = arg.corlib_class() else {
                    return NativeHandle::NULL;
                };
                let mut bytes = arg.value_bytes();
                self.api.value_box(self.corlib_class(name), NativeHandle::from(bytes.as_mut_ptr()))
            }
        }
    }

    /// Call the instance method `name` taking `args.len()` parameters, searching base classes
    pub fn call_method(&self, object: NativeHandle, name: &str, args: &[Argument<'_>]) -> Invocation {
        let mut class = self.api.object_get_class(object);
        while !class.is_null() {
            let method = self.api.class_get_method_from_name(class, name, args.len() as i32);
            if !method.is_null() {
                return self.invoke(method, object, args);
            }
            class = self.api.class_get_parent(class);
        }
        error!("Method {} with {} arguments not found on object {}", name, args.len(), object);
        Invocation::default()
    }

    pub fn call_static(&self, class: NativeHandle, name: &str, args: &[Argument<'_>]) -> Invocation {
        let method = self.api.class_get_method_from_name(class, name, args.len() as i32);
        if method.is_null() {
            error!("Static method {}::{} not found", self.class_name(class), name);
            return Invocation::default();
        }
        self.invoke(method, NativeHandle::NULL, args)
    }

    /// Describe an exception object, preferring its own `ToString`
    pub fn exception_to_string(&self, exception: NativeHandle) -> String {
        if exception.is_null() {
            return "<null exception>".to_string();
        }
        let class = self.api.object_get_class(exception);
        let to_string = self.api.class_get_method_from_name(class, "ToString", 0);
        if !to_string.is_null() {
            let mut nested = NativeHandle::NULL;
            // Safety: `ToString` takes no arguments
            let text = unsafe { self.api.runtime_invoke(to_string, exception, std::ptr::null_mut(), &mut nested) };
            if nested.is_null() {
                if let Some(text) = self.string_to_managed(text) {
                    return text;
                }
            }
        }
        // Safety: `exception` is an exception object
        match unsafe { self.layouts.wrap_exception(exception) } {
            Some(ex) => {
                let class_name =
                    self.string_to_managed(ex.class_name()).unwrap_or_else(|| self.class_name(class));
                let message = self.string_to_managed(ex.message()).unwrap_or_default();
                format!("{}: {}", class_name, message)
            }
            None => "<null exception>".to_string(),
        }
    }

    // Boxing, arrays and fields

    /// Box an unmanaged value of `class`
    pub fn box_value<T: Copy>(&self, class: NativeHandle, value: T) -> NativeHandle {
        let mut value = value;
        self.api.value_box(class, NativeHandle::from(&mut value as *mut T))
    }

    /// Read the value out of a boxed object; `None` for null
    ///
    /// # Safety
    /// `object` must be a boxed `T`.
    pub unsafe fn unbox<T: Copy>(&self, object: NativeHandle) -> Option<T> {
        object.non_null().map(|o| memory::read::<T>(self.api.object_unbox(o), 0))
    }

    pub fn new_array(&self, element_class: NativeHandle, length: usize) -> Option<ArrayView<'_>> {
        // Safety: a fresh array from the runtime
        unsafe { self.wrap_array(self.api.array_new(element_class, length)) }
    }

    /// # Safety
    /// A non-null `array` must be a live `Il2CppArray`.
    pub unsafe fn wrap_array(&self, array: NativeHandle) -> Option<ArrayView<'_>> {
        array.non_null().map(|ptr| ArrayView { bridge: self, ptr })
    }

    fn field_offset(&self, field: NativeHandle) -> usize {
        // Safety: `field` came from a field lookup
        match unsafe { self.layouts.wrap_field(field) } {
            Some(f) => f.offset().max(0) as usize,
            None => self.api.field_get_offset(field) as usize,
        }
    }

    /// Read a value field of `object`
    ///
    /// # Safety
    /// `object` must be an instance of the field's class and `T` its type.
    pub unsafe fn field_value<T: Copy>(&self, object: NativeHandle, field: NativeHandle) -> T {
        memory::read::<T>(object, self.field_offset(field))
    }

    /// # Safety
    /// See [`Il2CppBridge::field_value`].
    pub unsafe fn set_field_value<T: Copy>(&self, object: NativeHandle, field: NativeHandle, value: T) {
        memory::write::<T>(object, self.field_offset(field), value)
    }

    /// # Safety
    /// `object` must be an instance of the field's class.
    pub unsafe fn field_reference(&self, object: NativeHandle, field: NativeHandle) -> NativeHandle {
        memory::read_handle(object, self.field_offset(field))
    }

    /// Store a reference field through the write barrier
    ///
    /// # Safety
    /// See [`Il2CppBridge::field_reference`].
    pub unsafe fn set_field_reference(&self, object: NativeHandle, field: NativeHandle, value: NativeHandle) {
        let slot = object.add(self.field_offset(field));
        self.api.gc_wbarrier_set_field(object, slot, value)
    }

    // Delegates

    /// A delegate of `delegate_class` that calls `method` on `target`
    pub fn new_delegate(&self, delegate_class: NativeHandle, target: NativeHandle, method: NativeHandle) -> NativeHandle {
        let delegate = self.api.object_new(delegate_class);
        if delegate.is_null() {
            error!("Unable to allocate delegate of {}", self.class_name(delegate_class));
            return NativeHandle::NULL;
        }
        if self.layouts.must_use_delegate_constructor() {
            let ctor = self.api.class_get_method_from_name(delegate_class, ".ctor", 2);
            if ctor.is_null() {
                error!("Delegate {} has no two-argument constructor", self.class_name(delegate_class));
                return NativeHandle::NULL;
            }
            let mut method_value = method;
            let mut args = [target.as_void(), (&mut method_value as *mut NativeHandle).cast::<c_void>()];
            if self.invoke_raw(ctor, delegate, &mut args).threw() {
                return NativeHandle::NULL;
            }
        } else {
            // Safety: method was resolved by the caller
            let pointer = unsafe { self.layouts.wrap_method(method) }.map_or(NativeHandle::NULL, |m| m.method_pointer());
            // Safety: `delegate` is a fresh delegate object
            unsafe {
                memory::write_handle(delegate, DELEGATE_METHOD_PTR, pointer);
                memory::write_handle(delegate, DELEGATE_INVOKE_IMPL, pointer);
                memory::write_handle(delegate, DELEGATE_METHOD, method);
            }
            self.api.gc_wbarrier_set_field(delegate, delegate.add(DELEGATE_TARGET), target);
        }
        trace!("created delegate {} for {}", delegate, self.method_label(method));
        delegate
    }

    // Internal calls

    /// Resolve an internal call, failing on first use if it cannot be found
    ///
    /// # Safety
    /// `F` must be the call's `extern "C"` function pointer type.
    pub unsafe fn resolve_icall<F: Copy>(&self, signature: &str) -> ICall<F> {
        ICall::resolve(self.api.as_ref(), &self.icalls, &self.icall_module, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TypeCode;
    use crate::fake::{ClassSpec, FakeRuntime};
    use crate::il2cpp::api::Il2CppApi;
    use crate::il2cpp::offsets::OBJECT_HEADER_SIZE;
    use crate::version::UnityVersion;

    fn bridge_for(fake: &Arc<FakeRuntime>) -> Il2CppBridge {
        Il2CppBridge::new(fake.clone(), fake.layouts().clone())
    }

    #[test]
    fn test_normalize_type_name() {
        assert_eq!(normalize_type_name("System.Collections.Generic.List`1"), "System.Collections.Generic.List");
        assert_eq!(normalize_type_name("Outer/Inner"), "Outer.Inner");
        assert_eq!(normalize_type_name("Outer+Inner`2/Deep"), "Outer.Inner.Deep");
    }

    #[test]
    fn test_string_round_trip() {
        let fake = FakeRuntime::shared();
        let bridge = bridge_for(&fake);
        for s in ["", "a", "héllo", "emoji \u{1F980} and \u{10437}"] {
            let native = bridge.managed_to_string(Some(s));
            assert!(!native.is_null());
            assert_eq!(bridge.string_to_managed(native).as_deref(), Some(s));
        }
        assert_eq!(bridge.managed_to_string(None), NativeHandle::NULL);
        assert_eq!(bridge.string_to_managed(NativeHandle::NULL), None);
    }

    #[test]
    fn test_get_class_and_field() {
        let fake = FakeRuntime::shared();
        let image = fake.add_image("Assembly-CSharp.dll");
        let class = fake.add_class(image, ClassSpec::new("Game", "Player").instance_size(0x20));
        let field = fake.add_field(class, "health", fake.primitive_type(TypeCode::I4), 0x18);
        let bridge = bridge_for(&fake);

        assert_eq!(bridge.get_class("Assembly-CSharp", "Game", "Player"), class.ptr());
        assert_eq!(bridge.get_class("Assembly-CSharp.dll", "Game", "Player"), class.ptr());
        assert!(bridge.get_class("Missing", "Game", "Player").is_null());
        assert!(bridge.get_class("Assembly-CSharp", "Game", "Nobody").is_null());
        assert_eq!(bridge.get_field(class.ptr(), "health"), field);
        assert!(bridge.get_field(class.ptr(), "mana").is_null());

        let object = fake.object_new(class.ptr());
        unsafe {
            bridge.set_field_value::<i32>(object, field, 77);
            assert_eq!(bridge.field_value::<i32>(object, field), 77);
            assert_eq!(memory::read::<i32>(object, 0x18), 77);
        }
    }

    #[test]
    fn test_nested_type_lookup() {
        let fake = FakeRuntime::shared();
        let image = fake.add_image("Assembly-CSharp.dll");
        let outer = fake.add_class(image, ClassSpec::new("Game", "Outer"));
        let inner = fake.add_class(image, ClassSpec::new("", "Inner"));
        fake.add_nested_type(outer, inner);
        let bridge = bridge_for(&fake);
        assert_eq!(bridge.get_nested_type(outer.ptr(), "Inner"), inner.ptr());
        assert!(bridge.get_nested_type(outer.ptr(), "Other").is_null());
    }

    #[test]
    fn test_method_lookup_by_signature() {
        let fake = FakeRuntime::shared();
        let image = fake.add_image("Assembly-CSharp.dll");
        let class = fake.add_class(image, ClassSpec::new("Game", "Shop"));
        let void = fake.primitive_type(TypeCode::VOID);
        let int = fake.primitive_type(TypeCode::I4);
        let string = fake.primitive_type(TypeCode::STRING);
        let by_int = fake.add_method(class, "Buy", void, &[int]);
        let by_name = fake.add_method(class, "Buy", void, &[string]);
        let single = fake.add_method(class, "Sell", void, &[int]);
        let bridge = bridge_for(&fake);

        let exact = bridge.get_method(class.ptr(), false, "Buy", "System.Void", &["System.Int32"]);
        assert_eq!(exact, by_int);
        let exact = bridge.get_method(class.ptr(), false, "Buy", "System.Void", &["System.String"]);
        assert_eq!(exact, by_name);

        // a wrong type name still finds the only same-arity candidate
        let stub = bridge.get_method(class.ptr(), false, "Sell", "System.Void", &["Obfuscated.XYZ"]);
        assert_eq!(stub, single);

        // two candidates and no exact match
        let missing = bridge.get_method(class.ptr(), false, "Buy", "System.Void", &["System.Boolean"]);
        assert!(bridge.is_missing_method(missing));
        let again = bridge.get_method(class.ptr(), false, "Buy", "System.Void", &["System.Boolean"]);
        assert_eq!(missing, again);

        // genericity must agree
        assert!(bridge.is_missing_method(bridge.get_method(class.ptr(), true, "Sell", "System.Void", &["System.Int32"])));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_name_and_arity_match_is_a_warning() {
        let fake = FakeRuntime::shared();
        let image = fake.add_image("Assembly-CSharp.dll");
        let class = fake.add_class(image, ClassSpec::new("Game", "Bank"));
        let single = fake.add_method(class, "Deposit", fake.primitive_type(TypeCode::VOID), &[fake.primitive_type(TypeCode::I8)]);
        let bridge = bridge_for(&fake);

        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let found = tracing::subscriber::with_default(subscriber, || {
            bridge.get_method(class.ptr(), false, "Deposit", "System.Void", &["a.b"])
        });
        assert_eq!(found, single);
        let text = String::from_utf8_lossy(&log.0.lock()).into_owned();
        let line = text.lines().find(|l| l.contains("matched by name and arity only")).unwrap();
        assert!(line.contains("WARN"), "{}", line);
    }

    #[test]
    fn test_method_lookup_by_token() {
        let fake = FakeRuntime::shared();
        let image = fake.add_image("Assembly-CSharp.dll");
        let class = fake.add_class(image, ClassSpec::new("Game", "Shop"));
        let void = fake.primitive_type(TypeCode::VOID);
        let method = fake.add_method(class, "Open", void, &[]);
        unsafe { fake.layouts().wrap_method(method) }.unwrap().set_token(0x0600_0042);
        let bridge = bridge_for(&fake);

        assert_eq!(bridge.get_method_by_token(class.ptr(), 0x0600_0042), method);
        assert!(bridge.is_missing_method(bridge.get_method_by_token(class.ptr(), 0x0600_0001)));
        assert!(bridge.is_missing_method(bridge.get_method_by_token(NativeHandle::NULL, 0x0600_0042)));
    }

    #[test]
    fn test_invoking_sentinel_does_not_call_native() {
        let fake = FakeRuntime::shared();
        let bridge = bridge_for(&fake);
        let sentinel = bridge.missing_method("Nowhere::Nothing()");
        assert_eq!(bridge.invoke(sentinel, NativeHandle::NULL, &[Argument::I32(1)]), Invocation::default());
        assert_eq!(bridge.invoke_raw(sentinel, NativeHandle::NULL, &mut []), Invocation::default());
        assert_eq!(fake.invocation_count(), 0);
    }

    #[test]
    fn test_invoke_boxes_values_and_reports_exceptions() {
        let fake = FakeRuntime::shared();
        let image = fake.add_image("Assembly-CSharp.dll");
        let class = fake.add_class(image, ClassSpec::new("Game", "Math"));
        let int = fake.primitive_type(TypeCode::I4);
        let add = fake.add_method(class, "Add", int, &[int, int]);
        let explode = fake.add_method(class, "Explode", int, &[]);
        let int_class = fake.corlib_class("Int32");
        let behaviour_fake = fake.clone();
        fake.on_invoke(add, move |_, params| {
            let a = unsafe { memory::read::<i32>(NativeHandle::from(params[0]), 0) };
            let b = unsafe { memory::read::<i32>(NativeHandle::from(params[1]), 0) };
            let mut sum = a + b;
            Ok(behaviour_fake.value_box(int_class, NativeHandle::from(&mut sum as *mut i32)))
        });
        let thrower = fake.clone();
        fake.on_invoke(explode, move |_, _| Err(thrower.new_exception("System", "InvalidOperationException", "boom")));
        let bridge = bridge_for(&fake);

        let result = bridge.invoke(add, NativeHandle::NULL, &[Argument::I32(40), Argument::I32(2)]);
        assert!(!result.threw());
        assert_eq!(unsafe { bridge.unbox::<i32>(result.value) }, Some(42));

        let failed = bridge.invoke(explode, NativeHandle::NULL, &[]);
        assert!(failed.threw());
        assert!(failed.value.is_null());
        assert_eq!(bridge.exception_to_string(failed.exception), "System.InvalidOperationException: boom");
    }

    #[test]
    fn test_call_method_walks_parents() {
        let fake = FakeRuntime::shared();
        let image = fake.add_image("Assembly-CSharp.dll");
        let base = fake.add_class(image, ClassSpec::new("Game", "Base"));
        let derived = fake.add_class(image, ClassSpec::new("Game", "Derived").parent(base.ptr()));
        let void = fake.primitive_type(TypeCode::VOID);
        let reset = fake.add_method(base, "Reset", void, &[]);
        fake.on_invoke(reset, |_, _| Ok(NativeHandle::from_addr(0x51)));
        let bridge = bridge_for(&fake);

        let object = fake.object_new(derived.ptr());
        assert_eq!(bridge.call_method(object, "Reset", &[]).value.addr(), 0x51);
        assert_eq!(bridge.call_method(object, "Reset", &[Argument::Null]), Invocation::default());
        assert_eq!(bridge.call_static(base.ptr(), "Reset", &[]).value.addr(), 0x51);
    }

    #[test]
    fn test_arrays_bounds_and_barrier() {
        let fake = FakeRuntime::shared();
        let bridge = bridge_for(&fake);
        let ints = bridge.new_array(fake.corlib_class("Int32"), 3).unwrap();
        assert_eq!(ints.len(), 3);
        assert!(ints.set::<i32>(2, -5));
        assert_eq!(ints.get::<i32>(2), Some(-5));
        assert_eq!(ints.get::<i32>(3), None);
        assert!(!ints.set::<i32>(3, 1));

        let objects = bridge.new_array(fake.corlib_class("Object"), 2).unwrap();
        let value = NativeHandle::from_addr(0xbeef0);
        assert!(objects.set_reference(1, value));
        assert_eq!(objects.get_reference(1), Some(value));
        assert_eq!(fake.barrier_count(), 1);
    }

    #[test]
    fn test_delegate_fields_before_constructor_version() {
        let fake = FakeRuntime::shared_for(UnityVersion::new(2020, 3, 0));
        let image = fake.add_image("Assembly-CSharp.dll");
        let class = fake.add_class(image, ClassSpec::new("Game", "Callback").instance_size(0x40));
        let void = fake.primitive_type(TypeCode::VOID);
        let target_method = fake.add_method(class, "Fire", void, &[]);
        unsafe { fake.layouts().wrap_method(target_method) }.unwrap().set_method_pointer(NativeHandle::from_addr(0x7000));
        let bridge = bridge_for(&fake);

        let target = NativeHandle::from_addr(0x1230);
        let delegate = bridge.new_delegate(class.ptr(), target, target_method);
        unsafe {
            assert_eq!(memory::read_handle(delegate, DELEGATE_METHOD_PTR).addr(), 0x7000);
            assert_eq!(memory::read_handle(delegate, DELEGATE_METHOD), target_method);
            assert_eq!(memory::read_handle(delegate, DELEGATE_TARGET), target);
        }
    }

    #[test]
    fn test_delegate_constructor_from_2021_2() {
        let fake = FakeRuntime::shared_for(UnityVersion::new(2021, 3, 0));
        let image = fake.add_image("Assembly-CSharp.dll");
        let class = fake.add_class(image, ClassSpec::new("Game", "Callback").instance_size(0x40));
        let void = fake.primitive_type(TypeCode::VOID);
        let object = fake.primitive_type(TypeCode::OBJECT);
        let ptr = fake.primitive_type(TypeCode::I);
        let ctor = fake.add_method(class, ".ctor", void, &[object, ptr]);
        let target_method = fake.add_method(class, "Fire", void, &[]);
        fake.on_invoke(ctor, |this, params| {
            unsafe {
                memory::write_handle(this, OBJECT_HEADER_SIZE, NativeHandle::from(params[0]));
                memory::write_handle(this, OBJECT_HEADER_SIZE + 8, memory::read_handle(NativeHandle::from(params[1]), 0));
            }
            Ok(NativeHandle::NULL)
        });
        let bridge = bridge_for(&fake);

        let target = NativeHandle::from_addr(0x4560);
        let delegate = bridge.new_delegate(class.ptr(), target, target_method);
        unsafe {
            assert_eq!(memory::read_handle(delegate, OBJECT_HEADER_SIZE), target);
            assert_eq!(memory::read_handle(delegate, OBJECT_HEADER_SIZE + 8), target_method);
        }
    }
}
