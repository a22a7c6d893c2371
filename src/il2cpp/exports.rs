//! `il2cpp_*` exports loaded from the game library
//!
//! Missing entry points are tolerated where the stable object layout allows a
//! structural replacement (strings, unboxing, write barriers, converting
//! invocation). The rest answer null or zero and are reported once at load.

use std::ffi::{c_char, c_void, CString};
use std::path::Path;

use dashmap::DashMap;
use libloading::Library;
use once_cell::sync::Lazy;
use tracing::{debug, trace, warn};

use super::api::{invoke_unboxing, Il2CppApi};
use super::offsets::{OBJECT_CLASS, OBJECT_HEADER_SIZE, STRING_CHARS, STRING_LENGTH};
use crate::error::{InteropError, Result};
use crate::memory::{self, NativeHandle};

type HandleFn = unsafe extern "C" fn() -> NativeHandle;
type HandleToHandle = unsafe extern "C" fn(NativeHandle) -> NativeHandle;
type HandleToStr = unsafe extern "C" fn(NativeHandle) -> *const c_char;
type HandleToBool = unsafe extern "C" fn(NativeHandle) -> bool;
type HandleToU32 = unsafe extern "C" fn(NativeHandle) -> u32;
type HandleToUsize = unsafe extern "C" fn(NativeHandle) -> usize;
type HandleIter = unsafe extern "C" fn(NativeHandle, *mut usize) -> NativeHandle;
type DomainGetAssemblies = unsafe extern "C" fn(NativeHandle, *mut usize) -> *const NativeHandle;
type ClassFromName = unsafe extern "C" fn(NativeHandle, *const c_char, *const c_char) -> NativeHandle;
type ClassGetFieldFromName = unsafe extern "C" fn(NativeHandle, *const c_char) -> NativeHandle;
type ClassGetMethodFromName = unsafe extern "C" fn(NativeHandle, *const c_char, i32) -> NativeHandle;
type ClassValueSize = unsafe extern "C" fn(NativeHandle, *mut u32) -> i32;
type ClassInit = unsafe extern "C" fn(NativeHandle);
type MethodGetParam = unsafe extern "C" fn(NativeHandle, u32) -> NativeHandle;
type MethodGetFlags = unsafe extern "C" fn(NativeHandle, *mut u32) -> u32;
type StringNewUtf16 = unsafe extern "C" fn(*const u16, i32) -> NativeHandle;
type StringLength = unsafe extern "C" fn(NativeHandle) -> i32;
type StringChars = unsafe extern "C" fn(NativeHandle) -> *const u16;
type ValueBox = unsafe extern "C" fn(NativeHandle, *mut c_void) -> NativeHandle;
type ArrayNew = unsafe extern "C" fn(NativeHandle, usize) -> NativeHandle;
type GcHandleNew = unsafe extern "C" fn(NativeHandle, bool) -> u32;
type GcHandleGetTarget = unsafe extern "C" fn(u32) -> NativeHandle;
type GcHandleFree = unsafe extern "C" fn(u32);
type WbarrierSetField = unsafe extern "C" fn(NativeHandle, *mut NativeHandle, NativeHandle);
type RuntimeInvoke = unsafe extern "C" fn(NativeHandle, NativeHandle, *mut *mut c_void, *mut NativeHandle) -> NativeHandle;
type RuntimeInvokeConvertArgs =
    unsafe extern "C" fn(NativeHandle, NativeHandle, *mut NativeHandle, i32, *mut NativeHandle) -> NativeHandle;
type ResolveIcall = unsafe extern "C" fn(*const c_char) -> NativeHandle;

/// Function pointers resolved from the runtime library
pub struct ExportTable {
    _library: Library,

    domain_get: HandleFn,
    domain_get_assemblies: DomainGetAssemblies,
    assembly_get_image: HandleToHandle,
    image_get_name: Option<HandleToStr>,
    thread_attach: Option<HandleToHandle>,

    class_from_name: ClassFromName,
    class_get_methods: Option<HandleIter>,
    class_get_nested_types: Option<HandleIter>,
    class_get_field_from_name: Option<ClassGetFieldFromName>,
    class_get_method_from_name: Option<ClassGetMethodFromName>,
    class_get_name: Option<HandleToStr>,
    class_get_namespace: Option<HandleToStr>,
    class_get_parent: Option<HandleToHandle>,
    class_get_type: Option<HandleToHandle>,
    class_from_il2cpp_type: Option<HandleToHandle>,
    class_is_valuetype: Option<HandleToBool>,
    class_value_size: Option<ClassValueSize>,
    runtime_class_init: Option<ClassInit>,

    method_get_name: Option<HandleToStr>,
    method_get_token: Option<HandleToU32>,
    method_get_param_count: Option<HandleToU32>,
    method_get_param: Option<MethodGetParam>,
    method_get_return_type: Option<HandleToHandle>,
    method_is_generic: Option<HandleToBool>,
    method_get_flags: Option<MethodGetFlags>,

    type_get_name: Option<HandleToStr>,
    field_get_offset: Option<HandleToUsize>,
    field_get_type: Option<HandleToHandle>,

    string_new_utf16: StringNewUtf16,
    string_length: Option<StringLength>,
    string_chars: Option<StringChars>,

    object_new: HandleToHandle,
    object_get_class: Option<HandleToHandle>,
    object_unbox: Option<HandleToHandle>,
    value_box: Option<ValueBox>,
    array_new: Option<ArrayNew>,

    gchandle_new: Option<GcHandleNew>,
    gchandle_get_target: Option<GcHandleGetTarget>,
    gchandle_free: Option<GcHandleFree>,
    gc_wbarrier_set_field: Option<WbarrierSetField>,

    runtime_invoke: RuntimeInvoke,
    runtime_invoke_convert_args: Option<RuntimeInvokeConvertArgs>,
    resolve_icall: Option<ResolveIcall>,
}

impl std::fmt::Debug for ExportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportTable").finish_non_exhaustive()
    }
}

/// Resolve an optional export
///
/// # Safety
/// `T` must be the export's real function pointer type.
unsafe fn optional<T: Copy>(library: &Library, name: &'static str, missing: &mut Vec<&'static str>) -> Option<T> {
    let symbol = format!("{}\0", name);
    match library.get::<T>(symbol.as_bytes()) {
        Ok(sym) => Some(*sym),
        Err(_) => {
            missing.push(name);
            None
        }
    }
}

/// Resolve an export the interop layer cannot work without
///
/// # Safety
/// See [`optional`].
unsafe fn required<T: Copy>(library: &Library, name: &'static str) -> Result<T> {
    let symbol = format!("{}\0", name);
    library.get::<T>(symbol.as_bytes()).map(|sym| *sym).map_err(|_| InteropError::MissingExport(name))
}

impl ExportTable {
    /// Open the runtime library at `path` (already loaded libraries are reused)
    pub fn load(path: &Path) -> Result<Self> {
        // Safety: loading the game library runs no initialisers we don't expect
        let library = unsafe { Library::new(path) }.map_err(|e| InteropError::Library {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut missing = Vec::new();

        // Safety: each name is paired with its documented C signature
        let table = unsafe {
            ExportTable {
                domain_get: required(&library, "il2cpp_domain_get")?,
                domain_get_assemblies: required(&library, "il2cpp_domain_get_assemblies")?,
                assembly_get_image: required(&library, "il2cpp_assembly_get_image")?,
                image_get_name: optional(&library, "il2cpp_image_get_name", &mut missing),
                thread_attach: optional(&library, "il2cpp_thread_attach", &mut missing),
                class_from_name: required(&library, "il2cpp_class_from_name")?,
                class_get_methods: optional(&library, "il2cpp_class_get_methods", &mut missing),
                class_get_nested_types: optional(&library, "il2cpp_class_get_nested_types", &mut missing),
                class_get_field_from_name: optional(&library, "il2cpp_class_get_field_from_name", &mut missing),
                class_get_method_from_name: optional(&library, "il2cpp_class_get_method_from_name", &mut missing),
                class_get_name: optional(&library, "il2cpp_class_get_name", &mut missing),
                class_get_namespace: optional(&library, "il2cpp_class_get_namespace", &mut missing),
                class_get_parent: optional(&library, "il2cpp_class_get_parent", &mut missing),
                class_get_type: optional(&library, "il2cpp_class_get_type", &mut missing),
                class_from_il2cpp_type: optional(&library, "il2cpp_class_from_il2cpp_type", &mut missing),
                class_is_valuetype: optional(&library, "il2cpp_class_is_valuetype", &mut missing),
                class_value_size: optional(&library, "il2cpp_class_value_size", &mut missing),
                runtime_class_init: optional(&library, "il2cpp_runtime_class_init", &mut missing),
                method_get_name: optional(&library, "il2cpp_method_get_name", &mut missing),
                method_get_token: optional(&library, "il2cpp_method_get_token", &mut missing),
                method_get_param_count: optional(&library, "il2cpp_method_get_param_count", &mut missing),
                method_get_param: optional(&library, "il2cpp_method_get_param", &mut missing),
                method_get_return_type: optional(&library, "il2cpp_method_get_return_type", &mut missing),
                method_is_generic: optional(&library, "il2cpp_method_is_generic", &mut missing),
                method_get_flags: optional(&library, "il2cpp_method_get_flags", &mut missing),
                type_get_name: optional(&library, "il2cpp_type_get_name", &mut missing),
                field_get_offset: optional(&library, "il2cpp_field_get_offset", &mut missing),
                field_get_type: optional(&library, "il2cpp_field_get_type", &mut missing),
                string_new_utf16: required(&library, "il2cpp_string_new_utf16")?,
                string_length: optional(&library, "il2cpp_string_length", &mut missing),
                string_chars: optional(&library, "il2cpp_string_chars", &mut missing),
                object_new: required(&library, "il2cpp_object_new")?,
                object_get_class: optional(&library, "il2cpp_object_get_class", &mut missing),
                object_unbox: optional(&library, "il2cpp_object_unbox", &mut missing),
                value_box: optional(&library, "il2cpp_value_box", &mut missing),
                array_new: optional(&library, "il2cpp_array_new", &mut missing),
                gchandle_new: optional(&library, "il2cpp_gchandle_new", &mut missing),
                gchandle_get_target: optional(&library, "il2cpp_gchandle_get_target", &mut missing),
                gchandle_free: optional(&library, "il2cpp_gchandle_free", &mut missing),
                gc_wbarrier_set_field: optional(&library, "il2cpp_gc_wbarrier_set_field", &mut missing),
                runtime_invoke: required(&library, "il2cpp_runtime_invoke")?,
                runtime_invoke_convert_args: optional(&library, "il2cpp_runtime_invoke_convert_args", &mut missing),
                resolve_icall: optional(&library, "il2cpp_resolve_icall", &mut missing),
                _library: library,
            }
        };

        if !missing.is_empty() {
            warn!("{} il2cpp exports are missing, using fallbacks: {}", missing.len(), missing.join(", "));
        }
        debug!("loaded il2cpp exports from {:?}", path);
        Ok(table)
    }
}

fn c_string(s: &str) -> CString {
    CString::new(s.split('\0').next().unwrap_or_default()).unwrap_or_default()
}

/// Safety: the caller passes a pointer returned by a runtime string export
unsafe fn owned(ptr: *const c_char) -> Option<String> {
    memory::read_cstr(NativeHandle::from(ptr))
}

// Safety (every unsafe block below): the function pointers were resolved from
// the runtime library with their documented signatures, and the runtime
// accepts the handles exactly as the caller passed them.
impl Il2CppApi for ExportTable {
    fn domain_get(&self) -> NativeHandle {
        unsafe { (self.domain_get)() }
    }

    fn domain_get_assemblies(&self, domain: NativeHandle) -> Vec<NativeHandle> {
        let mut count = 0usize;
        let list = unsafe { (self.domain_get_assemblies)(domain, &mut count) };
        if list.is_null() {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(list, count) }.to_vec()
    }

    fn assembly_get_image(&self, assembly: NativeHandle) -> NativeHandle {
        unsafe { (self.assembly_get_image)(assembly) }
    }

    fn image_get_name(&self, image: NativeHandle) -> Option<String> {
        self.image_get_name.and_then(|f| unsafe { owned(f(image)) })
    }

    fn thread_attach(&self, domain: NativeHandle) -> NativeHandle {
        self.thread_attach.map_or(NativeHandle::NULL, |f| unsafe { f(domain) })
    }

    fn class_from_name(&self, image: NativeHandle, namespace: &str, name: &str) -> NativeHandle {
        let (ns, name) = (c_string(namespace), c_string(name));
        unsafe { (self.class_from_name)(image, ns.as_ptr(), name.as_ptr()) }
    }

    fn class_get_methods(&self, class: NativeHandle, iter: &mut usize) -> NativeHandle {
        self.class_get_methods.map_or(NativeHandle::NULL, |f| unsafe { f(class, iter) })
    }

    fn class_get_nested_types(&self, class: NativeHandle, iter: &mut usize) -> NativeHandle {
        self.class_get_nested_types.map_or(NativeHandle::NULL, |f| unsafe { f(class, iter) })
    }

    fn class_get_field_from_name(&self, class: NativeHandle, name: &str) -> NativeHandle {
        let name = c_string(name);
        self.class_get_field_from_name.map_or(NativeHandle::NULL, |f| unsafe { f(class, name.as_ptr()) })
    }

    fn class_get_method_from_name(&self, class: NativeHandle, name: &str, argc: i32) -> NativeHandle {
        let name = c_string(name);
        self.class_get_method_from_name.map_or(NativeHandle::NULL, |f| unsafe { f(class, name.as_ptr(), argc) })
    }

    fn class_get_name(&self, class: NativeHandle) -> Option<String> {
        self.class_get_name.and_then(|f| unsafe { owned(f(class)) })
    }

    fn class_get_namespace(&self, class: NativeHandle) -> Option<String> {
        self.class_get_namespace.and_then(|f| unsafe { owned(f(class)) })
    }

    fn class_get_parent(&self, class: NativeHandle) -> NativeHandle {
        self.class_get_parent.map_or(NativeHandle::NULL, |f| unsafe { f(class) })
    }

    fn class_get_type(&self, class: NativeHandle) -> NativeHandle {
        self.class_get_type.map_or(NativeHandle::NULL, |f| unsafe { f(class) })
    }

    fn class_from_type(&self, ty: NativeHandle) -> NativeHandle {
        self.class_from_il2cpp_type.map_or(NativeHandle::NULL, |f| unsafe { f(ty) })
    }

    fn class_is_valuetype(&self, class: NativeHandle) -> bool {
        self.class_is_valuetype.is_some_and(|f| unsafe { f(class) })
    }

    fn class_value_size(&self, class: NativeHandle) -> i32 {
        let mut align = 0u32;
        self.class_value_size.map_or(0, |f| unsafe { f(class, &mut align) })
    }

    fn runtime_class_init(&self, class: NativeHandle) {
        if let Some(f) = self.runtime_class_init {
            unsafe { f(class) }
        }
    }

    fn method_get_name(&self, method: NativeHandle) -> Option<String> {
        self.method_get_name.and_then(|f| unsafe { owned(f(method)) })
    }

    fn method_get_token(&self, method: NativeHandle) -> u32 {
        self.method_get_token.map_or(0, |f| unsafe { f(method) })
    }

    fn method_get_param_count(&self, method: NativeHandle) -> u32 {
        self.method_get_param_count.map_or(0, |f| unsafe { f(method) })
    }

    fn method_get_param(&self, method: NativeHandle, index: u32) -> NativeHandle {
        self.method_get_param.map_or(NativeHandle::NULL, |f| unsafe { f(method, index) })
    }

    fn method_get_return_type(&self, method: NativeHandle) -> NativeHandle {
        self.method_get_return_type.map_or(NativeHandle::NULL, |f| unsafe { f(method) })
    }

    fn method_is_generic(&self, method: NativeHandle) -> bool {
        self.method_is_generic.is_some_and(|f| unsafe { f(method) })
    }

    fn method_get_flags(&self, method: NativeHandle) -> u32 {
        let mut iflags = 0u32;
        self.method_get_flags.map_or(0, |f| unsafe { f(method, &mut iflags) })
    }

    fn type_get_name(&self, ty: NativeHandle) -> Option<String> {
        // The runtime hands out a fresh allocation; it is small and leaked
        self.type_get_name.and_then(|f| unsafe { owned(f(ty)) })
    }

    fn field_get_offset(&self, field: NativeHandle) -> u32 {
        self.field_get_offset.map_or(0, |f| unsafe { f(field) } as u32)
    }

    fn field_get_type(&self, field: NativeHandle) -> NativeHandle {
        self.field_get_type.map_or(NativeHandle::NULL, |f| unsafe { f(field) })
    }

    fn string_new_utf16(&self, chars: &[u16]) -> NativeHandle {
        unsafe { (self.string_new_utf16)(chars.as_ptr(), chars.len() as i32) }
    }

    fn string_length(&self, string: NativeHandle) -> i32 {
        match self.string_length {
            Some(f) => unsafe { f(string) },
            None => unsafe { memory::read::<i32>(string, STRING_LENGTH) },
        }
    }

    fn string_chars(&self, string: NativeHandle) -> *const u16 {
        match self.string_chars {
            Some(f) => unsafe { f(string) },
            None => string.add(STRING_CHARS).as_ptr::<u16>() as *const u16,
        }
    }

    fn object_new(&self, class: NativeHandle) -> NativeHandle {
        unsafe { (self.object_new)(class) }
    }

    fn object_get_class(&self, object: NativeHandle) -> NativeHandle {
        match self.object_get_class {
            Some(f) => unsafe { f(object) },
            None if object.is_null() => NativeHandle::NULL,
            None => unsafe { memory::read_handle(object, OBJECT_CLASS) },
        }
    }

    fn object_unbox(&self, object: NativeHandle) -> NativeHandle {
        match self.object_unbox {
            Some(f) => unsafe { f(object) },
            None => object.add(OBJECT_HEADER_SIZE),
        }
    }

    fn value_box(&self, class: NativeHandle, data: NativeHandle) -> NativeHandle {
        self.value_box.map_or(NativeHandle::NULL, |f| unsafe { f(class, data.as_void()) })
    }

    fn array_new(&self, element_class: NativeHandle, length: usize) -> NativeHandle {
        self.array_new.map_or(NativeHandle::NULL, |f| unsafe { f(element_class, length) })
    }

    fn gchandle_new(&self, object: NativeHandle, pinned: bool) -> u32 {
        self.gchandle_new.map_or(0, |f| unsafe { f(object, pinned) })
    }

    fn gchandle_get_target(&self, handle: u32) -> NativeHandle {
        self.gchandle_get_target.map_or(NativeHandle::NULL, |f| unsafe { f(handle) })
    }

    fn gchandle_free(&self, handle: u32) {
        if let Some(f) = self.gchandle_free {
            unsafe { f(handle) }
        }
    }

    fn gc_wbarrier_set_field(&self, object: NativeHandle, field_addr: NativeHandle, value: NativeHandle) {
        match self.gc_wbarrier_set_field {
            Some(f) => unsafe { f(object, field_addr.as_ptr(), value) },
            None => {
                trace!("write barrier unavailable, storing field directly");
                unsafe { memory::write_handle(field_addr, 0, value) }
            }
        }
    }

    unsafe fn runtime_invoke(
        &self,
        method: NativeHandle,
        object: NativeHandle,
        params: *mut *mut c_void,
        exception: *mut NativeHandle,
    ) -> NativeHandle {
        (self.runtime_invoke)(method, object, params, exception)
    }

    unsafe fn runtime_invoke_convert_args(
        &self,
        method: NativeHandle,
        object: NativeHandle,
        params: *mut NativeHandle,
        count: i32,
        exception: *mut NativeHandle,
    ) -> NativeHandle {
        match self.runtime_invoke_convert_args {
            Some(f) => f(method, object, params, count, exception),
            None => invoke_unboxing(self, method, object, params, count, exception),
        }
    }

    fn resolve_icall(&self, name: &str) -> NativeHandle {
        let name = c_string(name);
        self.resolve_icall.map_or(NativeHandle::NULL, |f| unsafe { f(name.as_ptr()) })
    }

    fn module_base(&self, module: &str) -> NativeHandle {
        module_base(module)
    }
}

static MODULE_BASES: Lazy<DashMap<String, NativeHandle>> = Lazy::new(DashMap::new);

/// Base address of a module already mapped into this process
///
/// Found bases are remembered for the life of the process; a module that is
/// not mapped yet is looked up again next time.
pub fn module_base(module: &str) -> NativeHandle {
    cached_base(module, find_module_base)
}

fn cached_base(module: &str, find: impl FnOnce(&str) -> NativeHandle) -> NativeHandle {
    if let Some(base) = MODULE_BASES.get(module) {
        return *base;
    }
    let base = find(module);
    if base.is_null() {
        return base;
    }
    trace!("module {} is mapped at {}", module, base);
    *MODULE_BASES.entry(module.to_string()).or_insert(base)
}

#[cfg(target_os = "windows")]
fn find_module_base(module: &str) -> NativeHandle {
    use libloading::os::windows::Library as WinLibrary;
    let Ok(lib) = WinLibrary::open_already_loaded(module) else {
        return NativeHandle::NULL;
    };
    // An HMODULE is the module's base address
    let raw = lib.into_raw();
    // Safety: hands back the reference `open_already_loaded` took so it is released
    drop(unsafe { WinLibrary::from_raw(raw) });
    NativeHandle::from_addr(raw as usize)
}

#[cfg(target_os = "linux")]
fn find_module_base(module: &str) -> NativeHandle {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        return NativeHandle::NULL;
    };
    maps.lines()
        .filter(|line| line.ends_with(module))
        .filter_map(|line| line.split('-').next())
        .filter_map(|start| usize::from_str_radix(start, 16).ok())
        .min()
        .map_or(NativeHandle::NULL, NativeHandle::from_addr)
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn find_module_base(_module: &str) -> NativeHandle {
    NativeHandle::NULL
}
