//! The native runtime's exported C API
//!
//! [`Il2CppApi`] is the seam between this crate and the runtime: every call
//! that crosses into native code goes through it. [`super::ExportTable`]
//! implements it over the library's `il2cpp_*` exports; tests substitute a
//! fake over in-process memory.

use std::ffi::c_void;

use crate::memory::NativeHandle;

/// `InvokerMethod`: `void* (*)(Il2CppMethodPointer, const MethodInfo*, void* obj, void** args)`
pub type InvokerFn = unsafe extern "C" fn(NativeHandle, NativeHandle, NativeHandle, *mut *mut c_void) -> NativeHandle;

/// `Class::FromIl2CppType`
pub type ClassFromTypeFn = unsafe extern "C" fn(NativeHandle) -> NativeHandle;

/// `GenericMethod::GetMethod(const Il2CppGenericMethod*, bool copyMethodPtr)`
pub type GenericMethodGetMethodFn = unsafe extern "C" fn(NativeHandle, bool) -> NativeHandle;

/// The subset of the runtime API the interop layer uses
///
/// Handles are passed through untouched; implementations must accept the null
/// handle wherever the runtime itself does.
pub trait Il2CppApi: Send + Sync {
    // Domain and assemblies

    fn domain_get(&self) -> NativeHandle;

    fn domain_get_assemblies(&self, domain: NativeHandle) -> Vec<NativeHandle>;

    fn assembly_get_image(&self, assembly: NativeHandle) -> NativeHandle;

    fn image_get_name(&self, image: NativeHandle) -> Option<String>;

    fn thread_attach(&self, domain: NativeHandle) -> NativeHandle;

    // Classes

    fn class_from_name(&self, image: NativeHandle, namespace: &str, name: &str) -> NativeHandle;

    /// Next method of `class`; `iter` starts at 0, null ends the iteration
    fn class_get_methods(&self, class: NativeHandle, iter: &mut usize) -> NativeHandle;

    /// Next nested type of `class`; same iteration contract as methods
    fn class_get_nested_types(&self, class: NativeHandle, iter: &mut usize) -> NativeHandle;

    fn class_get_field_from_name(&self, class: NativeHandle, name: &str) -> NativeHandle;

    fn class_get_method_from_name(&self, class: NativeHandle, name: &str, argc: i32) -> NativeHandle;

    fn class_get_name(&self, class: NativeHandle) -> Option<String>;

    fn class_get_namespace(&self, class: NativeHandle) -> Option<String>;

    fn class_get_parent(&self, class: NativeHandle) -> NativeHandle;

    fn class_get_type(&self, class: NativeHandle) -> NativeHandle;

    fn class_from_type(&self, ty: NativeHandle) -> NativeHandle;

    fn class_is_valuetype(&self, class: NativeHandle) -> bool;

    /// Unboxed size of a value type
    fn class_value_size(&self, class: NativeHandle) -> i32;

    fn runtime_class_init(&self, class: NativeHandle);

    // Methods

    fn method_get_name(&self, method: NativeHandle) -> Option<String>;

    fn method_get_token(&self, method: NativeHandle) -> u32;

    fn method_get_param_count(&self, method: NativeHandle) -> u32;

    /// `Il2CppType*` of parameter `index`
    fn method_get_param(&self, method: NativeHandle, index: u32) -> NativeHandle;

    fn method_get_return_type(&self, method: NativeHandle) -> NativeHandle;

    fn method_is_generic(&self, method: NativeHandle) -> bool;

    fn method_get_flags(&self, method: NativeHandle) -> u32;

    // Types and fields

    fn type_get_name(&self, ty: NativeHandle) -> Option<String>;

    fn field_get_offset(&self, field: NativeHandle) -> u32;

    fn field_get_type(&self, field: NativeHandle) -> NativeHandle;

    // Strings

    fn string_new_utf16(&self, chars: &[u16]) -> NativeHandle;

    fn string_length(&self, string: NativeHandle) -> i32;

    fn string_chars(&self, string: NativeHandle) -> *const u16;

    // Objects and arrays

    fn object_new(&self, class: NativeHandle) -> NativeHandle;

    fn object_get_class(&self, object: NativeHandle) -> NativeHandle;

    fn object_unbox(&self, object: NativeHandle) -> NativeHandle;

    /// Box the unboxed value at `data`
    fn value_box(&self, class: NativeHandle, data: NativeHandle) -> NativeHandle;

    fn array_new(&self, element_class: NativeHandle, length: usize) -> NativeHandle;

    // GC

    fn gchandle_new(&self, object: NativeHandle, pinned: bool) -> u32;

    fn gchandle_get_target(&self, handle: u32) -> NativeHandle;

    fn gchandle_free(&self, handle: u32);

    /// Store `value` into the reference slot `field_addr` of `object`
    fn gc_wbarrier_set_field(&self, object: NativeHandle, field_addr: NativeHandle, value: NativeHandle);

    // Invocation

    /// Call `method` with pointers to each argument (values) or the objects themselves
    ///
    /// # Safety
    /// `params` must match the method's signature; `exception` must be writable.
    unsafe fn runtime_invoke(
        &self,
        method: NativeHandle,
        object: NativeHandle,
        params: *mut *mut c_void,
        exception: *mut NativeHandle,
    ) -> NativeHandle;

    /// Call `method` with every argument boxed
    ///
    /// # Safety
    /// `params` must hold `count` objects; `exception` must be writable.
    unsafe fn runtime_invoke_convert_args(
        &self,
        method: NativeHandle,
        object: NativeHandle,
        params: *mut NativeHandle,
        count: i32,
        exception: *mut NativeHandle,
    ) -> NativeHandle;

    /// Address registered for an internal call, or null
    fn resolve_icall(&self, name: &str) -> NativeHandle;

    /// Base address of a loaded module, or null
    fn module_base(&self, _module: &str) -> NativeHandle {
        NativeHandle::NULL
    }
}

/// `runtime_invoke_convert_args` in terms of `runtime_invoke`
///
/// Value-type arguments are unboxed in place of the converting entry point.
///
/// # Safety
/// Same contract as [`Il2CppApi::runtime_invoke_convert_args`].
pub(crate) unsafe fn invoke_unboxing(
    api: &dyn Il2CppApi,
    method: NativeHandle,
    object: NativeHandle,
    params: *mut NativeHandle,
    count: i32,
    exception: *mut NativeHandle,
) -> NativeHandle {
    let mut raw: Vec<*mut c_void> = (0..count.max(0) as usize)
        .map(|i| {
            let arg = *params.add(i);
            let class = api.class_from_type(api.method_get_param(method, i as u32));
            if !class.is_null() && api.class_is_valuetype(class) {
                api.object_unbox(arg).as_void()
            } else {
                arg.as_void()
            }
        })
        .collect();
    api.runtime_invoke(method, object, raw.as_mut_ptr(), exception)
}
