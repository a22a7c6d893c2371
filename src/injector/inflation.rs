//! Inflation of injected generic methods
//!
//! The runtime asks `GenericMethod::GetMethod` for a concrete `MethodInfo`
//! whenever it meets an instantiation of a generic method. For open methods
//! the injector created, the interceptor synthesizes one per distinct
//! `method_inst` and caches it; everything else falls through to the runtime.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use tracing::{error, trace};

use super::managed::{ManagedMethod, TypeRef};
use super::native_entry::{self, DispatchTarget, MethodTarget};
use super::trampoline::Trampoline;
use super::InjectorState;
use crate::il2cpp::offsets::{
    GENERIC_INST_ARGC, GENERIC_INST_ARGV, GENERIC_METHOD_DEFINITION, GENERIC_METHOD_METHOD_INST,
};
use crate::error::{InteropError, Result};
use crate::il2cpp::GenericMethodGetMethodFn;
use crate::memory::{self, NativeHandle, SIZE_OF_PTR};

/// An injected open generic method and its instantiations
pub(crate) struct OpenMethod {
    state: Arc<InjectorState>,
    method: ManagedMethod,
    trampoline: Arc<Trampoline>,
    /// The open `MethodInfo`
    template: NativeHandle,
    instances: DashMap<usize, NativeHandle>,
}

static OPEN_METHODS: Lazy<DashMap<usize, Arc<OpenMethod>>> = Lazy::new(DashMap::new);
static ORIGINAL: OnceCell<GenericMethodGetMethodFn> = OnceCell::new();

pub(crate) fn register_open(
    state: Arc<InjectorState>,
    template: NativeHandle,
    method: ManagedMethod,
    trampoline: Arc<Trampoline>,
) {
    let open = OpenMethod { state, method, trampoline, template, instances: DashMap::new() };
    OPEN_METHODS.insert(template.addr(), Arc::new(open));
}

/// Remember the intercepted function; a different one than already recorded is refused
pub(crate) fn set_original(original: GenericMethodGetMethodFn) -> Result<()> {
    let stored = *ORIGINAL.get_or_init(|| original);
    if stored as usize != original as usize {
        return Err(InteropError::Hook {
            target: NativeHandle::from_addr(original as usize),
            reason: format!("GenericMethod::GetMethod already forwards to {}", NativeHandle::from_addr(stored as usize)),
        });
    }
    Ok(())
}

/// The concrete method for an `Il2CppGenericMethod` of an injected open method
///
/// # Safety
/// `gmethod` must be null or a live `Il2CppGenericMethod`.
pub(crate) unsafe fn inflate(gmethod: NativeHandle) -> Option<NativeHandle> {
    if gmethod.is_null() {
        return None;
    }
    let definition = memory::read_handle(gmethod, GENERIC_METHOD_DEFINITION);
    let open = OPEN_METHODS.get(&definition.addr()).map(|entry| entry.value().clone())?;
    let context = memory::read_handle(gmethod, GENERIC_METHOD_METHOD_INST);
    let method = *open.instances.entry(context.addr()).or_insert_with(|| open.synthesize(gmethod, context));
    Some(method)
}

impl OpenMethod {
    unsafe fn synthesize(&self, gmethod: NativeHandle, context: NativeHandle) -> NativeHandle {
        let arguments = generic_arguments(context);
        let layouts = self.state.bridge().layouts();
        let concrete = layouts.new_method();
        memory::copy(self.template, concrete.ptr(), layouts.method_size());
        concrete.set_is_generic(false);
        concrete.set_is_inflated(true);
        concrete.set_generic_method(gmethod);

        let substitute = |ty: &TypeRef| match ty {
            TypeRef::GenericParameter(index) => arguments.get(*index as usize).copied(),
            _ => None,
        };
        let count = self.method.parameters.len();
        let template_parameters =
            layouts.wrap_method(self.template).and_then(|m| m.parameters()).and_then(NativeHandle::non_null);
        if let Some(template_parameters) = template_parameters {
            if count > 0 {
                let parameters = layouts.new_parameter_array(count);
                memory::copy(template_parameters, parameters, count * layouts.parameter_size());
                for (i, parameter) in self.method.parameters.iter().enumerate() {
                    if let (Some(ty), Some(slot)) = (substitute(&parameter.ty), layouts.wrap_parameter_at(parameters, i)) {
                        slot.set_parameter_type(ty);
                    }
                }
                concrete.set_parameters(parameters);
            }
        }
        if let Some(ty) = substitute(&self.method.return_type) {
            concrete.set_return_type(ty);
        }

        let widths: Vec<Option<u8>> = arguments.iter().map(|ty| self.state.float_width(*ty)).collect();
        let trampoline = if widths.iter().any(Option::is_some) {
            let bound = self.trampoline.with_float_arguments(&widths);
            let entry = native_entry::entry_point(count, bound.float_mask()).unwrap_or_default();
            concrete.set_method_pointer(entry);
            let _ = concrete.set_virtual_method_pointer(entry);
            Arc::new(bound)
        } else {
            self.trampoline.clone()
        };
        let target = MethodTarget {
            state: self.state.clone(),
            trampoline,
            arguments: self.method.parameters.iter().map(|p| self.state.arg_passing(&p.ty, &arguments)).collect(),
            return_class: self.state.return_class(&self.method.return_type, &arguments),
            generic_arguments: arguments,
        };
        native_entry::register(concrete.ptr(), DispatchTarget::Method(target));
        trace!("inflated {} as {}", self.trampoline.label(), concrete.ptr());
        concrete.ptr()
    }
}

/// `Il2CppType*` arguments of an `Il2CppGenericInst`
unsafe fn generic_arguments(inst: NativeHandle) -> Vec<NativeHandle> {
    if inst.is_null() {
        return Vec::new();
    }
    let argc = memory::read::<u32>(inst, GENERIC_INST_ARGC) as usize;
    let argv = memory::read_handle(inst, GENERIC_INST_ARGV);
    if argv.is_null() {
        return Vec::new();
    }
    (0..argc).map(|i| memory::read_handle(argv, i * SIZE_OF_PTR)).collect()
}

/// Replacement for `GenericMethod::GetMethod`
///
/// # Safety
/// Called by the runtime with an `Il2CppGenericMethod*`.
pub(crate) unsafe extern "C" fn generic_method_get_method_hook(gmethod: NativeHandle, copy_method_ptr: bool) -> NativeHandle {
    if let Some(method) = inflate(gmethod) {
        return method;
    }
    match ORIGINAL.get() {
        Some(original) => original(gmethod, copy_method_ptr),
        None => {
            error!("GenericMethod::GetMethod is intercepted but the original was not recorded");
            NativeHandle::NULL
        }
    }
}

pub(crate) fn hook_address() -> NativeHandle {
    NativeHandle::from_addr(generic_method_get_method_hook as usize)
}
