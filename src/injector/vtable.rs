//! Vtable layout of injected classes
//!
//! The slot plan is computed before any native memory is allocated, so a type
//! that leaves an abstract slot unfilled is rejected without side effects.
//! Slots are laid out as the base vtable, then one block per new interface,
//! then one slot per abstract method the type declares itself.

use tracing::trace;

use super::managed::{ManagedMethod, ManagedType, TypeRef};
use super::InjectorState;
use crate::common::{ClassAttributes, MethodAttributes, TypeCode};
use crate::error::InjectionError;
use crate::layout::{ClassStruct, VirtualInvokeData};
use crate::memory::NativeHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotPlan {
    /// Keep the base class entry
    Inherit(VirtualInvokeData),
    /// The injected finalizer
    Finalizer,
    /// An eligible method of the type, by index into the eligible list
    Method(usize),
    /// A new abstract slot for an eligible abstract method
    NewAbstract(usize),
}

#[derive(Debug, Default)]
pub(crate) struct VtablePlan {
    pub slots: Vec<SlotPlan>,
    /// Interface class and the first slot of its block
    pub interface_offsets: Vec<(NativeHandle, usize)>,
}

impl VtablePlan {
    /// First slot an eligible method occupies
    pub fn slot_of(&self, index: usize) -> Option<usize> {
        self.slots.iter().position(|slot| matches!(slot, SlotPlan::Method(i) | SlotPlan::NewAbstract(i) if *i == index))
    }
}

pub(crate) fn plan(
    state: &InjectorState,
    ty: &ManagedType,
    base: ClassStruct,
    interfaces: &[ClassStruct],
    eligible: &[&ManagedMethod],
) -> Result<VtablePlan, InjectionError> {
    let api = state.bridge().api();
    let type_name = ty.full_name();
    let base_abstract = base.has_flag(ClassAttributes::ABSTRACT);
    let mut plan = VtablePlan::default();

    let mut unimplemented = if base_abstract { abstract_methods(state, base) } else { Vec::new() }.into_iter();
    for slot in 0..base.vtable_count() as usize {
        let entry = base.vtable_entry(slot);
        let (method, is_abstract) = if entry.method.is_null() {
            match unimplemented.next() {
                Some(method) if base_abstract => (method, true),
                _ => return Err(InjectionError::NullVtableSlot { ty: type_name, slot }),
            }
        } else {
            let flags = MethodAttributes::from_bits_retain(api.method_get_flags(entry.method) as u16);
            (entry.method, entry.method_ptr.is_null() || flags.contains(MethodAttributes::ABSTRACT))
        };

        let name = api.method_get_name(method).unwrap_or_default();
        if name == "Finalize" {
            plan.slots.push(SlotPlan::Finalizer);
            continue;
        }
        if let Some(index) = eligible.iter().position(|m| !m.is_abstract && overrides(state, ty, method, m)) {
            trace!("{} overrides vtable slot {} ({})", type_name, slot, name);
            plan.slots.push(SlotPlan::Method(index));
            continue;
        }
        if is_abstract && !ty.is_abstract {
            // Safety: vtable entries hold live methods
            let declaring = unsafe { state.bridge().layouts().wrap_method(method) }
                .map_or(NativeHandle::NULL, |m| m.declaring_class());
            let owner = state.bridge().class_name(declaring);
            return Err(InjectionError::MissingVtableImplementation { ty: type_name, method: format!("{}::{}", owner, name) });
        }
        let inherited = if entry.method.is_null() { VirtualInvokeData { method_ptr: NativeHandle::NULL, method } } else { entry };
        plan.slots.push(SlotPlan::Inherit(inherited));
    }

    for interface in interfaces {
        plan.interface_offsets.push((interface.ptr(), plan.slots.len()));
        for i in 0..interface.method_count() as usize {
            let method = interface.method_at(i);
            let name = api.method_get_name(method).unwrap_or_default();
            let count = api.method_get_param_count(method) as usize;
            let generic = api.method_is_generic(method);
            match eligible
                .iter()
                .position(|m| !m.is_abstract && m.name == name && m.parameters.len() == count && m.is_generic() == generic)
            {
                Some(index) => plan.slots.push(SlotPlan::Method(index)),
                None if ty.is_abstract => {
                    plan.slots.push(SlotPlan::Inherit(VirtualInvokeData { method_ptr: NativeHandle::NULL, method }))
                }
                None => {
                    return Err(InjectionError::MissingVtableImplementation {
                        ty: type_name,
                        method: format!("{}::{}", interface.full_name(), name),
                    })
                }
            }
        }
    }

    for (index, method) in eligible.iter().enumerate() {
        if method.is_abstract {
            plan.slots.push(SlotPlan::NewAbstract(index));
        }
    }
    Ok(plan)
}

/// Abstract methods still unimplemented at `class`, in declaration order from the root
fn abstract_methods(state: &InjectorState, class: ClassStruct) -> Vec<NativeHandle> {
    let api = state.bridge().api();
    let layouts = state.bridge().layouts();
    // Safety: parents of a live class are live classes
    let parent = class.parent().unwrap_or(NativeHandle::NULL);
    let mut methods = match unsafe { layouts.wrap_class(parent) } {
        Some(parent) if parent.has_flag(ClassAttributes::ABSTRACT) => abstract_methods(state, parent),
        _ => Vec::new(),
    };
    for i in 0..class.method_count() as usize {
        let method = class.method_at(i);
        let flags = MethodAttributes::from_bits_retain(api.method_get_flags(method) as u16);
        if flags.contains(MethodAttributes::ABSTRACT) {
            methods.push(method);
        } else if flags.contains(MethodAttributes::VIRTUAL) {
            methods.retain(|m| !same_signature(state, *m, method));
        }
    }
    methods
}

fn same_signature(state: &InjectorState, a: NativeHandle, b: NativeHandle) -> bool {
    let api = state.bridge().api();
    let count = api.method_get_param_count(a);
    api.method_get_name(a) == api.method_get_name(b)
        && count == api.method_get_param_count(b)
        && (0..count).all(|i| state.type_name(api.method_get_param(a, i)) == state.type_name(api.method_get_param(b, i)))
}

/// Whether `method` of the type overrides the native virtual `native`
fn overrides(state: &InjectorState, ty: &ManagedType, native: NativeHandle, method: &ManagedMethod) -> bool {
    let api = state.bridge().api();
    if api.method_get_name(native).as_deref() != Some(method.name.as_str())
        || api.method_get_param_count(native) as usize != method.parameters.len()
    {
        return false;
    }
    method.parameters.iter().enumerate().all(|(i, parameter)| {
        let param_type = api.method_get_param(native, i as u32);
        match &parameter.ty {
            TypeRef::GenericParameter(_) => {
                // Safety: parameter types of a live method are live types
                unsafe { state.bridge().layouts().wrap_type(param_type) }
                    .is_some_and(|t| t.type_code() == TypeCode::MVAR)
            }
            other => state.type_name(param_type).is_some() && state.type_name(param_type) == state.ref_name(other, ty),
        }
    })
}
