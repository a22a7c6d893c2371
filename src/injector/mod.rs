//! Injection of host-defined types into the running runtime
//!
//! [`ClassInjector::register`] turns a [`ManagedType`] into a native class the
//! runtime can allocate, dispatch virtual calls on and hand back to native
//! code. Every rejection happens before any native memory is written for the
//! offending type. After that the class, its method, field and parameter
//! tables and its vtable are synthesized with the active layouts and live for
//! the rest of the process.

pub mod fields;
pub mod handles;
pub(crate) mod inflation;
pub mod managed;
pub(crate) mod native_entry;
pub mod tokens;
pub mod trampoline;
pub(crate) mod vtable;

use std::any::TypeId;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;
use tracing::{debug, error, info, trace, warn};

use crate::common::{ClassAttributes, FieldAttributes, MethodAttributes, TypeCode};
use crate::error::{InjectionError, InteropError, Result};
use crate::il2cpp::{ClassFromTypeFn, GenericMethodGetMethodFn, Il2CppApi, Il2CppBridge};
use crate::layout::class::{interface_pair_size, write_interface_offsets};
use crate::layout::{ClassStruct, InterfaceOffsetPair, MethodStruct, VirtualInvokeData};
use crate::memory::{self, NativeHandle, SIZE_OF_PTR};

use self::fields::FieldBindings;
use self::handles::{GcHandleTable, InjectedClassData};
use self::managed::{BaseRef, FieldKind, InterfaceResolver, ManagedMethod, ManagedObject, ManagedType, TypeRef};
use self::native_entry::{ArgPassing, DispatchTarget, MethodTarget};
use self::trampoline::{Trampoline, TrampolineContext, MAX_ARITY};
use self::vtable::SlotPlan;

pub use self::fields::{ReferenceField, StringField, ValueField};
pub use self::managed::{ManagedField, ManagedValue, MethodCall};

/// Installs inline hooks on runtime functions
///
/// The injector needs two runtime internals intercepted. How that is done is
/// up to the embedder.
pub trait Detour: Send + Sync {
    /// Redirect calls of `target` to `hook`
    ///
    /// Returns an address that still runs the original function.
    ///
    /// # Safety
    /// `target` must be the start of a function with the same signature as `hook`.
    unsafe fn attach(&self, target: NativeHandle, hook: NativeHandle) -> Result<NativeHandle>;
}

/// Addresses of the runtime internals the injector intercepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookTargets {
    /// `Class::FromIl2CppType`
    pub class_from_type: NativeHandle,
    /// `GenericMethod::GetMethod`
    pub generic_method_get_method: NativeHandle,
}

/// Options for one registration
#[derive(Clone)]
pub struct RegisterOptions {
    /// Interface classes the type implements, besides those it declares itself
    pub interfaces: Vec<NativeHandle>,
    /// Called with the type to compute more interfaces
    pub interface_resolver: Option<InterfaceResolver>,
    pub log_success: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        RegisterOptions { interfaces: Vec::new(), interface_resolver: None, log_success: true }
    }
}

impl std::fmt::Debug for RegisterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterOptions")
            .field("interfaces", &self.interfaces)
            .field("interface_resolver", &self.interface_resolver.is_some())
            .field("log_success", &self.log_success)
            .finish()
    }
}

/// What the injector keeps about one injected class
pub(crate) struct InjectedClass {
    ty: Arc<ManagedType>,
    class: NativeHandle,
    instance_size: u32,
    bindings: Arc<FieldBindings>,
    /// Absent for abstract types
    constructor: Option<NativeHandle>,
}

/// A method of the type as it will appear natively
struct EligibleMethod<'a> {
    method: &'a ManagedMethod,
    trampoline: Option<Arc<Trampoline>>,
}

/// Shared state behind a [`ClassInjector`] and every native callback it installs
pub(crate) struct InjectorState {
    bridge: Arc<Il2CppBridge>,
    handles: GcHandleTable,
    by_id: DashMap<TypeId, Arc<InjectedClass>>,
    by_class: DashMap<NativeHandle, Arc<InjectedClass>>,
    by_name: DashMap<String, TypeId>,
    /// Class type descriptors copied with field attributes, per (type, attrs)
    attributed_types: DashMap<(NativeHandle, u16), NativeHandle>,
    /// `!!n` type descriptors
    generic_parameters: DashMap<u16, NativeHandle>,
    registration: ReentrantMutex<()>,
    hooks: InstalledHooks,
}

/// Originals of the intercepted runtime functions, each kept once its detour is in place
#[derive(Default)]
struct InstalledHooks {
    class_from_type: OnceCell<NativeHandle>,
    generic_method_get_method: OnceCell<NativeHandle>,
}

impl InjectorState {
    fn new(bridge: Arc<Il2CppBridge>) -> Self {
        InjectorState {
            bridge,
            handles: GcHandleTable::new(),
            by_id: DashMap::new(),
            by_class: DashMap::new(),
            by_name: DashMap::new(),
            attributed_types: DashMap::new(),
            generic_parameters: DashMap::new(),
            registration: ReentrantMutex::new(()),
            hooks: InstalledHooks::default(),
        }
    }

    pub(crate) fn bridge(&self) -> &Arc<Il2CppBridge> {
        &self.bridge
    }

    pub(crate) fn api(&self) -> &dyn Il2CppApi {
        self.bridge.api()
    }

    fn record(&self, id: TypeId) -> Option<Arc<InjectedClass>> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    fn record_for_object(&self, object: NativeHandle) -> Option<Arc<InjectedClass>> {
        let class = self.api().object_get_class(object);
        self.by_class.get(&class).map(|entry| entry.value().clone())
    }

    // Names and types of signatures

    /// Normalized name of an `Il2CppType`
    pub(crate) fn type_name(&self, ty: NativeHandle) -> Option<String> {
        if ty.is_null() {
            return None;
        }
        self.bridge.type_name(ty)
    }

    /// The name `ty_ref` would have as a native type, `None` for generic parameters
    pub(crate) fn ref_name(&self, ty_ref: &TypeRef, owner: &ManagedType) -> Option<String> {
        match ty_ref {
            TypeRef::Void => Some("System.Void".to_string()),
            TypeRef::Value(code) => code.system_name().map(str::to_string),
            TypeRef::String => Some("System.String".to_string()),
            TypeRef::GenericParameter(_) => None,
            TypeRef::Class(class) => class.non_null().map(|c| self.bridge.class_name(c)),
            TypeRef::Named { namespace, name, .. } if namespace.is_empty() => Some(name.clone()),
            TypeRef::Named { namespace, name, .. } => Some(format!("{}.{}", namespace, name)),
            TypeRef::Managed(id) if *id == owner.id() => Some(owner.full_name()),
            TypeRef::Managed(id) => self.record(*id).map(|record| record.ty.full_name()),
        }
    }

    /// The native class of `ty_ref`; `own_class` stands in for the type being registered
    fn resolve_class(&self, ty_ref: &TypeRef, owner: &ManagedType, own_class: NativeHandle) -> NativeHandle {
        match ty_ref {
            TypeRef::Void => self.bridge.corlib_class("Void"),
            TypeRef::Value(code) => self.corlib_class_of(*code),
            TypeRef::String => self.bridge.corlib_class("String"),
            TypeRef::GenericParameter(_) => NativeHandle::NULL,
            TypeRef::Class(class) => *class,
            TypeRef::Named { assembly, namespace, name } => self.bridge.get_class(assembly, namespace, name),
            TypeRef::Managed(id) if *id == owner.id() => own_class,
            TypeRef::Managed(id) => self.record(*id).map_or(NativeHandle::NULL, |record| record.class),
        }
    }

    fn corlib_class_of(&self, code: TypeCode) -> NativeHandle {
        match code.system_name().and_then(|name| name.strip_prefix("System.")) {
            Some(name) => self.bridge.corlib_class(name),
            None => NativeHandle::NULL,
        }
    }

    /// The `Il2CppType*` injected signatures use for `ty_ref`
    fn type_handle(&self, ty_ref: &TypeRef, owner: &ManagedType, own_class: NativeHandle) -> NativeHandle {
        match ty_ref {
            TypeRef::GenericParameter(index) => self.generic_parameter_type(*index),
            other => {
                let class = self.resolve_class(other, owner, own_class);
                if class.is_null() {
                    NativeHandle::NULL
                } else {
                    self.api().class_get_type(class)
                }
            }
        }
    }

    fn generic_parameter_type(&self, index: u16) -> NativeHandle {
        *self.generic_parameters.entry(index).or_insert_with(|| {
            let ty = self.bridge.layouts().new_type();
            ty.set_type_code(TypeCode::MVAR);
            ty.set_data(NativeHandle::from_addr(index as usize));
            ty.ptr()
        })
    }

    /// A copy of `ty` carrying `attrs`, shared by every field with the same pair
    fn attributed_type(&self, ty: NativeHandle, attrs: FieldAttributes) -> NativeHandle {
        let layouts = self.bridge.layouts();
        // Safety: `ty` is the type of a live class
        let Some(source) = (unsafe { layouts.wrap_type(ty) }) else {
            return NativeHandle::NULL;
        };
        if source.attrs() == attrs {
            return ty;
        }
        *self.attributed_types.entry((ty, attrs.bits())).or_insert_with(|| {
            let copy = layouts.new_type();
            copy.copy_from(&source);
            copy.set_attrs(attrs);
            copy.ptr()
        })
    }

    /// How `runtime_invoke` passes an argument of `ty_ref`
    pub(crate) fn arg_passing(&self, ty_ref: &TypeRef, generic_arguments: &[NativeHandle]) -> ArgPassing {
        match ty_ref {
            TypeRef::Value(code) => ArgPassing::Value(code.size()),
            TypeRef::GenericParameter(index) => match generic_arguments.get(*index as usize) {
                Some(ty) => {
                    let class = self.api().class_from_type(*ty);
                    if !class.is_null() && self.api().class_is_valuetype(class) {
                        ArgPassing::Value(self.api().class_value_size(class).max(0) as usize)
                    } else {
                        ArgPassing::Reference
                    }
                }
                None => ArgPassing::Reference,
            },
            _ => ArgPassing::Reference,
        }
    }

    /// Byte width of `ty` when it is `System.Single` or `System.Double`
    pub(crate) fn float_width(&self, ty: NativeHandle) -> Option<u8> {
        let class = self.api().class_from_type(ty);
        if class.is_null() {
            return None;
        }
        [(TypeCode::R4, 4), (TypeCode::R8, 8)]
            .into_iter()
            .find(|(code, _)| self.corlib_class_of(*code) == class)
            .map(|(_, width)| width)
    }

    /// The class a value-type result of `ty_ref` is boxed into, null otherwise
    pub(crate) fn return_class(&self, ty_ref: &TypeRef, generic_arguments: &[NativeHandle]) -> NativeHandle {
        match ty_ref {
            TypeRef::Value(code) => self.corlib_class_of(*code),
            TypeRef::GenericParameter(index) => {
                let Some(ty) = generic_arguments.get(*index as usize) else {
                    return NativeHandle::NULL;
                };
                let class = self.api().class_from_type(*ty);
                if !class.is_null() && self.api().class_is_valuetype(class) {
                    class
                } else {
                    NativeHandle::NULL
                }
            }
            _ => NativeHandle::NULL,
        }
    }

    /// Whether values of `ty_ref` can appear in an injected signature
    fn supports(&self, ty_ref: &TypeRef, owner: &ManagedType, generic_arity: u16, is_return: bool) -> bool {
        match ty_ref {
            TypeRef::Void => is_return,
            TypeRef::Value(code) => code.is_primitive(),
            TypeRef::String => true,
            TypeRef::GenericParameter(index) => *index < generic_arity,
            TypeRef::Managed(id) => *id == owner.id() || self.by_id.contains_key(id),
            // Structs are taken by reference but can't be returned in a register
            TypeRef::Class(_) | TypeRef::Named { .. } => {
                let class = self.resolve_class(ty_ref, owner, NativeHandle::NULL);
                !class.is_null() && !(is_return && self.api().class_is_valuetype(class))
            }
        }
    }

    // Objects

    /// The managed counterpart of an injected instance, wrapping it on first sight
    pub(crate) fn managed_from_native(&self, object: NativeHandle) -> Option<Arc<ManagedObject>> {
        if object.is_null() {
            return None;
        }
        let record = self.record_for_object(object)?;
        // Safety: `object` is an instance of an injected class
        let data = unsafe { InjectedClassData::read(object, record.instance_size) };
        if data.managed_gc_handle != 0 {
            if let Some(managed) = self.handles.get(data.managed_gc_handle as u32) {
                return Some(managed);
            }
        }
        trace!("wrapping {} created without its constructor", object);
        Some(self.attach(object, &record, true))
    }

    fn attach(&self, object: NativeHandle, record: &InjectedClass, wrapped: bool) -> Arc<ManagedObject> {
        let managed = Arc::new(ManagedObject::new(record.ty.clone(), object));
        managed.set_wrapped(wrapped);
        managed.bind_fields(record.bindings.clone());
        let id = self.handles.insert(managed.clone());
        let data = InjectedClassData { managed_gc_handle: id as usize };
        // Safety: the side record is the last slot of every injected instance
        unsafe { InjectedClassData::write(object, record.instance_size, data) };
        managed
    }

    /// Body of every injected `.ctor`
    pub(crate) fn construct(&self, object: NativeHandle, ty: &Arc<ManagedType>) {
        let Some(record) = self.record_for_object(object).or_else(|| self.record(ty.id())) else {
            error!("{} is not an instance of an injected class", object);
            return;
        };
        // Safety: see `managed_from_native`
        if unsafe { InjectedClassData::read(object, record.instance_size) }.managed_gc_handle != 0 {
            trace!("{} already has a managed counterpart", object);
            return;
        }
        let ty = &record.ty;
        let (constructor, wrapped) = match (&ty.native_constructor, &ty.constructor) {
            (Some(native), _) => (Some(native.clone()), true),
            (None, constructor) => (constructor.clone(), false),
        };
        let managed = self.attach(object, &record, wrapped);
        let Some(constructor) = constructor else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| constructor(&managed))) {
            Ok(Ok(())) => {}
            Ok(Err(exception)) => {
                error!("Exception in constructor of {}, not passing it to il2cpp: {}", ty.full_name(), exception)
            }
            Err(_) => error!("Panic in constructor of {}, not passing it to il2cpp", ty.full_name()),
        }
    }

    /// Body of every injected `Finalize`: releases the managed counterpart
    pub(crate) fn finalize(&self, object: NativeHandle) {
        let Some(record) = self.record_for_object(object) else {
            return;
        };
        // Safety: see `managed_from_native`
        let data = unsafe { InjectedClassData::read(object, record.instance_size) };
        if data.managed_gc_handle == 0 {
            return;
        }
        self.handles.remove(data.managed_gc_handle as u32);
        // Safety: as above
        unsafe { InjectedClassData::write(object, record.instance_size, InjectedClassData::default()) };
        trace!("finalized {} ({})", object, record.ty.full_name());
    }

    // Registration

    fn register(self: &Arc<Self>, ty: &Arc<ManagedType>, options: &RegisterOptions) -> Result<NativeHandle> {
        // Bases register recursively on the same thread
        let _guard = self.registration.lock();
        let name = ty.full_name();
        if let Some(record) = self.record(ty.id()) {
            return Ok(record.class);
        }
        if self.by_name.contains_key(&name) {
            return Err(InjectionError::DuplicateName(name).into());
        }
        if ty.is_generic_definition {
            return Err(InjectionError::GenericType(name).into());
        }

        let layouts = self.bridge.layouts();
        let active = layouts.active();
        if !active.class.is_complete() {
            return Err(InjectionError::IncompleteLayout { ty: name, layout: active.class.label }.into());
        }
        if !active.method.is_complete() {
            return Err(InjectionError::IncompleteLayout { ty: name, layout: active.method.label }.into());
        }
        let base_handle = self.resolve_base(ty, options)?;
        // Safety: base classes come from the runtime or from an earlier registration
        let base = unsafe { layouts.wrap_class(base_handle) }.ok_or_else(|| InjectionError::NoNativeBase(name.clone()))?;
        check_base(&name, &base)?;

        let interfaces = self.collect_interfaces(ty, options, &base)?;
        let field_kinds = self.check_fields(ty)?;
        let eligible = self.eligible_methods(ty);
        let eligible_refs: Vec<&ManagedMethod> = eligible.iter().map(|m| m.method).collect();
        let plan = vtable::plan(self, ty, base, &interfaces, &eligible_refs)?;

        // Nothing below can fail
        let class = layouts.new_class(plan.slots.len());
        // Safety: both blocks hold at least one class of the active layout
        unsafe { memory::copy(base.ptr(), class.ptr(), layouts.class_size()) };
        class.set_name(memory::leak_cstring(&ty.name));
        class.set_namespace(memory::leak_cstring(&ty.namespace));
        class.set_parent(base.ptr());
        class.set_element_class(class.ptr());
        class.set_cast_class(class.ptr());
        let _ = class.set_class_self(class.ptr());
        class.set_declaring_type(NativeHandle::NULL);
        class.set_generic_class(NativeHandle::NULL);
        class.set_static_fields(NativeHandle::NULL);
        class.set_nested_types(NativeHandle::NULL);
        class.set_nested_type_count(0);
        class.set_events(NativeHandle::NULL);
        class.set_event_count(0);
        class.set_properties(NativeHandle::NULL);
        class.set_property_count(0);

        let inherited = base.flags().unwrap_or(ClassAttributes::empty());
        let mut flags = inherited - (ClassAttributes::ABSTRACT | ClassAttributes::SEALED);
        if ty.is_abstract {
            flags |= ClassAttributes::ABSTRACT;
        }
        class.set_flags(flags);
        class.set_value_type(false);
        class.set_enum_type(false);
        class.set_is_generic(false);
        class.set_has_cctor(false);
        class.set_init_pending(false);
        class.set_has_finalize(true);
        class.set_initialized(true);
        let _ = class.set_initialized_and_no_error(true);
        let _ = class.set_has_initialization_error(false);
        class.set_size_inited(true);
        class.set_is_vtable_initialized(true);

        let token = tokens::assign(class.ptr());
        class.set_token(token as u32);
        self.attach_types(&base, &class, token);
        self.write_hierarchy(&base, &class);

        // Fields and the side record
        let mut bindings = FieldBindings::new(self.bridge.clone());
        if let Some(inherited) = self.by_class.get(&base.ptr()) {
            bindings.inherit(&inherited.bindings);
        }
        let mut offset = align_up(base.instance_size() as usize, SIZE_OF_PTR);
        let field_array = layouts.new_field_array(ty.fields.len());
        let mut has_references = base.has_references().unwrap_or(false);
        for (i, (field, class_type)) in ty.fields.iter().zip(&field_kinds).enumerate() {
            let size = match field.kind {
                FieldKind::Value(code) => code.size(),
                FieldKind::Reference(_) | FieldKind::String => {
                    has_references = true;
                    SIZE_OF_PTR
                }
            };
            offset = align_up(offset, size);
            // Safety: the array was sized for every field
            if let Some(info) = unsafe { layouts.wrap_field_at(field_array, i) } {
                info.set_name(memory::leak_cstring(&field.name));
                let class_type = if class_type.is_null() { self.api().class_get_type(class.ptr()) } else { *class_type };
                info.set_field_type(self.attributed_type(class_type, field.attributes));
                info.set_parent(class.ptr());
                info.set_offset(offset as i32);
            }
            bindings.bind(&field.name, offset, field.kind.clone());
            offset += size;
        }
        let instance_size = (align_up(offset, SIZE_OF_PTR) + InjectedClassData::SIZE) as u32;
        class.set_fields(if ty.fields.is_empty() { NativeHandle::NULL } else { field_array });
        class.set_field_count(ty.fields.len() as u16);
        class.set_instance_size(instance_size);
        class.set_actual_size(instance_size);
        class.set_native_size(-1);
        class.set_has_references(has_references);

        // Methods: [Finalize, .ctor, eligible...]
        let finalizer_slot = plan.slots.iter().position(|slot| *slot == SlotPlan::Finalizer);
        let finalizer = self.lifecycle_method(&class, ty, "Finalize", finalizer_slot);
        native_entry::register(finalizer.ptr(), DispatchTarget::Finalizer { state: self.clone() });
        let mut table = vec![finalizer.ptr()];
        let constructor = if ty.is_abstract {
            None
        } else {
            let ctor = self.lifecycle_method(&class, ty, ".ctor", None);
            native_entry::register(ctor.ptr(), DispatchTarget::Constructor { state: self.clone(), ty: ty.clone() });
            table.push(ctor.ptr());
            Some(ctor.ptr())
        };
        let mut infos = Vec::with_capacity(eligible.len());
        for (index, eligible) in eligible.iter().enumerate() {
            let info = self.synthesize_method(&class, ty, eligible, plan.slot_of(index));
            table.push(info.ptr());
            infos.push(info);
        }
        let methods = memory::alloc_array(table.len(), SIZE_OF_PTR);
        for (i, method) in table.iter().enumerate() {
            // Safety: the array holds `table.len()` pointers
            unsafe { memory::write_handle(methods, i * SIZE_OF_PTR, *method) };
        }
        class.set_methods(methods);
        class.set_method_count(table.len() as u16);

        // Vtable
        for (slot, entry) in plan.slots.iter().enumerate() {
            let entry = match *entry {
                SlotPlan::Inherit(inherited) => inherited,
                SlotPlan::Finalizer => VirtualInvokeData { method_ptr: finalizer.method_pointer(), method: finalizer.ptr() },
                SlotPlan::Method(i) => VirtualInvokeData { method_ptr: infos[i].method_pointer(), method: infos[i].ptr() },
                SlotPlan::NewAbstract(i) => VirtualInvokeData { method_ptr: NativeHandle::NULL, method: infos[i].ptr() },
            };
            class.set_vtable_entry(slot, entry);
        }
        class.set_vtable_count(plan.slots.len() as u16);
        self.write_interfaces(&base, &class, &plan.interface_offsets);

        let record = Arc::new(InjectedClass {
            ty: ty.clone(),
            class: class.ptr(),
            instance_size,
            bindings: Arc::new(bindings),
            constructor,
        });
        self.by_class.insert(class.ptr(), record.clone());
        self.by_name.insert(name.clone(), ty.id());
        self.by_id.insert(ty.id(), record);

        if options.log_success {
            info!("Registered managed type {} in il2cpp domain under il2cpp class {}", name, class.ptr());
        }
        debug!(
            "{}: {} methods, {} fields, {} vtable slots, {} bytes per instance",
            name,
            table.len(),
            ty.fields.len(),
            plan.slots.len(),
            instance_size
        );
        Ok(class.ptr())
    }

    fn resolve_base(self: &Arc<Self>, ty: &ManagedType, options: &RegisterOptions) -> Result<NativeHandle> {
        let base = match &ty.base {
            None => self.bridge.corlib_class("Object"),
            Some(BaseRef::Class(class)) => *class,
            Some(BaseRef::Named { assembly, namespace, name }) => self.bridge.get_class(assembly, namespace, name),
            Some(BaseRef::Managed(base)) => {
                let options = RegisterOptions { log_success: options.log_success, ..RegisterOptions::default() };
                return self.register(base, &options);
            }
        };
        if base.is_null() {
            return Err(InjectionError::NoNativeBase(ty.full_name()).into());
        }
        Ok(base)
    }

    fn collect_interfaces(
        &self,
        ty: &ManagedType,
        options: &RegisterOptions,
        base: &ClassStruct,
    ) -> std::result::Result<Vec<ClassStruct>, InjectionError> {
        let mut requested: Vec<NativeHandle> = options.interfaces.clone();
        requested.extend(ty.interfaces.iter().copied());
        if let Some(resolver) = &options.interface_resolver {
            requested.extend(resolver(ty));
        }
        let inherited: HashSet<NativeHandle> =
            (0..base.interfaces_count().unwrap_or(0) as usize).map(|i| base.implemented_interface_at(i)).collect();

        let layouts = self.bridge.layouts();
        let mut seen = HashSet::new();
        let mut interfaces = Vec::new();
        for handle in requested {
            if inherited.contains(&handle) || !seen.insert(handle) {
                continue;
            }
            // Safety: interface handles are runtime classes
            match unsafe { layouts.wrap_class(handle) } {
                Some(interface) if interface.has_flag(ClassAttributes::INTERFACE) => interfaces.push(interface),
                Some(class) => return Err(InjectionError::NotAnInterface(class.full_name())),
                None => return Err(InjectionError::NotAnInterface(format!("null interface of {}", ty.full_name()))),
            }
        }
        Ok(interfaces)
    }

    /// By-value class type of every field, checked before anything is allocated
    fn check_fields(&self, ty: &ManagedType) -> std::result::Result<Vec<NativeHandle>, InjectionError> {
        let mut types = Vec::with_capacity(ty.fields.len());
        let mut names = HashSet::new();
        for field in &ty.fields {
            if !names.insert(field.name.as_str()) {
                warn!("{} declares field {} twice; the last one wins", ty.full_name(), field.name);
            }
            let self_reference = matches!(&field.kind, FieldKind::Reference(TypeRef::Managed(id)) if *id == ty.id());
            if self_reference {
                // Typed once the class exists
                types.push(NativeHandle::NULL);
                continue;
            }
            let class = match &field.kind {
                FieldKind::String => self.bridge.corlib_class("String"),
                FieldKind::Value(code) if code.is_primitive() => self.corlib_class_of(*code),
                FieldKind::Value(_) => NativeHandle::NULL,
                FieldKind::Reference(TypeRef::GenericParameter(_) | TypeRef::Void | TypeRef::Value(_)) => {
                    NativeHandle::NULL
                }
                FieldKind::Reference(other) => self.resolve_class(other, ty, NativeHandle::NULL),
            };
            if class.is_null() {
                return Err(InjectionError::UnknownFieldType {
                    field: format!("{}::{}", ty.full_name(), field.name),
                    ty: format!("{:?}", field.kind),
                });
            }
            types.push(self.api().class_get_type(class));
        }
        Ok(types)
    }

    fn eligible_methods<'a>(&self, ty: &'a ManagedType) -> Vec<EligibleMethod<'a>> {
        let owner = ty.full_name();
        let mut eligible = Vec::new();
        for method in &ty.methods {
            if method.is_static || method.hidden || method.name == "Finalize" {
                trace!("{}::{} is not injected", owner, method.name);
                continue;
            }
            if method.parameters.len() > MAX_ARITY {
                warn!("{}::{} takes more than {} parameters and is not injected", owner, method.name, MAX_ARITY);
                continue;
            }
            let arity = method.generic_arity;
            let supported = self.supports(&method.return_type, ty, arity, true)
                && method.parameters.iter().all(|p| self.supports(&p.ty, ty, arity, false));
            if !supported {
                warn!("Method {} of {} has unsupported parameter or return types and is not injected", method.signature(), owner);
                continue;
            }
            let trampoline = if method.is_abstract {
                None
            } else {
                match Trampoline::build(&owner, method) {
                    Some(trampoline) => Some(Arc::new(trampoline)),
                    None => {
                        warn!("Method {} of {} has no native-callable form and is not injected", method.signature(), owner);
                        continue;
                    }
                }
            };
            eligible.push(EligibleMethod { method, trampoline });
        }
        eligible
    }

    fn attach_types(&self, base: &ClassStruct, class: &ClassStruct, token: i64) {
        let layouts = self.bridge.layouts();
        let data = NativeHandle::from_addr(token as usize);
        let byval = layouts.new_type();
        if let Some(source) = base.byval_arg() {
            byval.copy_from(&source);
        }
        byval.set_data(data);
        byval.set_type_code(TypeCode::CLASS);
        byval.set_by_ref(false);
        class.attach_byval_arg(&byval);

        let this = layouts.new_type();
        if let Some(source) = base.this_arg() {
            this.copy_from(&source);
        }
        this.set_data(data);
        this.set_type_code(TypeCode::CLASS);
        this.set_by_ref(true);
        class.attach_this_arg(&this);
    }

    fn write_hierarchy(&self, base: &ClassStruct, class: &ClassStruct) {
        let depth = base.type_hierarchy_depth().unwrap_or(0) as usize + 1;
        let hierarchy = memory::alloc_array(depth, SIZE_OF_PTR);
        for i in 0..depth - 1 {
            // Safety: `hierarchy` holds `depth` pointers
            unsafe { memory::write_handle(hierarchy, i * SIZE_OF_PTR, base.type_hierarchy_at(i)) };
        }
        // Safety: as above
        unsafe { memory::write_handle(hierarchy, (depth - 1) * SIZE_OF_PTR, class.ptr()) };
        class.set_type_hierarchy(hierarchy);
        class.set_type_hierarchy_depth(depth as u8);
    }

    fn write_interfaces(&self, base: &ClassStruct, class: &ClassStruct, added: &[(NativeHandle, usize)]) {
        if added.is_empty() {
            return;
        }
        let mut implemented: Vec<NativeHandle> =
            (0..base.interfaces_count().unwrap_or(0) as usize).map(|i| base.implemented_interface_at(i)).collect();
        implemented.extend(added.iter().map(|(interface, _)| *interface));
        let array = memory::alloc_array(implemented.len(), SIZE_OF_PTR);
        for (i, interface) in implemented.iter().enumerate() {
            // Safety: the array holds one pointer per interface
            unsafe { memory::write_handle(array, i * SIZE_OF_PTR, *interface) };
        }
        class.set_implemented_interfaces(array);
        class.set_interfaces_count(implemented.len() as u16);

        let mut pairs: Vec<InterfaceOffsetPair> =
            (0..base.interface_offsets_count().unwrap_or(0) as usize).map(|i| base.interface_offset_at(i)).collect();
        pairs.extend(added.iter().map(|(interface, offset)| InterfaceOffsetPair {
            interface_type: *interface,
            offset: *offset as i32,
        }));
        let offsets = memory::alloc_array(pairs.len(), interface_pair_size());
        write_interface_offsets(offsets, &pairs);
        class.set_interface_offsets(offsets);
        class.set_interface_offsets_count(pairs.len() as u16);
    }

    /// `Finalize` or `.ctor`: no parameters, no result, dispatched by the lifecycle hooks
    fn lifecycle_method(&self, class: &ClassStruct, ty: &ManagedType, name: &str, slot: Option<usize>) -> MethodStruct {
        let method = self.bridge.layouts().new_method();
        method.set_name(memory::leak_cstring(name));
        method.set_declaring_class(class.ptr());
        method.set_return_type(self.type_handle(&TypeRef::Void, ty, class.ptr()));
        let mut flags = MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG;
        if name == ".ctor" {
            flags |= MethodAttributes::SPECIAL_NAME | MethodAttributes::RT_SPECIAL_NAME;
        } else {
            flags |= MethodAttributes::VIRTUAL;
        }
        method.set_flags(flags);
        method.set_slot(slot.map_or(u16::MAX, |s| s as u16));
        self.point_at_entry(&method, 0, 0);
        method
    }

    fn point_at_entry(&self, method: &MethodStruct, arity: usize, float_mask: u16) {
        let entry = native_entry::entry_point(arity, float_mask).unwrap_or_default();
        method.set_method_pointer(entry);
        let _ = method.set_virtual_method_pointer(entry);
        method.set_invoker_method(native_entry::generic_invoker_address());
    }

    fn synthesize_method(
        self: &Arc<Self>,
        class: &ClassStruct,
        ty: &ManagedType,
        eligible: &EligibleMethod<'_>,
        slot: Option<usize>,
    ) -> MethodStruct {
        let layouts = self.bridge.layouts();
        let method = eligible.method;
        let info = layouts.new_method();
        info.set_name(memory::leak_cstring(&method.name));
        info.set_declaring_class(class.ptr());
        info.set_return_type(self.type_handle(&method.return_type, ty, class.ptr()));
        info.set_is_generic(method.is_generic());

        let count = method.parameters.len();
        if count > 0 {
            let array = layouts.new_parameter_array(count);
            for (i, parameter) in method.parameters.iter().enumerate() {
                // Safety: the array was sized for every parameter
                if let Some(slot) = unsafe { layouts.wrap_parameter_at(array, i) } {
                    slot.set_parameter_type(self.type_handle(&parameter.ty, ty, class.ptr()));
                    let _ = slot.set_name(memory::leak_cstring(&parameter.name));
                    let _ = slot.set_position(i as i32);
                }
            }
            info.set_parameters(array);
        }
        info.set_parameters_count(count as u8);

        let mut flags = MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG;
        if slot.is_some() {
            flags |= MethodAttributes::VIRTUAL;
        }
        if method.is_abstract {
            flags |= MethodAttributes::ABSTRACT;
        }
        info.set_flags(flags);
        info.set_slot(slot.map_or(u16::MAX, |s| s as u16));

        let Some(trampoline) = eligible.trampoline.clone() else {
            return info;
        };
        self.point_at_entry(&info, count, trampoline.float_mask());
        if method.is_generic() {
            inflation::register_open(self.clone(), info.ptr(), method.clone(), trampoline);
        } else {
            let target = MethodTarget {
                state: self.clone(),
                arguments: method.parameters.iter().map(|p| self.arg_passing(&p.ty, &[])).collect(),
                return_class: self.return_class(&method.return_type, &[]),
                generic_arguments: Vec::new(),
                trampoline,
            };
            native_entry::register(info.ptr(), DispatchTarget::Method(target));
        }
        trace!("injected {} as {}", method.signature(), info.ptr());
        info
    }
}

impl TrampolineContext for InjectorState {
    fn string_to_managed(&self, string: NativeHandle) -> Option<String> {
        self.bridge.string_to_managed(string)
    }

    fn managed_to_string(&self, value: Option<&str>) -> NativeHandle {
        self.bridge.managed_to_string(value)
    }

    fn managed_from_native(&self, object: NativeHandle) -> Option<Arc<ManagedObject>> {
        InjectorState::managed_from_native(self, object)
    }
}

fn check_base(name: &str, base: &ClassStruct) -> std::result::Result<(), InjectionError> {
    let base_name = base.full_name();
    let flags = base.flags().unwrap_or(ClassAttributes::empty());
    let rejection = if base.value_type().unwrap_or(false) {
        InjectionError::ValueTypeBase { ty: name.to_string(), base: base_name }
    } else if flags.contains(ClassAttributes::INTERFACE) {
        InjectionError::InterfaceBase { ty: name.to_string(), base: base_name }
    } else if flags.contains(ClassAttributes::SEALED) {
        InjectionError::SealedBase { ty: name.to_string(), base: base_name }
    } else if base.is_generic().unwrap_or(false) {
        InjectionError::GenericBase { ty: name.to_string(), base: base_name }
    } else {
        return Ok(());
    };
    Err(rejection)
}

fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Registers host types as native classes and links their instances
pub struct ClassInjector {
    state: Arc<InjectorState>,
}

impl std::fmt::Debug for ClassInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassInjector")
            .field("types", &self.state.by_id.len())
            .field("live_objects", &self.state.handles.len())
            .finish()
    }
}

impl ClassInjector {
    pub fn new(bridge: Arc<Il2CppBridge>) -> Self {
        ClassInjector { state: Arc::new(InjectorState::new(bridge)) }
    }

    pub fn bridge(&self) -> &Arc<Il2CppBridge> {
        self.state.bridge()
    }

    /// Intercept `Class::FromIl2CppType` and `GenericMethod::GetMethod`
    ///
    /// Injected classes resolve from their type descriptors and injected
    /// generic methods inflate only once this has succeeded. Each function is
    /// attached at most once: calling again, concurrently or after a partial
    /// failure, only attaches what is still missing.
    ///
    /// # Safety
    /// `targets` must be the addresses of those two runtime functions.
    pub unsafe fn install_hooks(&self, detour: &dyn Detour, targets: HookTargets) -> Result<()> {
        let hooks = &self.state.hooks;
        let data_offset = self.state.bridge.layouts().active().ty.data as usize;

        let original = *hooks.class_from_type.get_or_try_init(|| {
            let original = attach_hook(detour, targets.class_from_type, tokens::hook_address())?;
            info!("Hooked Class::FromIl2CppType");
            Ok::<_, InteropError>(original)
        })?;
        tokens::set_original(std::mem::transmute::<usize, ClassFromTypeFn>(original.addr()), data_offset)?;

        let original = *hooks.generic_method_get_method.get_or_try_init(|| {
            let original = attach_hook(detour, targets.generic_method_get_method, inflation::hook_address())?;
            info!("Hooked GenericMethod::GetMethod");
            Ok::<_, InteropError>(original)
        })?;
        inflation::set_original(std::mem::transmute::<usize, GenericMethodGetMethodFn>(original.addr()))?;
        Ok(())
    }

    pub fn is_registered(&self, ty: &ManagedType) -> bool {
        self.state.by_id.contains_key(&ty.id())
    }

    /// Inject `ty`, and any injected base it derives from, as a native class
    ///
    /// Registering a type again returns its class. Every rejection is reported
    /// before native memory is written for the type.
    pub fn register(&self, ty: &Arc<ManagedType>, options: &RegisterOptions) -> Result<NativeHandle> {
        self.state.register(ty, options)
    }

    /// The native class of a registered type
    pub fn class_of(&self, ty: &ManagedType) -> Option<NativeHandle> {
        self.state.record(ty.id()).map(|record| record.class)
    }

    /// Allocate a native instance of a registered type and run its constructor
    pub fn new_object(&self, ty: &ManagedType) -> Option<Arc<ManagedObject>> {
        let Some(record) = self.state.record(ty.id()) else {
            error!("{} is not registered", ty.full_name());
            return None;
        };
        let Some(constructor) = record.constructor else {
            warn!("{} is abstract and can't be instantiated", ty.full_name());
            return None;
        };
        let object = self.state.api().object_new(record.class);
        if object.is_null() {
            error!("Failed to allocate an instance of {}", ty.full_name());
            return None;
        }
        if self.state.bridge.invoke_raw(constructor, object, &mut []).threw() {
            return None;
        }
        self.state.managed_from_native(object)
    }

    /// The managed counterpart of an instance of an injected class
    pub fn managed_from_native(&self, object: NativeHandle) -> Option<Arc<ManagedObject>> {
        self.state.managed_from_native(object)
    }

    /// Managed objects whose native instance has not been finalized
    pub fn live_objects(&self) -> usize {
        self.state.handles.len()
    }
}

/// # Safety
/// See [`Detour::attach`].
unsafe fn attach_hook(detour: &dyn Detour, target: NativeHandle, hook: NativeHandle) -> Result<NativeHandle> {
    if target.is_null() {
        return Err(InteropError::Hook { target, reason: "address is unknown".to_string() });
    }
    let original = detour.attach(target, hook)?;
    if original.is_null() {
        return Err(InteropError::Hook { target, reason: "the detour returned no original".to_string() });
    }
    Ok(original)
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;

    use super::*;
    use crate::error::ManagedException;
    use crate::fake::{ClassSpec, FakeRuntime};
    use crate::il2cpp::offsets::{GENERIC_INST_ARGC, GENERIC_INST_ARGV, GENERIC_METHOD_DEFINITION, GENERIC_METHOD_METHOD_INST};
    use crate::injector::managed::ManagedMethod;

    fn setup() -> (Arc<FakeRuntime>, Arc<Il2CppBridge>, ClassInjector) {
        let fake = FakeRuntime::shared();
        let bridge = Arc::new(Il2CppBridge::new(fake.clone(), fake.layouts().clone()));
        let injector = ClassInjector::new(bridge.clone());
        (fake, bridge, injector)
    }

    fn class(bridge: &Il2CppBridge, handle: NativeHandle) -> ClassStruct {
        unsafe { bridge.layouts().wrap_class(handle) }.unwrap()
    }

    fn int() -> TypeRef {
        TypeRef::Value(TypeCode::I4)
    }

    /// An `Il2CppGenericInst` of one argument
    pub(super) fn instantiation(arg: NativeHandle) -> NativeHandle {
        let argv = memory::alloc_array(1, SIZE_OF_PTR);
        let inst = memory::alloc_zeroed(0x10);
        unsafe {
            memory::write_handle(argv, 0, arg);
            memory::write::<u32>(inst, GENERIC_INST_ARGC, 1);
            memory::write_handle(inst, GENERIC_INST_ARGV, argv);
        }
        inst
    }

    pub(super) fn generic_method(open: NativeHandle, inst: NativeHandle) -> NativeHandle {
        let gmethod = memory::alloc_zeroed(0x18);
        unsafe {
            memory::write_handle(gmethod, GENERIC_METHOD_DEFINITION, open);
            memory::write_handle(gmethod, GENERIC_METHOD_METHOD_INST, inst);
        }
        gmethod
    }

    fn injection_error(result: Result<NativeHandle>) -> InjectionError {
        match result {
            Err(InteropError::Injection(e)) => e,
            other => panic!("expected an injection error, got {:?}", other),
        }
    }

    #[test]
    fn test_register_is_idempotent_and_names_are_unique() {
        struct First;
        struct Second;
        let (_fake, _bridge, injector) = setup();
        let first = ManagedType::builder::<First>("Mods", "Same").build();
        let second = ManagedType::builder::<Second>("Mods", "Same").build();

        let class = injector.register(&first, &RegisterOptions::default()).unwrap();
        assert!(injector.is_registered(&first));
        assert_eq!(injector.register(&first, &RegisterOptions::default()).unwrap(), class);
        assert_eq!(
            injection_error(injector.register(&second, &RegisterOptions::default())),
            InjectionError::DuplicateName("Mods.Same".to_string())
        );
        assert!(!injector.is_registered(&second));
    }

    #[test]
    fn test_ineligible_bases_are_rejected() {
        struct OnValue;
        struct OnSealed;
        struct OnInterface;
        struct OnGeneric;
        struct Open;
        let (fake, _bridge, injector) = setup();
        let image = fake.add_image("Game.dll");
        let interface = fake.add_class(image, ClassSpec::new("Game", "IThing").interface());
        let generic = fake.add_class(image, ClassSpec::new("Game", "Box`1").generic());
        let options = RegisterOptions::default();

        let on_value = ManagedType::builder::<OnValue>("Mods", "OnValue").base_class(fake.corlib_class("Int32")).build();
        assert!(matches!(injection_error(injector.register(&on_value, &options)), InjectionError::ValueTypeBase { .. }));
        let on_sealed = ManagedType::builder::<OnSealed>("Mods", "OnSealed").base_class(fake.corlib_class("String")).build();
        assert!(matches!(injection_error(injector.register(&on_sealed, &options)), InjectionError::SealedBase { .. }));
        let on_interface = ManagedType::builder::<OnInterface>("Mods", "OnInterface").base_class(interface.ptr()).build();
        assert!(matches!(
            injection_error(injector.register(&on_interface, &options)),
            InjectionError::InterfaceBase { .. }
        ));
        let on_generic = ManagedType::builder::<OnGeneric>("Mods", "OnGeneric").base_class(generic.ptr()).build();
        assert!(matches!(injection_error(injector.register(&on_generic, &options)), InjectionError::GenericBase { .. }));
        let open = ManagedType::builder::<Open>("Mods", "Open`1").generic_definition().build();
        assert_eq!(
            injection_error(injector.register(&open, &options)),
            InjectionError::GenericType("Mods.Open`1".to_string())
        );
        for ty in [&on_value, &on_sealed, &on_interface, &on_generic, &open] {
            assert!(!injector.is_registered(ty));
        }
    }

    #[test]
    fn test_registration_needs_a_complete_class_layout() {
        struct Legacy;
        let fake = FakeRuntime::shared_for(crate::version::UnityVersion::new(2017, 4, 40));
        let bridge = Arc::new(Il2CppBridge::new(fake.clone(), fake.layouts().clone()));
        let injector = ClassInjector::new(bridge);
        let ty = ManagedType::builder::<Legacy>("Mods", "Legacy").build();
        assert_eq!(
            injection_error(injector.register(&ty, &RegisterOptions::default())),
            InjectionError::IncompleteLayout { ty: "Mods.Legacy".to_string(), layout: "Class_23_0" }
        );
        assert!(!injector.is_registered(&ty));
    }

    #[test]
    fn test_objects_fields_and_overrides() {
        struct Counter;
        let (_fake, bridge, injector) = setup();
        let ty = ManagedType::builder::<Counter>("Mods", "Counter")
            .field(ManagedField::value("count", TypeCode::I4))
            .field(ManagedField::string("label"))
            .constructor(|object| {
                object.set_state(String::from("ready"));
                Ok(())
            })
            .method(ManagedMethod::new("ToString", TypeRef::String, &[], |call| {
                let count = call.this.value_field::<i32>("count").map_or(0, |f| f.get());
                Ok(ManagedValue::String(Some(format!("count {}", count))))
            }))
            .build();
        let handle = injector.register(&ty, &RegisterOptions::default()).unwrap();
        let class = class(&bridge, handle);
        assert_eq!(class.full_name(), "Mods.Counter");
        assert_eq!(class.parent(), Some(bridge.corlib_class("Object")));
        assert_eq!(class.instance_size(), 0x28);
        assert_eq!(class.type_hierarchy_depth(), Some(2));
        assert_eq!(class.type_hierarchy_at(1), handle);
        // Finalize, .ctor, ToString
        assert_eq!(class.method_count(), 3);
        assert_eq!(bridge.api().method_get_name(class.method_at(1)).as_deref(), Some(".ctor"));

        let object = injector.new_object(&ty).unwrap();
        assert!(!object.is_wrapped());
        assert_eq!(object.with_state(|s: &mut String| s.clone()).as_deref(), Some("ready"));
        object.value_field::<i32>("count").unwrap().set(5);
        object.string_field("label").unwrap().set(Some("five"));
        let field = bridge.get_field(handle, "count");
        assert_eq!(unsafe { bridge.field_value::<i32>(object.native(), field) }, 5);
        assert_eq!(object.string_field("label").unwrap().get().as_deref(), Some("five"));

        let to_string = class.vtable_entry(3);
        assert_eq!(bridge.api().method_get_name(to_string.method).as_deref(), Some("ToString"));
        let result = bridge.invoke_raw(to_string.method, object.native(), &mut []);
        assert_eq!(bridge.string_to_managed(result.value).as_deref(), Some("count 5"));
        assert!(Arc::ptr_eq(&injector.managed_from_native(object.native()).unwrap(), &object));
    }

    #[test]
    fn test_finalizer_releases_the_managed_object() {
        struct Transient;
        let (_fake, bridge, injector) = setup();
        let ty = ManagedType::builder::<Transient>("Mods", "Transient").build();
        let handle = injector.register(&ty, &RegisterOptions::default()).unwrap();
        let object = injector.new_object(&ty).unwrap();
        let live = injector.live_objects();

        let finalize = class(&bridge, handle).vtable_entry(1);
        assert_eq!(bridge.api().method_get_name(finalize.method).as_deref(), Some("Finalize"));
        bridge.invoke_raw(finalize.method, object.native(), &mut []);
        assert_eq!(injector.live_objects(), live - 1);

        let rewrapped = injector.managed_from_native(object.native()).unwrap();
        assert!(rewrapped.is_wrapped());
        assert!(!Arc::ptr_eq(&rewrapped, &object));
    }

    #[test]
    fn test_failures_stop_at_the_trampoline() {
        struct Faulty;
        let (fake, bridge, injector) = setup();
        let ty = ManagedType::builder::<Faulty>("Mods", "Faulty")
            .method(ManagedMethod::new("Explode", int(), &[], |_| Err(ManagedException::from("boom"))))
            .method(ManagedMethod::new("Panic", int(), &[], |_| panic!("unreachable state")))
            .build();
        let handle = injector.register(&ty, &RegisterOptions::default()).unwrap();
        let object = injector.new_object(&ty).unwrap();
        for name in ["Explode", "Panic"] {
            let method = fake.class_get_method_from_name(handle, name, 0);
            assert!(!method.is_null());
            let result = bridge.invoke_raw(method, object.native(), &mut []);
            assert!(!result.threw());
            assert_eq!(unsafe { bridge.unbox::<i32>(result.value) }, Some(0));
        }
    }

    #[test]
    fn test_abstract_slots_must_be_filled() {
        struct Lazy;
        struct Busy;
        let (fake, bridge, injector) = setup();
        let image = fake.add_image("Game.dll");
        let base = fake.add_class(image, ClassSpec::new("Game", "Behaviour").flags(ClassAttributes::ABSTRACT));
        fake.add_virtual_method(base, "Score", fake.primitive_type(TypeCode::I4), &[], true);

        let lazy = ManagedType::builder::<Lazy>("Mods", "Lazy").base_class(base.ptr()).build();
        assert_eq!(
            injection_error(injector.register(&lazy, &RegisterOptions::default())),
            InjectionError::MissingVtableImplementation {
                ty: "Mods.Lazy".to_string(),
                method: "Game.Behaviour::Score".to_string()
            }
        );
        assert!(!injector.is_registered(&lazy));

        let busy = ManagedType::builder::<Busy>("Mods", "Busy")
            .base_class(base.ptr())
            .method(ManagedMethod::new("Score", int(), &[], |_| Ok(ManagedValue::Int(7))))
            .build();
        let handle = injector.register(&busy, &RegisterOptions::default()).unwrap();
        let score = class(&bridge, handle).vtable_entry(4);
        assert!(!score.method_ptr.is_null());
        let object = injector.new_object(&busy).unwrap();
        let result = bridge.invoke_raw(score.method, object.native(), &mut []);
        assert_eq!(unsafe { bridge.unbox::<i32>(result.value) }, Some(7));
    }

    #[test]
    fn test_injected_abstract_base() {
        struct Shape;
        struct Square;
        let (_fake, bridge, injector) = setup();
        let shape = ManagedType::builder::<Shape>("Mods", "Shape")
            .abstract_type()
            .field(ManagedField::value("side", TypeCode::I4))
            .method(ManagedMethod::abstract_method("Area", int(), &[]))
            .build();
        let square = ManagedType::builder::<Square>("Mods", "Square")
            .extends(shape.clone())
            .method(ManagedMethod::new("Area", int(), &[], |call| {
                let side = call.this.value_field::<i32>("side").map_or(0, |f| f.get());
                Ok(ManagedValue::Int((side * side) as i64))
            }))
            .build();

        let square_class = injector.register(&square, &RegisterOptions::default()).unwrap();
        assert!(injector.is_registered(&shape));
        assert!(injector.new_object(&shape).is_none());
        let shape_class = class(&bridge, injector.class_of(&shape).unwrap());
        assert!(shape_class.has_flag(ClassAttributes::ABSTRACT));
        assert!(shape_class.vtable_entry(4).method_ptr.is_null());

        let object = injector.new_object(&square).unwrap();
        object.value_field::<i32>("side").unwrap().set(6);
        let area = class(&bridge, square_class).vtable_entry(4);
        let result = bridge.invoke_raw(area.method, object.native(), &mut []);
        assert_eq!(unsafe { bridge.unbox::<i32>(result.value) }, Some(36));
    }

    #[test]
    fn test_interfaces_get_their_own_block() {
        struct Runner;
        struct NotRunner;
        let (fake, bridge, injector) = setup();
        let image = fake.add_image("Game.dll");
        let runnable = fake.add_class(image, ClassSpec::new("Game", "IRunnable").interface());
        fake.add_virtual_method(runnable, "Run", fake.primitive_type(TypeCode::VOID), &[], true);

        let ty = ManagedType::builder::<Runner>("Mods", "Runner")
            .method(ManagedMethod::new("Run", TypeRef::Void, &[], |_| Ok(ManagedValue::Void)))
            .build();
        let options = RegisterOptions { interfaces: vec![runnable.ptr()], ..RegisterOptions::default() };
        let class = class(&bridge, injector.register(&ty, &options).unwrap());
        assert_eq!(class.interfaces_count(), Some(1));
        assert_eq!(class.implemented_interface_at(0), runnable.ptr());
        assert_eq!(class.interface_offset_at(0), InterfaceOffsetPair { interface_type: runnable.ptr(), offset: 4 });
        assert_eq!(bridge.api().method_get_name(class.vtable_entry(4).method).as_deref(), Some("Run"));

        let wrong = ManagedType::builder::<NotRunner>("Mods", "NotRunner").build();
        let options = RegisterOptions { interfaces: vec![fake.corlib_class("Exception")], ..RegisterOptions::default() };
        assert_eq!(
            injection_error(injector.register(&wrong, &options)),
            InjectionError::NotAnInterface("System.Exception".to_string())
        );
    }

    #[test]
    fn test_generic_methods_inflate_once_per_instantiation() {
        struct Echoer;
        let (fake, bridge, injector) = setup();
        unsafe { injector.install_hooks(&*fake, fake.hook_targets()) }.unwrap();
        let ty = ManagedType::builder::<Echoer>("Mods", "Echoer")
            .method(
                ManagedMethod::new("Echo", TypeRef::GenericParameter(0), &[("value", TypeRef::GenericParameter(0))], |call| {
                    Ok(call.args[0].clone())
                })
                .generic(1),
            )
            .build();
        let handle = injector.register(&ty, &RegisterOptions::default()).unwrap();
        assert_eq!(bridge.type_name(fake.class_get_type(handle)).as_deref(), Some("Mods.Echoer"));
        let open = fake.class_get_method_from_name(handle, "Echo", 1);

        let of_int = instantiation(fake.primitive_type(TypeCode::I4));
        let first = fake.generic_method_get_method(generic_method(open, of_int));
        let again = fake.generic_method_get_method(generic_method(open, of_int));
        let of_string =
            fake.generic_method_get_method(generic_method(open, instantiation(fake.primitive_type(TypeCode::STRING))));
        assert!(!first.is_null());
        assert_ne!(first, open);
        assert_eq!(first, again);
        assert_ne!(first, of_string);

        let object = injector.new_object(&ty).unwrap();
        let mut value: i32 = 41;
        let result = bridge.invoke_raw(first, object.native(), &mut [&mut value as *mut i32 as *mut c_void]);
        assert_eq!(unsafe { bridge.unbox::<i32>(result.value) }, Some(41));

        // Methods the injector did not create go to the runtime
        let foreign = memory::alloc_zeroed(0x18);
        assert!(fake.generic_method_get_method(foreign).is_null());
    }

    #[test]
    fn test_float_overrides_use_vector_registers() {
        struct Scaler;
        let (fake, bridge, injector) = setup();
        let ty = ManagedType::builder::<Scaler>("Mods", "Scaler")
            .method(ManagedMethod::new(
                "Scale",
                TypeRef::Value(TypeCode::R4),
                &[("value", TypeRef::Value(TypeCode::R4)), ("times", int()), ("by", TypeRef::Value(TypeCode::R8))],
                |call| {
                    let value = call.args[0].as_f64().unwrap_or_default();
                    let times = call.args[1].as_f64().unwrap_or_default();
                    let by = call.args[2].as_f64().unwrap_or_default();
                    Ok(ManagedValue::Float(value * times * by))
                },
            ))
            .build();
        let handle = injector.register(&ty, &RegisterOptions::default()).unwrap();
        let method = fake.class_get_method_from_name(handle, "Scale", 3);
        assert!(!method.is_null());
        let object = injector.new_object(&ty).unwrap();

        let (mut value, mut times, mut by) = (1.5f32, 3i32, 0.5f64);
        let result = bridge.invoke_raw(
            method,
            object.native(),
            &mut [
                &mut value as *mut f32 as *mut c_void,
                &mut times as *mut i32 as *mut c_void,
                &mut by as *mut f64 as *mut c_void,
            ],
        );
        assert_eq!(unsafe { bridge.unbox::<f32>(result.value) }, Some(2.25));

        // Called the way compiled code calls it
        let pointer = unsafe { bridge.layouts().wrap_method(method) }.unwrap().method_pointer();
        let scale = unsafe {
            std::mem::transmute::<usize, unsafe extern "C" fn(NativeHandle, f32, i32, f64, NativeHandle) -> f32>(
                pointer.addr(),
            )
        };
        assert_eq!(unsafe { scale(object.native(), 2.0, 5, 0.25, method) }, 2.5);
    }

    #[test]
    fn test_struct_parameters_arrive_by_address() {
        struct Measurer;
        let (fake, bridge, injector) = setup();
        let image = fake.add_image("Game.dll");
        let vector = fake.add_class(image, ClassSpec::new("UnityEngine", "Vector3Int").value_type(12));
        let ty = ManagedType::builder::<Measurer>("Mods", "Measurer")
            .method(ManagedMethod::new("Sum", int(), &[("v", TypeRef::Class(vector.ptr()))], |call| {
                let ManagedValue::Native(data) = call.args[0] else {
                    return Err(ManagedException::from("expected a struct address"));
                };
                let sum: i32 = (0..3).map(|i| unsafe { memory::read::<i32>(data, i * 4) }).sum();
                Ok(ManagedValue::Int(sum as i64))
            }))
            .build();
        let handle = injector.register(&ty, &RegisterOptions::default()).unwrap();
        let method = fake.class_get_method_from_name(handle, "Sum", 1);
        assert!(!method.is_null());
        let object = injector.new_object(&ty).unwrap();
        let mut v: [i32; 3] = [4, 5, 6];
        let result = bridge.invoke_raw(method, object.native(), &mut [v.as_mut_ptr() as *mut c_void]);
        assert_eq!(unsafe { bridge.unbox::<i32>(result.value) }, Some(15));

        // Returning a struct by value is still refused
        struct Maker;
        let maker = ManagedType::builder::<Maker>("Mods", "Maker")
            .method(ManagedMethod::new("Make", TypeRef::Class(vector.ptr()), &[], |_| Ok(ManagedValue::Void)))
            .build();
        let handle = injector.register(&maker, &RegisterOptions::default()).unwrap();
        assert!(fake.class_get_method_from_name(handle, "Make", 0).is_null());
    }

    #[test]
    fn test_generic_floats_and_wide_structs_inflate() {
        struct Picker;
        let (fake, bridge, injector) = setup();
        unsafe { injector.install_hooks(&*fake, fake.hook_targets()) }.unwrap();
        let image = fake.add_image("Game.dll");
        let triple = fake.add_class(image, ClassSpec::new("Game", "Triple").value_type(12));
        let ty = ManagedType::builder::<Picker>("Mods", "Picker")
            .method(
                ManagedMethod::new("Same", TypeRef::GenericParameter(0), &[("value", TypeRef::GenericParameter(0))], |call| {
                    Ok(call.args[0].clone())
                })
                .generic(1),
            )
            .method(
                ManagedMethod::new("Last", int(), &[("value", TypeRef::GenericParameter(0))], |call| {
                    let ManagedValue::Native(data) = call.args[0] else {
                        return Err(ManagedException::from("expected a struct address"));
                    };
                    Ok(ManagedValue::Int(unsafe { memory::read::<i32>(data, 8) } as i64))
                })
                .generic(1),
            )
            .build();
        let handle = injector.register(&ty, &RegisterOptions::default()).unwrap();
        let object = injector.new_object(&ty).unwrap();

        let same = fake.class_get_method_from_name(handle, "Same", 1);
        let of_single = fake.generic_method_get_method(generic_method(same, instantiation(fake.primitive_type(TypeCode::R4))));
        assert!(!of_single.is_null());
        let open_entry = unsafe { bridge.layouts().wrap_method(same) }.unwrap().method_pointer();
        let single_entry = unsafe { bridge.layouts().wrap_method(of_single) }.unwrap().method_pointer();
        assert_eq!(single_entry, native_entry::entry_point(1, 0b11).unwrap());
        assert_ne!(single_entry, open_entry);
        let mut value = 0.75f32;
        let result = bridge.invoke_raw(of_single, object.native(), &mut [&mut value as *mut f32 as *mut c_void]);
        assert_eq!(unsafe { bridge.unbox::<f32>(result.value) }, Some(0.75));

        let last = fake.class_get_method_from_name(handle, "Last", 1);
        let of_triple = fake.generic_method_get_method(generic_method(last, instantiation(fake.class_get_type(triple.ptr()))));
        assert!(!of_triple.is_null());
        let mut data: [i32; 3] = [1, 2, 3];
        let result = bridge.invoke_raw(of_triple, object.native(), &mut [data.as_mut_ptr() as *mut c_void]);
        assert_eq!(unsafe { bridge.unbox::<i32>(result.value) }, Some(3));
    }

    #[test]
    fn test_hooks_need_known_targets() {
        let (fake, _bridge, injector) = setup();
        let targets = HookTargets { class_from_type: NativeHandle::NULL, ..fake.hook_targets() };
        assert!(matches!(unsafe { injector.install_hooks(&*fake, targets) }, Err(InteropError::Hook { .. })));
        let targets = HookTargets { class_from_type: NativeHandle::from_addr(0x1234), ..fake.hook_targets() };
        assert!(matches!(unsafe { injector.install_hooks(&*fake, targets) }, Err(InteropError::Hook { .. })));
    }

    /// Forwards to the fake runtime, refusing one target on demand and counting attaches
    struct CountingDetour {
        runtime: Arc<FakeRuntime>,
        refuse: parking_lot::Mutex<Option<NativeHandle>>,
        attached: parking_lot::Mutex<Vec<NativeHandle>>,
    }

    impl CountingDetour {
        fn new(runtime: Arc<FakeRuntime>, refuse: Option<NativeHandle>) -> Self {
            CountingDetour { runtime, refuse: parking_lot::Mutex::new(refuse), attached: parking_lot::Mutex::default() }
        }

        fn count(&self, target: NativeHandle) -> usize {
            self.attached.lock().iter().filter(|t| **t == target).count()
        }
    }

    impl Detour for CountingDetour {
        unsafe fn attach(&self, target: NativeHandle, hook: NativeHandle) -> Result<NativeHandle> {
            self.attached.lock().push(target);
            if *self.refuse.lock() == Some(target) {
                return Err(InteropError::Hook { target, reason: "refused".to_string() });
            }
            self.runtime.attach(target, hook)
        }
    }

    #[test]
    fn test_partial_hook_install_resumes_without_reattaching() {
        let (fake, _bridge, injector) = setup();
        let targets = fake.hook_targets();
        let detour = CountingDetour::new(fake.clone(), Some(targets.generic_method_get_method));
        assert!(matches!(unsafe { injector.install_hooks(&detour, targets) }, Err(InteropError::Hook { .. })));
        assert!(matches!(unsafe { injector.install_hooks(&detour, targets) }, Err(InteropError::Hook { .. })));
        assert_eq!(detour.count(targets.class_from_type), 1);
        assert_eq!(detour.count(targets.generic_method_get_method), 2);

        *detour.refuse.lock() = None;
        unsafe { injector.install_hooks(&detour, targets) }.unwrap();
        unsafe { injector.install_hooks(&detour, targets) }.unwrap();
        assert_eq!(detour.count(targets.class_from_type), 1);
        assert_eq!(detour.count(targets.generic_method_get_method), 3);
    }

    #[test]
    fn test_concurrent_hook_installs_attach_once() {
        let (fake, _bridge, injector) = setup();
        let targets = fake.hook_targets();
        let detour = CountingDetour::new(fake.clone(), None);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| unsafe { injector.install_hooks(&detour, targets) }.unwrap());
            }
        });
        assert_eq!(detour.count(targets.class_from_type), 1);
        assert_eq!(detour.count(targets.generic_method_get_method), 1);
    }
}
