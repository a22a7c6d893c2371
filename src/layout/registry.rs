//! Layout selection and the uniform struct access facade
//!
//! [`LayoutRegistry`] owns the catalog of every known layout and the set that
//! is active for the detected runtime version. All structural access in the
//! crate goes through its `new_*` / `wrap_*` / `*_size` methods; callers never
//! name a concrete lineage.

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::{
    assembly, class, event, exception, field, image, method, parameter, property, select, sort_descending, types,
    AssemblyLayout, AssemblyNameLayout, AssemblyNameStruct, AssemblyStruct, ClassLayout, ClassStruct, EventLayout,
    EventStruct, ExceptionLayout, ExceptionStruct, FieldLayout, FieldStruct, ImageLayout, ImageStruct,
    LayoutDescriptor, MethodLayout, MethodStruct, ParameterLayout, ParameterStruct, PropertyLayout, PropertyStruct,
    StructKind, TypeLayout, TypeStruct,
};
use crate::error::{InteropError, Result};
use crate::memory::{self, NativeHandle};
use crate::version::UnityVersion;

/// First version whose delegates must be built through their constructor
pub const DELEGATE_CONSTRUCTOR_VERSION: UnityVersion = UnityVersion::new(2021, 2, 0);

/// Every known layout, grouped per kind and sorted newest first
#[derive(Debug, Clone)]
pub struct LayoutCatalog {
    pub classes: Vec<&'static ClassLayout>,
    pub methods: Vec<&'static MethodLayout>,
    pub fields: Vec<&'static FieldLayout>,
    pub images: Vec<&'static ImageLayout>,
    pub types: Vec<&'static TypeLayout>,
    pub assemblies: Vec<&'static AssemblyLayout>,
    pub assembly_names: Vec<&'static AssemblyNameLayout>,
    pub exceptions: Vec<&'static ExceptionLayout>,
    pub events: Vec<&'static EventLayout>,
    pub properties: Vec<&'static PropertyLayout>,
    pub parameters: Vec<&'static ParameterLayout>,
}

fn sorted<L: LayoutDescriptor>(layouts: &[&'static L]) -> Vec<&'static L> {
    let mut layouts = layouts.to_vec();
    sort_descending(&mut layouts);
    layouts
}

fn pick<L: LayoutDescriptor>(candidates: &[&'static L], version: UnityVersion) -> Result<&'static L> {
    let layout = select(candidates, version).ok_or(InteropError::UnsupportedVersion { kind: L::KIND, version })?;
    debug!("using {} for {}", layout.label(), L::KIND);
    Ok(layout)
}

impl LayoutCatalog {
    /// The layouts compiled into this crate
    pub fn builtin() -> Self {
        LayoutCatalog {
            classes: sorted(&class::LAYOUTS),
            methods: sorted(&method::LAYOUTS),
            fields: sorted(&field::LAYOUTS),
            images: sorted(&image::LAYOUTS),
            types: sorted(&types::LAYOUTS),
            assemblies: sorted(&assembly::LAYOUTS),
            assembly_names: sorted(&assembly::NAME_LAYOUTS),
            exceptions: sorted(&exception::LAYOUTS),
            events: sorted(&event::LAYOUTS),
            properties: sorted(&property::LAYOUTS),
            parameters: sorted(&parameter::LAYOUTS),
        }
    }

    /// Versions known for `kind`, newest first
    pub fn versions(&self, kind: StructKind) -> Vec<UnityVersion> {
        fn tags<L: LayoutDescriptor>(layouts: &[&'static L]) -> Vec<UnityVersion> {
            layouts.iter().map(|l| l.since()).collect()
        }
        match kind {
            StructKind::Class => tags(&self.classes),
            StructKind::MethodInfo => tags(&self.methods),
            StructKind::FieldInfo => tags(&self.fields),
            StructKind::Image => tags(&self.images),
            StructKind::Type => tags(&self.types),
            StructKind::Assembly => tags(&self.assemblies),
            StructKind::AssemblyName => tags(&self.assembly_names),
            StructKind::Exception => tags(&self.exceptions),
            StructKind::EventInfo => tags(&self.events),
            StructKind::PropertyInfo => tags(&self.properties),
            StructKind::ParameterInfo => tags(&self.parameters),
        }
    }

    /// The `since` of the layout `kind` would use at `version`
    pub fn selected_version(&self, kind: StructKind, version: UnityVersion) -> Option<UnityVersion> {
        self.versions(kind).into_iter().find(|since| *since <= version)
    }

    /// Resolve one layout per kind for `version`
    pub fn resolve(&self, version: UnityVersion) -> Result<ActiveLayouts> {
        Ok(ActiveLayouts {
            version,
            class: pick(&self.classes, version)?,
            method: pick(&self.methods, version)?,
            field: pick(&self.fields, version)?,
            image: pick(&self.images, version)?,
            ty: pick(&self.types, version)?,
            assembly: pick(&self.assemblies, version)?,
            assembly_name: pick(&self.assembly_names, version)?,
            exception: pick(&self.exceptions, version)?,
            event: pick(&self.events, version)?,
            property: pick(&self.properties, version)?,
            parameter: pick(&self.parameters, version)?,
        })
    }
}

/// The layout chosen for every kind at one runtime version
#[derive(Debug, Clone, Copy)]
pub struct ActiveLayouts {
    pub version: UnityVersion,
    pub class: &'static ClassLayout,
    pub method: &'static MethodLayout,
    pub field: &'static FieldLayout,
    pub image: &'static ImageLayout,
    pub ty: &'static TypeLayout,
    pub assembly: &'static AssemblyLayout,
    pub assembly_name: &'static AssemblyNameLayout,
    pub exception: &'static ExceptionLayout,
    pub event: &'static EventLayout,
    pub property: &'static PropertyLayout,
    pub parameter: &'static ParameterLayout,
}

impl ActiveLayouts {
    /// Delegates must be created by running their two-argument constructor
    pub fn must_use_delegate_constructor(&self) -> bool {
        self.version >= DELEGATE_CONSTRUCTOR_VERSION
    }

    /// Lineage labels per kind, for diagnostics
    pub fn report(&self) -> LayoutReport {
        LayoutReport {
            version: self.version,
            layouts: vec![
                (StructKind::Class, self.class.label),
                (StructKind::MethodInfo, self.method.label),
                (StructKind::FieldInfo, self.field.label),
                (StructKind::Image, self.image.label),
                (StructKind::Type, self.ty.label),
                (StructKind::Assembly, self.assembly.label),
                (StructKind::AssemblyName, self.assembly_name.label),
                (StructKind::Exception, self.exception.label),
                (StructKind::EventInfo, self.event.label),
                (StructKind::PropertyInfo, self.property.label),
                (StructKind::ParameterInfo, self.parameter.label),
            ],
        }
    }

    fn same_set(&self, other: &ActiveLayouts) -> bool {
        self.version == other.version
            && std::ptr::eq(self.class, other.class)
            && std::ptr::eq(self.method, other.method)
            && std::ptr::eq(self.field, other.field)
            && std::ptr::eq(self.image, other.image)
            && std::ptr::eq(self.ty, other.ty)
            && std::ptr::eq(self.assembly, other.assembly)
            && std::ptr::eq(self.assembly_name, other.assembly_name)
            && std::ptr::eq(self.exception, other.exception)
            && std::ptr::eq(self.event, other.event)
            && std::ptr::eq(self.property, other.property)
            && std::ptr::eq(self.parameter, other.parameter)
    }
}

impl PartialEq for ActiveLayouts {
    fn eq(&self, other: &Self) -> bool {
        self.same_set(other)
    }
}

/// Serializable summary of the active layouts
#[derive(Debug, Clone, Serialize)]
pub struct LayoutReport {
    pub version: UnityVersion,
    pub layouts: Vec<(StructKind, &'static str)>,
}

/// Owns the layout catalog and the active layout set
///
/// Construction requires a version, so a registry can never be read before a
/// layout set is chosen. [`LayoutRegistry::initialize`] may be called again to
/// switch versions; it should happen before concurrent structural access
/// starts, and wrappers created earlier keep the layouts they captured.
pub struct LayoutRegistry {
    catalog: LayoutCatalog,
    active: RwLock<ActiveLayouts>,
}

impl std::fmt::Debug for LayoutRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutRegistry").field("version", &self.version()).finish()
    }
}

impl LayoutRegistry {
    /// Registry over the built-in layouts, initialized for `version`
    pub fn new(version: UnityVersion) -> Result<Self> {
        Self::with_catalog(LayoutCatalog::builtin(), version)
    }

    pub fn with_catalog(catalog: LayoutCatalog, version: UnityVersion) -> Result<Self> {
        let active = catalog.resolve(version)?;
        info!("struct layouts selected for unity {}", version);
        Ok(LayoutRegistry { catalog, active: RwLock::new(active) })
    }

    /// Re-select every kind for `version`
    ///
    /// Replaces the whole active set or, on error, nothing.
    pub fn initialize(&self, version: UnityVersion) -> Result<ActiveLayouts> {
        let resolved = self.catalog.resolve(version)?;
        *self.active.write() = resolved;
        info!("struct layouts selected for unity {}", version);
        Ok(resolved)
    }

    pub fn catalog(&self) -> &LayoutCatalog {
        &self.catalog
    }

    /// Snapshot of the active layouts
    pub fn active(&self) -> ActiveLayouts {
        *self.active.read()
    }

    pub fn version(&self) -> UnityVersion {
        self.active.read().version
    }

    pub fn must_use_delegate_constructor(&self) -> bool {
        self.active().must_use_delegate_constructor()
    }

    pub fn has_name_no_ext(&self) -> bool {
        self.active().image.name_no_ext.is_some()
    }

    pub fn parameter_has_name_position_token(&self) -> bool {
        self.active().parameter.has_name_position_token()
    }

    // Class

    pub fn class_size(&self) -> usize {
        self.active().class.size as usize
    }

    /// A zeroed class with room for `vtable_slots` trailing vtable entries
    pub fn new_class(&self, vtable_slots: usize) -> ClassStruct {
        let active = self.active();
        let ptr = memory::alloc_zeroed(ClassStruct::allocation_size(active.class, vtable_slots));
        ClassStruct::new(ptr, active.class, active.ty)
    }

    /// View `ptr` as a class; `None` for null
    ///
    /// # Safety
    /// A non-null `ptr` must point to a live `Il2CppClass` of the active layout.
    pub unsafe fn wrap_class(&self, ptr: NativeHandle) -> Option<ClassStruct> {
        let active = self.active();
        ptr.non_null().map(|p| ClassStruct::new(p, active.class, active.ty))
    }

    // MethodInfo

    pub fn method_size(&self) -> usize {
        self.active().method.size as usize
    }

    pub fn new_method(&self) -> MethodStruct {
        let layout = self.active().method;
        MethodStruct::new(memory::alloc_zeroed(layout.size as usize), layout)
    }

    /// # Safety
    /// A non-null `ptr` must point to a live `MethodInfo` of the active layout.
    pub unsafe fn wrap_method(&self, ptr: NativeHandle) -> Option<MethodStruct> {
        let layout = self.active().method;
        ptr.non_null().map(|p| MethodStruct::new(p, layout))
    }

    // FieldInfo

    pub fn field_size(&self) -> usize {
        self.active().field.size as usize
    }

    pub fn new_field(&self) -> FieldStruct {
        let layout = self.active().field;
        FieldStruct::new(memory::alloc_zeroed(layout.size as usize), layout)
    }

    /// A zeroed, contiguous `FieldInfo` array
    pub fn new_field_array(&self, count: usize) -> NativeHandle {
        memory::alloc_array(count, self.field_size())
    }

    /// # Safety
    /// A non-null `ptr` must point to a live `FieldInfo` of the active layout.
    pub unsafe fn wrap_field(&self, ptr: NativeHandle) -> Option<FieldStruct> {
        let layout = self.active().field;
        ptr.non_null().map(|p| FieldStruct::new(p, layout))
    }

    /// Element `index` of a contiguous `FieldInfo` array
    ///
    /// # Safety
    /// `base` must hold more than `index` fields of the active layout.
    pub unsafe fn wrap_field_at(&self, base: NativeHandle, index: usize) -> Option<FieldStruct> {
        let layout = self.active().field;
        base.non_null().map(|p| FieldStruct::new(p.add(index * layout.size as usize), layout))
    }

    // Image

    pub fn image_size(&self) -> usize {
        self.active().image.size as usize
    }

    pub fn new_image(&self) -> ImageStruct {
        let layout = self.active().image;
        ImageStruct::new(memory::alloc_zeroed(layout.size as usize), layout)
    }

    /// # Safety
    /// A non-null `ptr` must point to a live `Il2CppImage` of the active layout.
    pub unsafe fn wrap_image(&self, ptr: NativeHandle) -> Option<ImageStruct> {
        let layout = self.active().image;
        ptr.non_null().map(|p| ImageStruct::new(p, layout))
    }

    // Type

    pub fn type_size(&self) -> usize {
        self.active().ty.size as usize
    }

    pub fn new_type(&self) -> TypeStruct {
        let layout = self.active().ty;
        TypeStruct::new(memory::alloc_zeroed(layout.size as usize), layout)
    }

    /// # Safety
    /// A non-null `ptr` must point to a live `Il2CppType` of the active layout.
    pub unsafe fn wrap_type(&self, ptr: NativeHandle) -> Option<TypeStruct> {
        let layout = self.active().ty;
        ptr.non_null().map(|p| TypeStruct::new(p, layout))
    }

    // Assembly

    pub fn assembly_size(&self) -> usize {
        self.active().assembly.size as usize
    }

    pub fn new_assembly(&self) -> AssemblyStruct {
        let active = self.active();
        AssemblyStruct::new(memory::alloc_zeroed(active.assembly.size as usize), active.assembly, active.assembly_name)
    }

    /// # Safety
    /// A non-null `ptr` must point to a live `Il2CppAssembly` of the active layout.
    pub unsafe fn wrap_assembly(&self, ptr: NativeHandle) -> Option<AssemblyStruct> {
        let active = self.active();
        ptr.non_null().map(|p| AssemblyStruct::new(p, active.assembly, active.assembly_name))
    }

    // AssemblyName

    pub fn assembly_name_size(&self) -> usize {
        self.active().assembly_name.size as usize
    }

    pub fn new_assembly_name(&self) -> AssemblyNameStruct {
        let layout = self.active().assembly_name;
        AssemblyNameStruct::new(memory::alloc_zeroed(layout.size as usize), layout)
    }

    /// # Safety
    /// A non-null `ptr` must point to a live `Il2CppAssemblyName` of the active layout.
    pub unsafe fn wrap_assembly_name(&self, ptr: NativeHandle) -> Option<AssemblyNameStruct> {
        let layout = self.active().assembly_name;
        ptr.non_null().map(|p| AssemblyNameStruct::new(p, layout))
    }

    // Exception

    pub fn exception_size(&self) -> usize {
        self.active().exception.size as usize
    }

    pub fn new_exception(&self) -> ExceptionStruct {
        let layout = self.active().exception;
        ExceptionStruct::new(memory::alloc_zeroed(layout.size as usize), layout)
    }

    /// # Safety
    /// A non-null `ptr` must point to a live `Il2CppException` of the active layout.
    pub unsafe fn wrap_exception(&self, ptr: NativeHandle) -> Option<ExceptionStruct> {
        let layout = self.active().exception;
        ptr.non_null().map(|p| ExceptionStruct::new(p, layout))
    }

    // EventInfo

    pub fn event_size(&self) -> usize {
        self.active().event.size as usize
    }

    pub fn new_event(&self) -> EventStruct {
        let layout = self.active().event;
        EventStruct::new(memory::alloc_zeroed(layout.size as usize), layout)
    }

    /// # Safety
    /// A non-null `ptr` must point to a live `EventInfo` of the active layout.
    pub unsafe fn wrap_event(&self, ptr: NativeHandle) -> Option<EventStruct> {
        let layout = self.active().event;
        ptr.non_null().map(|p| EventStruct::new(p, layout))
    }

    // PropertyInfo

    pub fn property_size(&self) -> usize {
        self.active().property.size as usize
    }

    pub fn new_property(&self) -> PropertyStruct {
        let layout = self.active().property;
        PropertyStruct::new(memory::alloc_zeroed(layout.size as usize), layout)
    }

    /// # Safety
    /// A non-null `ptr` must point to a live `PropertyInfo` of the active layout.
    pub unsafe fn wrap_property(&self, ptr: NativeHandle) -> Option<PropertyStruct> {
        let layout = self.active().property;
        ptr.non_null().map(|p| PropertyStruct::new(p, layout))
    }

    // ParameterInfo

    pub fn parameter_size(&self) -> usize {
        self.active().parameter.size as usize
    }

    /// A zeroed, contiguous parameter array
    pub fn new_parameter_array(&self, count: usize) -> NativeHandle {
        memory::alloc_array(count, self.parameter_size())
    }

    /// Element `index` of a contiguous parameter array
    ///
    /// # Safety
    /// `base` must hold more than `index` parameters of the active layout.
    pub unsafe fn wrap_parameter_at(&self, base: NativeHandle, index: usize) -> Option<ParameterStruct> {
        let layout = self.active().parameter;
        base.non_null().map(|p| ParameterStruct::new(p.add(index * layout.size as usize), layout))
    }
}
