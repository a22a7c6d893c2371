//! Host-side description of types to inject
//!
//! A [`ManagedType`] is identified by the `TypeId` of a Rust marker type and
//! describes what the native class should look like: its base, bridged
//! fields, methods and constructors.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::fields::{FieldBindings, ReferenceField, StringField, ValueField};
use crate::common::{FieldAttributes, TypeCode};
use crate::error::ManagedException;
use crate::memory::NativeHandle;

/// A type as seen by injected signatures
#[derive(Clone, PartialEq, Eq)]
pub enum TypeRef {
    Void,
    /// A primitive value type
    Value(TypeCode),
    String,
    /// Method generic parameter `!!n`
    GenericParameter(u16),
    /// An existing native class; struct values travel as a pointer to their data
    Class(NativeHandle),
    /// A native class looked up by name at registration
    Named { assembly: String, namespace: String, name: String },
    /// Another injected type
    Managed(TypeId),
}

impl TypeRef {
    pub fn named(assembly: &str, namespace: &str, name: &str) -> Self {
        TypeRef::Named { assembly: assembly.to_string(), namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn managed<T: 'static>() -> Self {
        TypeRef::Managed(TypeId::of::<T>())
    }

    pub fn is_value_type(&self) -> bool {
        matches!(self, TypeRef::Value(_))
    }

    /// Whether values of this type can cross a trampoline as one register word
    pub fn fits_in_word(&self) -> bool {
        match self {
            TypeRef::Value(code) => code.is_primitive(),
            TypeRef::Void => false,
            _ => true,
        }
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Void => write!(f, "void"),
            TypeRef::Value(code) => write!(f, "{}", code),
            TypeRef::String => write!(f, "System.String"),
            TypeRef::GenericParameter(i) => write!(f, "!!{}", i),
            TypeRef::Class(class) => write!(f, "class@{}", class),
            TypeRef::Named { namespace, name, .. } if namespace.is_empty() => write!(f, "{}", name),
            TypeRef::Named { namespace, name, .. } => write!(f, "{}.{}", namespace, name),
            TypeRef::Managed(id) => write!(f, "managed {:?}", id),
        }
    }
}

/// How a bridged field is stored in the native instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// An object reference
    Reference(TypeRef),
    /// An inline value
    Value(TypeCode),
    String,
}

/// A field mirrored into the native instance
#[derive(Debug, Clone)]
pub struct ManagedField {
    pub name: String,
    pub kind: FieldKind,
    pub attributes: FieldAttributes,
}

impl ManagedField {
    pub fn reference(name: &str, ty: TypeRef) -> Self {
        Self::new(name, FieldKind::Reference(ty))
    }

    pub fn value(name: &str, code: TypeCode) -> Self {
        Self::new(name, FieldKind::Value(code))
    }

    pub fn string(name: &str) -> Self {
        Self::new(name, FieldKind::String)
    }

    fn new(name: &str, kind: FieldKind) -> Self {
        ManagedField { name: name.to_string(), kind, attributes: FieldAttributes::PUBLIC }
    }

    pub fn with_attributes(mut self, attributes: FieldAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// A value crossing the managed/native boundary
#[derive(Clone, Default)]
pub enum ManagedValue {
    #[default]
    Void,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(Option<String>),
    Object(Option<Arc<ManagedObject>>),
    /// A native reference or generic argument, passed through untouched
    Native(NativeHandle),
}

impl ManagedValue {
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ManagedValue::Int(v) => Some(v),
            ManagedValue::UInt(v) => i64::try_from(v).ok(),
            ManagedValue::Bool(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            ManagedValue::Float(v) => Some(v),
            ManagedValue::Int(v) => Some(v as f64),
            ManagedValue::UInt(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            ManagedValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ManagedValue::String(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<ManagedObject>> {
        match self {
            ManagedValue::Object(Some(o)) => Some(o),
            _ => None,
        }
    }
}

impl fmt::Debug for ManagedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagedValue::Void => write!(f, "Void"),
            ManagedValue::Bool(v) => write!(f, "Bool({})", v),
            ManagedValue::Int(v) => write!(f, "Int({})", v),
            ManagedValue::UInt(v) => write!(f, "UInt({})", v),
            ManagedValue::Float(v) => write!(f, "Float({})", v),
            ManagedValue::String(s) => write!(f, "String({:?})", s),
            ManagedValue::Object(Some(o)) => write!(f, "Object({})", o.native()),
            ManagedValue::Object(None) => write!(f, "Object(null)"),
            ManagedValue::Native(h) => write!(f, "Native({})", h),
        }
    }
}

/// Arguments of one call into an injected method
pub struct MethodCall<'a> {
    pub this: &'a Arc<ManagedObject>,
    pub args: &'a [ManagedValue],
    /// `Il2CppType*` of each generic argument of an inflated method
    pub generic_arguments: &'a [NativeHandle],
}

pub type MethodBody = Arc<dyn Fn(&MethodCall<'_>) -> Result<ManagedValue, ManagedException> + Send + Sync>;
pub type Constructor = Arc<dyn Fn(&Arc<ManagedObject>) -> Result<(), ManagedException> + Send + Sync>;
pub type InterfaceResolver = Arc<dyn Fn(&ManagedType) -> Vec<NativeHandle> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedParameter {
    pub name: String,
    pub ty: TypeRef,
}

/// A method of an injected type
#[derive(Clone)]
pub struct ManagedMethod {
    pub name: String,
    pub parameters: Vec<ManagedParameter>,
    pub return_type: TypeRef,
    pub is_static: bool,
    pub is_abstract: bool,
    /// Kept out of the native method table
    pub hidden: bool,
    pub generic_arity: u16,
    pub body: Option<MethodBody>,
}

impl ManagedMethod {
    pub fn new<F>(name: &str, return_type: TypeRef, parameters: &[(&str, TypeRef)], body: F) -> Self
    where
        F: Fn(&MethodCall<'_>) -> Result<ManagedValue, ManagedException> + Send + Sync + 'static,
    {
        ManagedMethod {
            name: name.to_string(),
            parameters: parameters
                .iter()
                .map(|(name, ty)| ManagedParameter { name: name.to_string(), ty: ty.clone() })
                .collect(),
            return_type,
            is_static: false,
            is_abstract: false,
            hidden: false,
            generic_arity: 0,
            body: Some(Arc::new(body)),
        }
    }

    /// A method without a body that subclasses must implement
    pub fn abstract_method(name: &str, return_type: TypeRef, parameters: &[(&str, TypeRef)]) -> Self {
        let mut method = Self::new(name, return_type, parameters, |_| Ok(ManagedValue::Void));
        method.is_abstract = true;
        method.body = None;
        method
    }

    pub fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn generic(mut self, arity: u16) -> Self {
        self.generic_arity = arity;
        self
    }

    pub fn is_generic(&self) -> bool {
        self.generic_arity > 0
    }

    /// `Ret Name(A, B)`, for logs
    pub fn signature(&self) -> String {
        let params: Vec<String> = self.parameters.iter().map(|p| format!("{:?}", p.ty)).collect();
        format!("{:?} {}({})", self.return_type, self.name, params.join(", "))
    }
}

impl fmt::Debug for ManagedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// What an injected type derives from
#[derive(Clone)]
pub enum BaseRef {
    /// An existing native class
    Class(NativeHandle),
    Named { assembly: String, namespace: String, name: String },
    /// Another injected type, registered first if needed
    Managed(Arc<ManagedType>),
}

/// A host type to be injected as a native class
pub struct ManagedType {
    id: TypeId,
    pub namespace: String,
    pub name: String,
    pub base: Option<BaseRef>,
    pub is_abstract: bool,
    pub is_generic_definition: bool,
    pub fields: Vec<ManagedField>,
    pub methods: Vec<ManagedMethod>,
    pub interfaces: Vec<NativeHandle>,
    /// Runs for objects constructed by the runtime
    pub constructor: Option<Constructor>,
    /// Takes precedence over `constructor`; receives an already wrapped object
    pub native_constructor: Option<Constructor>,
}

impl ManagedType {
    pub fn builder<T: 'static>(namespace: &str, name: &str) -> ManagedTypeBuilder {
        ManagedTypeBuilder {
            ty: ManagedType {
                id: TypeId::of::<T>(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                base: None,
                is_abstract: false,
                is_generic_definition: false,
                fields: Vec::new(),
                methods: Vec::new(),
                interfaces: Vec::new(),
                constructor: None,
                native_constructor: None,
            },
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

impl fmt::Debug for ManagedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedType")
            .field("name", &self.full_name())
            .field("fields", &self.fields.len())
            .field("methods", &self.methods.len())
            .finish()
    }
}

pub struct ManagedTypeBuilder {
    ty: ManagedType,
}

impl ManagedTypeBuilder {
    pub fn base_class(mut self, class: NativeHandle) -> Self {
        self.ty.base = Some(BaseRef::Class(class));
        self
    }

    pub fn base_named(mut self, assembly: &str, namespace: &str, name: &str) -> Self {
        self.ty.base = Some(BaseRef::Named {
            assembly: assembly.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn extends(mut self, base: Arc<ManagedType>) -> Self {
        self.ty.base = Some(BaseRef::Managed(base));
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.ty.is_abstract = true;
        self
    }

    pub fn generic_definition(mut self) -> Self {
        self.ty.is_generic_definition = true;
        self
    }

    pub fn field(mut self, field: ManagedField) -> Self {
        self.ty.fields.push(field);
        self
    }

    pub fn method(mut self, method: ManagedMethod) -> Self {
        self.ty.methods.push(method);
        self
    }

    pub fn interface(mut self, interface: NativeHandle) -> Self {
        self.ty.interfaces.push(interface);
        self
    }

    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<ManagedObject>) -> Result<(), ManagedException> + Send + Sync + 'static,
    {
        self.ty.constructor = Some(Arc::new(f));
        self
    }

    pub fn native_constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<ManagedObject>) -> Result<(), ManagedException> + Send + Sync + 'static,
    {
        self.ty.native_constructor = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Arc<ManagedType> {
        Arc::new(self.ty)
    }
}

/// The managed counterpart of a native instance of an injected class
pub struct ManagedObject {
    ty: Arc<ManagedType>,
    native: AtomicUsize,
    wrapped: AtomicBool,
    bindings: OnceCell<Arc<FieldBindings>>,
    state: Mutex<Option<Box<dyn Any + Send>>>,
}

impl ManagedObject {
    pub(crate) fn new(ty: Arc<ManagedType>, native: NativeHandle) -> Self {
        ManagedObject {
            ty,
            native: AtomicUsize::new(native.addr()),
            wrapped: AtomicBool::new(false),
            bindings: OnceCell::new(),
            state: Mutex::new(None),
        }
    }

    pub fn managed_type(&self) -> &Arc<ManagedType> {
        &self.ty
    }

    /// The native instance
    pub fn native(&self) -> NativeHandle {
        NativeHandle::from_addr(self.native.load(Ordering::Acquire))
    }

    /// Created around an existing native object rather than by the runtime's constructor
    pub fn is_wrapped(&self) -> bool {
        self.wrapped.load(Ordering::Acquire)
    }

    pub(crate) fn set_wrapped(&self, wrapped: bool) {
        self.wrapped.store(wrapped, Ordering::Release)
    }

    pub(crate) fn bind_fields(&self, bindings: Arc<FieldBindings>) {
        let _ = self.bindings.set(bindings);
    }

    pub fn reference_field(&self, name: &str) -> Option<ReferenceField> {
        self.bindings.get()?.reference(self.native(), name)
    }

    pub fn value_field<T: Copy>(&self, name: &str) -> Option<ValueField<T>> {
        self.bindings.get()?.value(self.native(), name)
    }

    pub fn string_field(&self, name: &str) -> Option<StringField> {
        self.bindings.get()?.string(self.native(), name)
    }

    /// Replace the host-side state attached to this object
    pub fn set_state<S: Any + Send>(&self, state: S) {
        *self.state.lock() = Some(Box::new(state));
    }

    /// Run `f` on the attached state if it is an `S`
    pub fn with_state<S: Any + Send, R>(&self, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        let mut guard = self.state.lock();
        guard.as_mut().and_then(|state| state.downcast_mut::<S>()).map(f)
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedObject")
            .field("type", &self.ty.full_name())
            .field("native", &self.native())
            .field("wrapped", &self.is_wrapped())
            .finish()
    }
}
