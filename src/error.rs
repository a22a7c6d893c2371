//! Error types for the interop layer
//!
//! Lookup misses are not errors here: they are logged and answered with a null
//! handle or the missing-method sentinel. Only configuration problems and
//! registration-time rejections surface as `Err`.

use crate::layout::StructKind;
use crate::memory::NativeHandle;
use crate::version::UnityVersion;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, InteropError>;

/// Top-level error for the interop layer
#[derive(Debug, Error)]
pub enum InteropError {
    /// No struct layout is known for this runtime version
    #[error("no {kind} layout applies to unity {version}; the runtime is older than every supported layout")]
    UnsupportedVersion { kind: StructKind, version: UnityVersion },

    /// A version string could not be parsed
    #[error("invalid unity version string `{0}`")]
    InvalidVersion(String),

    /// The version was neither configured nor detectable
    #[error("unity version is not configured and could not be detected")]
    VersionUnknown,

    /// The native runtime library could not be opened
    #[error("failed to load `{path}`: {reason}")]
    Library { path: PathBuf, reason: String },

    /// A required native entry point is not exported
    #[error("native export `{0}` is unavailable")]
    MissingExport(&'static str),

    /// An internal call was resolved lazily and is now being used
    #[error("ICall with signature {0} was not resolved")]
    UnresolvedICall(String),

    /// The configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A runtime function could not be intercepted
    #[error("failed to hook {target}: {reason}")]
    Hook { target: NativeHandle, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Injection(#[from] InjectionError),
}

/// Reasons a managed type cannot be injected into the native runtime
///
/// Every variant is raised before any native memory is touched for the
/// offending type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InjectionError {
    #[error("layout {layout} does not describe enough of the runtime to inject {ty}")]
    IncompleteLayout { ty: String, layout: &'static str },

    #[error("type {0} is a generic type definition and can't be injected")]
    GenericType(String),

    #[error("base type of {0} has no native counterpart")]
    NoNativeBase(String),

    #[error("base class {base} of {ty} is a value type")]
    ValueTypeBase { ty: String, base: String },

    #[error("base class {base} of {ty} is generic")]
    GenericBase { ty: String, base: String },

    #[error("base class {base} of {ty} is sealed")]
    SealedBase { ty: String, base: String },

    #[error("base class {base} of {ty} is an interface")]
    InterfaceBase { ty: String, base: String },

    #[error("type {0} is used as an interface but is not one")]
    NotAnInterface(String),

    #[error("a different type named {0} is already registered")]
    DuplicateName(String),

    #[error("type {ty} of field {field} has no native class")]
    UnknownFieldType { field: String, ty: String },

    #[error("{0} has no native class and can't be used by injected members")]
    UnresolvedType(String),

    #[error("type {ty} does not implement abstract method {method}")]
    MissingVtableImplementation { ty: String, method: String },

    #[error("vtable slot {slot} of {ty} is still empty after injection")]
    NullVtableSlot { ty: String, slot: usize },
}

/// Failure raised by an injected method body
///
/// Never crosses into native code: the trampoline logs it and returns zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ManagedException(pub String);

impl From<&str> for ManagedException {
    fn from(message: &str) -> Self {
        ManagedException(message.to_string())
    }
}

impl From<String> for ManagedException {
    fn from(message: String) -> Self {
        ManagedException(message)
    }
}
