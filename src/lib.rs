//! Interop with a running IL2CPP runtime
//!
//! The crate picks the native struct layouts for the detected Unity version,
//! resolves and invokes runtime metadata through the `il2cpp_*` exports, and
//! injects types defined in Rust as native classes.

pub mod common;
pub mod config;
pub mod error;
pub mod il2cpp;
pub mod injector;
pub mod interop;
pub mod layout;
pub mod logging;
pub mod memory;
pub mod version;

#[cfg(test)]
mod fake;

pub use config::{InteropConfig, LoggingConfig};
pub use error::{InjectionError, InteropError, ManagedException, Result};
pub use il2cpp::{Il2CppApi, Il2CppBridge};
pub use injector::managed::{ManagedMethod, ManagedObject, ManagedType, TypeRef};
pub use injector::{ClassInjector, Detour, HookTargets, RegisterOptions};
pub use interop::Interop;
pub use layout::LayoutRegistry;
pub use memory::NativeHandle;
pub use version::UnityVersion;
