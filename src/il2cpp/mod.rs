//! The native runtime boundary
//!
//! [`Il2CppApi`] is the call surface, [`ExportTable`] binds it to the game
//! library, and [`Il2CppBridge`] builds name and signature resolution,
//! invocation and marshaling on top of it.

pub mod api;
pub mod bridge;
#[cfg(feature = "exports")]
pub mod exports;
pub mod icall;
pub mod offsets;

pub use api::{ClassFromTypeFn, GenericMethodGetMethodFn, Il2CppApi, InvokerFn};
pub use bridge::{normalize_type_name, Argument, ArrayView, Il2CppBridge, Invocation};
#[cfg(feature = "exports")]
pub use exports::ExportTable;
pub use icall::{fnv1a, ICall, IcallTable};
