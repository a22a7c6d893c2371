//! Runtime metadata vocabulary shared by the layouts, the bridge and the injector

pub mod flags;
pub mod type_code;

pub use flags::{ClassAttributes, FieldAttributes, MethodAttributes};
pub use type_code::TypeCode;
