//! ECMA-335 attribute flags as the runtime stores them

use bitflags::bitflags;

bitflags! {
    /// `Il2CppClass::flags` (TypeAttributes)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassAttributes: u32 {
        const VISIBILITY_MASK = 0x0000_0007;
        const PUBLIC = 0x0000_0001;
        const NESTED_PUBLIC = 0x0000_0002;
        const INTERFACE = 0x0000_0020;
        const ABSTRACT = 0x0000_0080;
        const SEALED = 0x0000_0100;
        const SPECIAL_NAME = 0x0000_0400;
        const IMPORT = 0x0000_1000;
        const SERIALIZABLE = 0x0000_2000;
        const BEFORE_FIELD_INIT = 0x0010_0000;
        const RT_SPECIAL_NAME = 0x0000_0800;
        const HAS_SECURITY = 0x0004_0000;
        const _ = !0;
    }
}

bitflags! {
    /// `MethodInfo::flags` (MethodAttributes)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodAttributes: u16 {
        const MEMBER_ACCESS_MASK = 0x0007;
        const PRIVATE = 0x0001;
        const FAMILY = 0x0004;
        const PUBLIC = 0x0006;
        const STATIC = 0x0010;
        const FINAL = 0x0020;
        const VIRTUAL = 0x0040;
        const HIDE_BY_SIG = 0x0080;
        const NEW_SLOT = 0x0100;
        const ABSTRACT = 0x0400;
        const SPECIAL_NAME = 0x0800;
        const RT_SPECIAL_NAME = 0x1000;
        const _ = !0;
    }
}

bitflags! {
    /// `Il2CppType::attrs` (FieldAttributes, also used for parameters)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldAttributes: u16 {
        const FIELD_ACCESS_MASK = 0x0007;
        const PRIVATE = 0x0001;
        const PUBLIC = 0x0006;
        const STATIC = 0x0010;
        const INIT_ONLY = 0x0020;
        const LITERAL = 0x0040;
        const NOT_SERIALIZED = 0x0080;
        const HAS_DEFAULT = 0x8000;
        const _ = !0;
    }
}
