//! Element type codes stored in `Il2CppType::type`

use core::fmt;

/// The `Il2CppTypeEnum` element type of a native type descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    END = 0x00,
    VOID = 0x01,
    BOOLEAN = 0x02,
    CHAR = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0a,
    U8 = 0x0b,
    R4 = 0x0c,
    R8 = 0x0d,
    STRING = 0x0e,
    PTR = 0x0f,
    BYREF = 0x10,
    VALUETYPE = 0x11,
    CLASS = 0x12,
    VAR = 0x13,
    ARRAY = 0x14,
    GENERICINST = 0x15,
    TYPEDBYREF = 0x16,
    I = 0x18,
    U = 0x19,
    FNPTR = 0x1b,
    OBJECT = 0x1c,
    SZARRAY = 0x1d,
    MVAR = 0x1e,
    CMODREQD = 0x1f,
    CMODOPT = 0x20,
    INTERNAL = 0x21,
    MODIFIER = 0x40,
    SENTINEL = 0x41,
    PINNED = 0x45,
    ENUM = 0x55,
}

impl TypeCode {
    /// Convert a raw element type byte; unknown values map to `END`
    pub fn from_raw(value: u8) -> TypeCode {
        match value {
            0x01 => TypeCode::VOID,
            0x02 => TypeCode::BOOLEAN,
            0x03 => TypeCode::CHAR,
            0x04 => TypeCode::I1,
            0x05 => TypeCode::U1,
            0x06 => TypeCode::I2,
            0x07 => TypeCode::U2,
            0x08 => TypeCode::I4,
            0x09 => TypeCode::U4,
            0x0a => TypeCode::I8,
            0x0b => TypeCode::U8,
            0x0c => TypeCode::R4,
            0x0d => TypeCode::R8,
            0x0e => TypeCode::STRING,
            0x0f => TypeCode::PTR,
            0x10 => TypeCode::BYREF,
            0x11 => TypeCode::VALUETYPE,
            0x12 => TypeCode::CLASS,
            0x13 => TypeCode::VAR,
            0x14 => TypeCode::ARRAY,
            0x15 => TypeCode::GENERICINST,
            0x16 => TypeCode::TYPEDBYREF,
            0x18 => TypeCode::I,
            0x19 => TypeCode::U,
            0x1b => TypeCode::FNPTR,
            0x1c => TypeCode::OBJECT,
            0x1d => TypeCode::SZARRAY,
            0x1e => TypeCode::MVAR,
            0x1f => TypeCode::CMODREQD,
            0x20 => TypeCode::CMODOPT,
            0x21 => TypeCode::INTERNAL,
            0x40 => TypeCode::MODIFIER,
            0x41 => TypeCode::SENTINEL,
            0x45 => TypeCode::PINNED,
            0x55 => TypeCode::ENUM,
            _ => TypeCode::END,
        }
    }

    /// Size in bytes of an unboxed value of this type, 0 when it depends on the class
    pub fn size(&self) -> usize {
        match self {
            TypeCode::BOOLEAN | TypeCode::I1 | TypeCode::U1 => 1,
            TypeCode::CHAR | TypeCode::I2 | TypeCode::U2 => 2,
            TypeCode::I4 | TypeCode::U4 | TypeCode::R4 => 4,
            TypeCode::I8 | TypeCode::U8 | TypeCode::R8 => 8,
            TypeCode::PTR
            | TypeCode::BYREF
            | TypeCode::CLASS
            | TypeCode::OBJECT
            | TypeCode::STRING
            | TypeCode::SZARRAY
            | TypeCode::ARRAY
            | TypeCode::FNPTR
            | TypeCode::I
            | TypeCode::U => 8,
            _ => 0,
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            TypeCode::BOOLEAN
                | TypeCode::CHAR
                | TypeCode::I1
                | TypeCode::U1
                | TypeCode::I2
                | TypeCode::U2
                | TypeCode::I4
                | TypeCode::U4
                | TypeCode::I8
                | TypeCode::U8
                | TypeCode::R4
                | TypeCode::R8
                | TypeCode::I
                | TypeCode::U
        )
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, TypeCode::R4 | TypeCode::R8)
    }

    /// Whether values of this type are passed as object pointers
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            TypeCode::CLASS
                | TypeCode::OBJECT
                | TypeCode::SZARRAY
                | TypeCode::ARRAY
                | TypeCode::STRING
                | TypeCode::GENERICINST
        )
    }

    /// The corlib type this element type stands for, if it is a builtin
    pub fn system_name(&self) -> Option<&'static str> {
        Some(match self {
            TypeCode::VOID => "System.Void",
            TypeCode::BOOLEAN => "System.Boolean",
            TypeCode::CHAR => "System.Char",
            TypeCode::I1 => "System.SByte",
            TypeCode::U1 => "System.Byte",
            TypeCode::I2 => "System.Int16",
            TypeCode::U2 => "System.UInt16",
            TypeCode::I4 => "System.Int32",
            TypeCode::U4 => "System.UInt32",
            TypeCode::I8 => "System.Int64",
            TypeCode::U8 => "System.UInt64",
            TypeCode::R4 => "System.Single",
            TypeCode::R8 => "System.Double",
            TypeCode::STRING => "System.String",
            TypeCode::I => "System.IntPtr",
            TypeCode::U => "System.UIntPtr",
            TypeCode::OBJECT => "System.Object",
            _ => return None,
        })
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.system_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:?}", self),
        }
    }
}
