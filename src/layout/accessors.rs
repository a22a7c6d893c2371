// Accessor generators for struct wrappers holding `raw: Raw` and
// `layout: &'static <Kind>Layout`.

/// Pointer-sized fields every lineage of the kind has
macro_rules! handle_fields {
    ($($(#[$doc:meta])* $get:ident, $set:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(&self) -> crate::memory::NativeHandle {
                self.raw.handle(self.layout.$field)
            }

            pub fn $set(&self, value: crate::memory::NativeHandle) {
                self.raw.set_handle(self.layout.$field, value)
            }
        )*
    };
}

/// Plain scalar fields every lineage of the kind has
macro_rules! value_fields {
    ($($(#[$doc:meta])* $get:ident, $set:ident: $ty:ty => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(&self) -> $ty {
                self.raw.get::<$ty>(self.layout.$field)
            }

            pub fn $set(&self, value: $ty) {
                self.raw.set::<$ty>(self.layout.$field, value)
            }
        )*
    };
}

/// Scalar fields only some lineages have; setters report whether they wrote
macro_rules! optional_value_fields {
    ($($(#[$doc:meta])* $get:ident, $set:ident: $ty:ty => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(&self) -> Option<$ty> {
                self.layout.$field.map(|offset| self.raw.get::<$ty>(offset))
            }

            pub fn $set(&self, value: $ty) -> bool {
                match self.layout.$field {
                    Some(offset) => {
                        self.raw.set::<$ty>(offset, value);
                        true
                    }
                    None => false,
                }
            }
        )*
    };
}

/// Pointer-sized fields only some lineages have
macro_rules! optional_handle_fields {
    ($($(#[$doc:meta])* $get:ident, $set:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(&self) -> Option<crate::memory::NativeHandle> {
                self.layout.$field.map(|offset| self.raw.handle(offset))
            }

            pub fn $set(&self, value: crate::memory::NativeHandle) -> bool {
                match self.layout.$field {
                    Some(offset) => {
                        self.raw.set_handle(offset, value);
                        true
                    }
                    None => false,
                }
            }
        )*
    };
}

/// Booleans packed into bitfield bytes
macro_rules! bit_fields {
    ($($(#[$doc:meta])* $get:ident, $set:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(&self) -> bool {
                self.layout.$field.get(self.raw.ptr())
            }

            pub fn $set(&self, value: bool) {
                self.layout.$field.set(self.raw.ptr(), value)
            }
        )*
    };
}

/// Booleans only some lineages pack
macro_rules! optional_bit_fields {
    ($($(#[$doc:meta])* $get:ident, $set:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(&self) -> Option<bool> {
                self.layout.$field.map(|slot| slot.get(self.raw.ptr()))
            }

            pub fn $set(&self, value: bool) -> bool {
                match self.layout.$field {
                    Some(slot) => {
                        slot.set(self.raw.ptr(), value);
                        true
                    }
                    None => false,
                }
            }
        )*
    };
}

/// `LayoutDescriptor` impl plus the common wrapper methods
macro_rules! layout_descriptor {
    ($layout:ident, $wrapper:ident, $kind:expr) => {
        impl crate::layout::LayoutDescriptor for $layout {
            const KIND: crate::layout::StructKind = $kind;

            fn label(&self) -> &'static str {
                self.label
            }

            fn since(&self) -> crate::version::UnityVersion {
                self.since
            }

            fn size(&self) -> usize {
                self.size as usize
            }
        }

        impl $wrapper {
            /// Address of the wrapped struct
            pub fn ptr(&self) -> crate::memory::NativeHandle {
                self.raw.ptr()
            }

            /// The layout captured when this struct was wrapped
            pub fn layout(&self) -> &'static $layout {
                self.layout
            }
        }

        impl std::fmt::Debug for $wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($wrapper))
                    .field("ptr", &self.raw.ptr())
                    .field("layout", &self.layout.label)
                    .finish()
            }
        }
    };
}
