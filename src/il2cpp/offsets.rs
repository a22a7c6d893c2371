//! Offsets of runtime objects that do not vary between Unity versions
//!
//! Object headers, strings, arrays and the generic-method records keep the
//! same shape on every supported 64-bit runtime; the version-specific metadata
//! structs live in [`crate::layout`].

/// Name of the IL2CPP library on different platforms
#[cfg(target_os = "windows")]
pub const IL2CPP_LIBRARY: &str = "GameAssembly.dll";

#[cfg(target_os = "linux")]
pub const IL2CPP_LIBRARY: &str = "GameAssembly.so";

#[cfg(target_os = "macos")]
pub const IL2CPP_LIBRARY: &str = "GameAssembly.dylib";

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
pub const IL2CPP_LIBRARY: &str = "GameAssembly";

/// Module whose base the icall offset table is relative to
#[cfg(target_os = "windows")]
pub const UNITY_PLAYER_LIBRARY: &str = "UnityPlayer.dll";

#[cfg(target_os = "linux")]
pub const UNITY_PLAYER_LIBRARY: &str = "UnityPlayer.so";

#[cfg(target_os = "macos")]
pub const UNITY_PLAYER_LIBRARY: &str = "UnityPlayer.dylib";

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
pub const UNITY_PLAYER_LIBRARY: &str = "UnityPlayer";

// Il2CppObject
/// `klass` pointer
pub const OBJECT_CLASS: usize = 0x0;
/// `monitor` pointer
pub const OBJECT_MONITOR: usize = 0x8;
/// Size of the object header; unboxed data starts here
pub const OBJECT_HEADER_SIZE: usize = 0x10;

// Il2CppString
pub const STRING_LENGTH: usize = 0x10;
/// UTF-16 characters, not NUL-terminated
pub const STRING_CHARS: usize = 0x14;

// Il2CppArray
pub const ARRAY_BOUNDS: usize = 0x10;
pub const ARRAY_LENGTH: usize = 0x18;
pub const ARRAY_ELEMENTS: usize = 0x20;

// Il2CppDelegate, before 2021.2
pub const DELEGATE_METHOD_PTR: usize = 0x10;
pub const DELEGATE_INVOKE_IMPL: usize = 0x18;
pub const DELEGATE_TARGET: usize = 0x20;
pub const DELEGATE_METHOD: usize = 0x28;

// Il2CppGenericMethod
/// Open `MethodInfo*`
pub const GENERIC_METHOD_DEFINITION: usize = 0x0;
/// `context.class_inst`
pub const GENERIC_METHOD_CLASS_INST: usize = 0x8;
/// `context.method_inst`
pub const GENERIC_METHOD_METHOD_INST: usize = 0x10;

// Il2CppGenericInst
pub const GENERIC_INST_ARGC: usize = 0x0;
pub const GENERIC_INST_ARGV: usize = 0x8;
