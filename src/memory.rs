//! In-process memory primitives
//!
//! Everything that touches native runtime memory goes through these helpers.
//! Blocks handed out by [`alloc_zeroed`] are never freed: the runtime has no
//! way to unregister classes or methods, so their lifetime is the process.

use std::alloc::{alloc_zeroed as raw_alloc_zeroed, Layout};
use std::ffi::{c_void, CStr, CString};
use std::fmt;

/// Pointer size for 64-bit processes
pub const SIZE_OF_PTR: usize = 8;

/// Alignment used for every block we allocate
const BLOCK_ALIGN: usize = 16;

/// An opaque address inside the native runtime
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NativeHandle(usize);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub const fn from_addr(addr: usize) -> Self {
        NativeHandle(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        NativeHandle(ptr as usize)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub fn as_void(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    /// Handle `bytes` past this one
    pub const fn add(self, bytes: usize) -> Self {
        NativeHandle(self.0 + bytes)
    }

    /// `None` for the null handle
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl<T> From<*mut T> for NativeHandle {
    fn from(ptr: *mut T) -> Self {
        NativeHandle(ptr as usize)
    }
}

impl<T> From<*const T> for NativeHandle {
    fn from(ptr: *const T) -> Self {
        NativeHandle(ptr as usize)
    }
}

/// Allocate a zeroed block that lives for the rest of the process
///
/// Returns null only if the allocator itself fails.
pub fn alloc_zeroed(size: usize) -> NativeHandle {
    let Ok(layout) = Layout::from_size_align(size.max(1), BLOCK_ALIGN) else {
        return NativeHandle::NULL;
    };
    // Safety: layout has a non-zero size
    NativeHandle::from(unsafe { raw_alloc_zeroed(layout) })
}

/// Allocate `count` zeroed elements of `elem_size` bytes each
pub fn alloc_array(count: usize, elem_size: usize) -> NativeHandle {
    alloc_zeroed(count.saturating_mul(elem_size))
}

/// Read a `T` at `base + offset`
///
/// # Safety
/// `base + offset` must point to at least `size_of::<T>()` readable bytes.
pub unsafe fn read<T: Copy>(base: NativeHandle, offset: usize) -> T {
    std::ptr::read_unaligned(base.add(offset).as_ptr::<T>())
}

/// Write a `T` at `base + offset`
///
/// # Safety
/// `base + offset` must point to at least `size_of::<T>()` writable bytes.
pub unsafe fn write<T: Copy>(base: NativeHandle, offset: usize, value: T) {
    std::ptr::write_unaligned(base.add(offset).as_ptr::<T>(), value)
}

/// Read a pointer-sized handle at `base + offset`
///
/// # Safety
/// See [`read`].
pub unsafe fn read_handle(base: NativeHandle, offset: usize) -> NativeHandle {
    NativeHandle::from_addr(read::<usize>(base, offset))
}

/// Write a pointer-sized handle at `base + offset`
///
/// # Safety
/// See [`write`].
pub unsafe fn write_handle(base: NativeHandle, offset: usize, value: NativeHandle) {
    write::<usize>(base, offset, value.addr())
}

/// Test bit `bit` of the byte at `base + byte_offset`
///
/// # Safety
/// See [`read`].
pub unsafe fn check_bit(base: NativeHandle, byte_offset: usize, bit: u8) -> bool {
    (read::<u8>(base, byte_offset) >> bit) & 1 == 1
}

/// Set or clear bit `bit` of the byte at `base + byte_offset`
///
/// # Safety
/// See [`write`].
pub unsafe fn set_bit(base: NativeHandle, byte_offset: usize, bit: u8, value: bool) {
    let byte = read::<u8>(base, byte_offset);
    let mask = 1u8 << bit;
    let updated = if value { byte | mask } else { byte & !mask };
    write::<u8>(base, byte_offset, updated)
}

/// Copy `len` bytes between native blocks
///
/// # Safety
/// Both ranges must be valid and must not overlap.
pub unsafe fn copy(src: NativeHandle, dst: NativeHandle, len: usize) {
    std::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_ptr::<u8>(), len)
}

/// Leak a NUL-terminated copy of `s`
///
/// Interior NULs end the string early, as they would on the native side.
pub fn leak_cstring(s: &str) -> NativeHandle {
    let truncated = s.split('\0').next().unwrap_or_default();
    match CString::new(truncated) {
        Ok(c) => NativeHandle::from(c.into_raw()),
        Err(_) => NativeHandle::NULL,
    }
}

/// Decode a NUL-terminated string; `None` for null
///
/// # Safety
/// A non-null `ptr` must point to a NUL-terminated byte string.
pub unsafe fn read_cstr(ptr: NativeHandle) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr.as_ptr()).to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_helpers_leave_siblings_alone() {
        let block = alloc_zeroed(4);
        unsafe {
            set_bit(block, 2, 3, true);
            set_bit(block, 2, 5, true);
            assert!(check_bit(block, 2, 3));
            assert!(check_bit(block, 2, 5));
            assert_eq!(read::<u8>(block, 2), 0b0010_1000);

            set_bit(block, 2, 3, false);
            assert!(!check_bit(block, 2, 3));
            assert!(check_bit(block, 2, 5));
            assert_eq!(read::<u8>(block, 1), 0);
            assert_eq!(read::<u8>(block, 3), 0);
        }
    }

    #[test]
    fn test_cstring_round_trip() {
        let ptr = leak_cstring("Il2CppSystem.Object");
        assert_eq!(unsafe { read_cstr(ptr) }.as_deref(), Some("Il2CppSystem.Object"));
        assert_eq!(unsafe { read_cstr(NativeHandle::NULL) }, None);
        let cut = leak_cstring("a\0b");
        assert_eq!(unsafe { read_cstr(cut) }.as_deref(), Some("a"));
    }

    #[test]
    fn test_unaligned_reads() {
        let block = alloc_zeroed(16);
        unsafe {
            write::<u32>(block, 3, 0xdead_beef);
            assert_eq!(read::<u32>(block, 3), 0xdead_beef);
            write_handle(block, 7, NativeHandle::from_addr(0x1234));
            assert_eq!(read_handle(block, 7).addr(), 0x1234);
        }
    }
}
