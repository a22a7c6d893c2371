//! Internal-call resolution
//!
//! Some builds strip internal calls from the runtime's registry. For those a
//! table of `fnv1a(signature),offset` lines maps a signature to an offset
//! inside the icall module.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;

use tracing::{debug, error, trace};

use super::api::Il2CppApi;
use crate::error::{InteropError, Result};
use crate::memory::NativeHandle;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

static BUILTIN_TABLE: &str = include_str!("../../resources/icalls.csv");

/// FNV-1a over the low byte of each UTF-16 code unit of `signature`
pub fn fnv1a(signature: &str) -> u32 {
    signature.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| (hash ^ (unit as u8) as u32).wrapping_mul(FNV_PRIME))
}

fn parse_hex(field: &str) -> Option<u32> {
    let field = field.trim();
    let digits = field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")).unwrap_or(field);
    u32::from_str_radix(digits, 16).ok()
}

/// Signature hash to module-relative offset
#[derive(Debug, Clone, Default)]
pub struct IcallTable {
    entries: HashMap<u32, u32>,
}

impl IcallTable {
    /// Parse `hash,offset` lines; anything else is skipped
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != 2 {
                continue;
            }
            if let (Some(hash), Some(offset)) = (parse_hex(fields[0]), parse_hex(fields[1])) {
                entries.entry(hash).or_insert(offset);
            }
        }
        IcallTable { entries }
    }

    /// The table embedded in the crate
    pub fn builtin() -> Self {
        Self::parse(BUILTIN_TABLE)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let table = Self::parse(&text);
        debug!("loaded {} icall offsets from {:?}", table.len(), path);
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn offset(&self, signature: &str) -> Option<u32> {
        self.entries.get(&fnv1a(signature)).copied()
    }
}

/// A lazily failing internal call
///
/// Resolution never fails; a call that could not be found reports
/// [`InteropError::UnresolvedICall`] when it is first used.
pub struct ICall<F> {
    signature: String,
    address: NativeHandle,
    _fn: PhantomData<F>,
}

impl<F> std::fmt::Debug for ICall<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ICall").field("signature", &self.signature).field("address", &self.address).finish()
    }
}

impl<F: Copy> ICall<F> {
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn address(&self) -> NativeHandle {
        self.address
    }

    pub fn is_resolved(&self) -> bool {
        !self.address.is_null()
    }

    /// The callable function pointer
    pub fn get(&self) -> Result<F> {
        if self.address.is_null() || std::mem::size_of::<F>() != std::mem::size_of::<usize>() {
            error!("ICall with signature {} was not resolved", self.signature);
            return Err(InteropError::UnresolvedICall(self.signature.clone()));
        }
        let addr = self.address.addr();
        // Safety: `F` is pointer sized, and `ICall::resolve` callers vouch it
        // is the call's function pointer type
        Ok(unsafe { std::mem::transmute_copy::<usize, F>(&addr) })
    }
}

impl<F> ICall<F> {
    /// Resolve `signature` through the runtime, then through `table`
    ///
    /// # Safety
    /// `F` must be the `extern "C"` function pointer type of the call.
    pub unsafe fn resolve(api: &dyn Il2CppApi, table: &IcallTable, module: &str, signature: &str) -> Self {
        let mut address = api.resolve_icall(signature);
        if address.is_null() {
            trace!("ICall {} not registered, trying the offset table", signature);
            address = match (table.offset(signature), api.module_base(module).non_null()) {
                (Some(offset), Some(base)) => base.add(offset as usize),
                _ => NativeHandle::NULL,
            };
        }
        if address.is_null() {
            trace!("ICall {} not resolved", signature);
        }
        ICall { signature: signature.to_string(), address, _fn: PhantomData }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRuntime;

    type GetLength = unsafe extern "C" fn(NativeHandle) -> i32;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(""), 0x811c_9dc5);
        assert_eq!(fnv1a("a"), 0xe40c_292c);
        assert_eq!(fnv1a("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let sig = "UnityEngine.Object::get_name()";
        let text = format!(
            "# header\n{:x},1a2b\n0x10,0x20\nnot,hex\n1,2,3\n\n{:x},ffff\n",
            fnv1a(sig),
            fnv1a(sig)
        );
        let table = IcallTable::parse(&text);
        assert_eq!(table.len(), 2);
        assert_eq!(table.offset(sig), Some(0x1a2b));
        assert_eq!(table.offset("missing"), None);
    }

    #[test]
    fn test_builtin_table_parses() {
        assert!(IcallTable::builtin().is_empty());
    }

    #[test]
    fn test_unresolved_call_fails_on_use() {
        let fake = FakeRuntime::new();
        let call = unsafe { ICall::<GetLength>::resolve(&fake, &IcallTable::default(), "UnityPlayer", "X::Y()") };
        assert!(!call.is_resolved());
        match call.get() {
            Err(InteropError::UnresolvedICall(sig)) => assert_eq!(sig, "X::Y()"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_table_offset_relative_to_module() {
        let fake = FakeRuntime::new();
        fake.set_module_base("UnityPlayer", NativeHandle::from_addr(0x1000_0000));
        let sig = "UnityEngine.Transform::get_position_Injected()";
        let table = IcallTable::parse(&format!("{:x},40", fnv1a(sig)));
        let call = unsafe { ICall::<GetLength>::resolve(&fake, &table, "UnityPlayer", sig) };
        assert_eq!(call.address().addr(), 0x1000_0040);
        assert!(call.get().is_ok());
    }

    #[test]
    fn test_registered_call_wins() {
        let fake = FakeRuntime::new();
        fake.register_icall("A::B()", NativeHandle::from_addr(0x4242));
        let call = unsafe { ICall::<GetLength>::resolve(&fake, &IcallTable::default(), "UnityPlayer", "A::B()") };
        assert_eq!(call.address().addr(), 0x4242);
    }
}
