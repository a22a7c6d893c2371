//! Adapting native calls into managed method bodies
//!
//! Native code calls injected methods with every argument in one
//! register-sized word, integer or floating point. A [`Trampoline`] knows how to decode each word into a
//! [`ManagedValue`], run the body and encode the result back into a word.
//! Building one needs nothing from the runtime; calling one goes through a
//! [`TrampolineContext`] for strings and object identity.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use super::managed::{ManagedMethod, ManagedObject, ManagedValue, MethodBody, MethodCall, TypeRef};
use crate::common::TypeCode;
use crate::memory::NativeHandle;

/// Largest parameter count a native entry point can forward
pub const MAX_ARITY: usize = 8;

/// How one argument or return value occupies a word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordKind {
    Bool,
    /// Two's complement integer of the given byte width
    Signed(u8),
    Unsigned(u8),
    /// IEEE 754 value of the given byte width, carried in a vector register
    Float(u8),
    String,
    /// An instance of an injected type
    Object,
    /// Passed through as a handle
    Native,
}

impl WordKind {
    pub fn of(ty: &TypeRef) -> Option<Self> {
        Some(match ty {
            TypeRef::Value(code) => match code {
                TypeCode::BOOLEAN => WordKind::Bool,
                TypeCode::I1 => WordKind::Signed(1),
                TypeCode::I2 => WordKind::Signed(2),
                TypeCode::I4 => WordKind::Signed(4),
                TypeCode::I8 | TypeCode::I => WordKind::Signed(8),
                TypeCode::U1 => WordKind::Unsigned(1),
                TypeCode::U2 | TypeCode::CHAR => WordKind::Unsigned(2),
                TypeCode::U4 => WordKind::Unsigned(4),
                TypeCode::U8 | TypeCode::U => WordKind::Unsigned(8),
                TypeCode::R4 => WordKind::Float(4),
                TypeCode::R8 => WordKind::Float(8),
                _ => return None,
            },
            TypeRef::String => WordKind::String,
            TypeRef::Managed(_) => WordKind::Object,
            TypeRef::Class(_) | TypeRef::Named { .. } | TypeRef::GenericParameter(_) => WordKind::Native,
            TypeRef::Void => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Word(WordKind),
}

/// What a trampoline needs from the runtime while it runs
pub trait TrampolineContext {
    fn string_to_managed(&self, string: NativeHandle) -> Option<String>;

    fn managed_to_string(&self, value: Option<&str>) -> NativeHandle;

    /// The managed counterpart of an injected instance
    fn managed_from_native(&self, object: NativeHandle) -> Option<Arc<ManagedObject>>;
}

/// A native-callable adapter for one managed method
pub struct Trampoline {
    label: String,
    parameters: Vec<WordKind>,
    ret: ReturnKind,
    body: MethodBody,
    /// Generic parameter each argument is declared as
    generic_parameters: Vec<Option<u16>>,
    generic_return: Option<u16>,
}

fn generic_index(ty: &TypeRef) -> Option<u16> {
    match ty {
        TypeRef::GenericParameter(index) => Some(*index),
        _ => None,
    }
}

impl Trampoline {
    /// `None` when the method has no body or a signature words cannot carry
    pub fn build(owner: &str, method: &ManagedMethod) -> Option<Self> {
        let body = method.body.clone()?;
        if method.parameters.len() > MAX_ARITY {
            return None;
        }
        let parameters = method
            .parameters
            .iter()
            .map(|p| if p.ty.fits_in_word() { WordKind::of(&p.ty) } else { None })
            .collect::<Option<Vec<_>>>()?;
        let ret = match &method.return_type {
            TypeRef::Void => ReturnKind::Void,
            ty if ty.fits_in_word() => ReturnKind::Word(WordKind::of(ty)?),
            _ => return None,
        };
        Some(Trampoline {
            label: format!("{}::{}", owner, method.name),
            parameters,
            ret,
            body,
            generic_parameters: method.parameters.iter().map(|p| generic_index(&p.ty)).collect(),
            generic_return: generic_index(&method.return_type),
        })
    }

    /// A copy for one instantiation, where generic parameter `i` is bound to
    /// a floating point type of `widths[i]` bytes
    pub fn with_float_arguments(&self, widths: &[Option<u8>]) -> Trampoline {
        let bound = |index: Option<u16>| index.and_then(|i| widths.get(i as usize).copied().flatten());
        let parameters = self
            .parameters
            .iter()
            .zip(&self.generic_parameters)
            .map(|(kind, index)| bound(*index).map_or(*kind, WordKind::Float))
            .collect();
        let ret = match (self.ret, bound(self.generic_return)) {
            (ReturnKind::Word(_), Some(width)) => ReturnKind::Word(WordKind::Float(width)),
            (ret, _) => ret,
        };
        Trampoline {
            label: self.label.clone(),
            parameters,
            ret,
            body: self.body.clone(),
            generic_parameters: self.generic_parameters.clone(),
            generic_return: self.generic_return,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn arity(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameters(&self) -> &[WordKind] {
        &self.parameters
    }

    pub fn return_kind(&self) -> ReturnKind {
        self.ret
    }

    /// Which words travel in floating point registers: bit 0 for the
    /// result, bit `i + 1` for argument `i`
    pub fn float_mask(&self) -> u16 {
        let result = matches!(self.ret, ReturnKind::Word(WordKind::Float(_))) as u16;
        self.parameters
            .iter()
            .enumerate()
            .filter(|(_, kind)| matches!(kind, WordKind::Float(_)))
            .fold(result, |mask, (i, _)| mask | 1 << (i + 1))
    }

    /// Run the body on native arguments; never unwinds, 0 on any failure
    pub fn call(
        &self,
        ctx: &dyn TrampolineContext,
        this: &Arc<ManagedObject>,
        words: &[usize],
        generic_arguments: &[NativeHandle],
    ) -> usize {
        if words.len() != self.parameters.len() {
            error!("{} called with {} arguments, expected {}", self.label, words.len(), self.parameters.len());
            return 0;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let args: Vec<ManagedValue> =
                self.parameters.iter().zip(words).map(|(kind, word)| decode(ctx, *kind, *word)).collect();
            let call = MethodCall { this, args: &args, generic_arguments };
            (self.body)(&call).map(|value| self.encode(ctx, value))
        }));
        match outcome {
            Ok(Ok(word)) => word,
            Ok(Err(exception)) => {
                error!("Exception in native-to-managed trampoline, not passing it to il2cpp: {}: {}", self.label, exception);
                0
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                error!("Exception in native-to-managed trampoline, not passing it to il2cpp: {}: {}", self.label, message);
                0
            }
        }
    }

    fn encode(&self, ctx: &dyn TrampolineContext, value: ManagedValue) -> usize {
        let ReturnKind::Word(kind) = self.ret else {
            return 0;
        };
        match (kind, value) {
            (WordKind::Bool, ManagedValue::Bool(v)) => v as usize,
            (WordKind::Signed(width) | WordKind::Unsigned(width), ManagedValue::Int(v)) => mask(v as u64, width),
            (WordKind::Signed(width) | WordKind::Unsigned(width), ManagedValue::UInt(v)) => mask(v, width),
            (WordKind::Signed(_) | WordKind::Unsigned(_), ManagedValue::Bool(v)) => v as usize,
            (WordKind::Float(width), value @ (ManagedValue::Float(_) | ManagedValue::Int(_) | ManagedValue::UInt(_))) => {
                float_bits(value.as_f64().unwrap_or_default(), width)
            }
            (WordKind::String, ManagedValue::String(s)) => ctx.managed_to_string(s.as_deref()).addr(),
            (WordKind::Object, ManagedValue::Object(o)) => o.map_or(0, |o| o.native().addr()),
            (_, ManagedValue::Native(h)) => h.addr(),
            // A generic value-type result travels as its raw bits
            (WordKind::Native, ManagedValue::Int(v)) => v as usize,
            (WordKind::Native, ManagedValue::UInt(v)) => v as usize,
            (WordKind::Native, ManagedValue::Bool(v)) => v as usize,
            (_, ManagedValue::Void) => 0,
            (kind, value) => {
                error!("{} returned {:?} where {:?} was expected", self.label, value, kind);
                0
            }
        }
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("label", &self.label)
            .field("parameters", &self.parameters)
            .field("ret", &self.ret)
            .finish()
    }
}

fn mask(value: u64, width: u8) -> usize {
    if width >= 8 {
        value as usize
    } else {
        (value & ((1u64 << (width as u32 * 8)) - 1)) as usize
    }
}

fn float_bits(value: f64, width: u8) -> usize {
    if width == 4 {
        (value as f32).to_bits() as usize
    } else {
        value.to_bits() as usize
    }
}

fn decode(ctx: &dyn TrampolineContext, kind: WordKind, word: usize) -> ManagedValue {
    match kind {
        WordKind::Bool => ManagedValue::Bool(word & 0xff != 0),
        WordKind::Signed(width) => {
            let shift = 64 - width as u32 * 8;
            ManagedValue::Int(((word as u64) << shift) as i64 >> shift)
        }
        WordKind::Unsigned(width) => ManagedValue::UInt(mask(word as u64, width) as u64),
        WordKind::Float(4) => ManagedValue::Float(f32::from_bits(word as u32) as f64),
        WordKind::Float(_) => ManagedValue::Float(f64::from_bits(word as u64)),
        WordKind::String => ManagedValue::String(ctx.string_to_managed(NativeHandle::from_addr(word))),
        WordKind::Object => {
            let handle = NativeHandle::from_addr(word);
            if handle.is_null() {
                return ManagedValue::Object(None);
            }
            match ctx.managed_from_native(handle) {
                Some(object) => ManagedValue::Object(Some(object)),
                None => {
                    trace!("argument {} is not an injected instance, passing it natively", handle);
                    ManagedValue::Native(handle)
                }
            }
        }
        WordKind::Native => ManagedValue::Native(NativeHandle::from_addr(word)),
    }
}
