//! Native entry points of injected methods
//!
//! Every injected `MethodInfo` points at one of a fixed set of `extern "C"`
//! functions, one per arity and choice of integer or floating point register
//! for each argument and the result. The runtime passes the `MethodInfo*` as
//! the last argument, which keys the dispatch table to the trampoline or
//! lifecycle hook that should run. The same table backs [`generic_invoker`],
//! the `InvokerMethod` used by `il2cpp_runtime_invoke`.
//!
//! Structs other than register-sized ones arrive as a pointer to their data.

use std::ffi::c_void;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::error;

use super::managed::ManagedType;
use super::trampoline::Trampoline;
use super::InjectorState;
use crate::memory::{self, NativeHandle};

/// How `runtime_invoke` hands one argument to the invoker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgPassing {
    /// A pointer to an unboxed value of this many bytes, loaded into a word
    Value(usize),
    /// The pointer itself: an object, or the data of a struct handed on by reference
    Reference,
}

pub(crate) struct MethodTarget {
    pub state: Arc<InjectorState>,
    pub trampoline: Arc<Trampoline>,
    /// Concrete `Il2CppType*` arguments of an inflated method
    pub generic_arguments: Vec<NativeHandle>,
    pub arguments: Vec<ArgPassing>,
    /// Class to box a value-type return into, null for references and void
    pub return_class: NativeHandle,
}

pub(crate) enum DispatchTarget {
    Method(MethodTarget),
    Constructor { state: Arc<InjectorState>, ty: Arc<ManagedType> },
    Finalizer { state: Arc<InjectorState> },
}

impl DispatchTarget {
    fn arity(&self) -> usize {
        match self {
            DispatchTarget::Method(target) => target.arguments.len(),
            _ => 0,
        }
    }
}

static TARGETS: Lazy<DashMap<usize, Arc<DispatchTarget>>> = Lazy::new(DashMap::new);

/// Route calls for `method` to `target`
pub(crate) fn register(method: NativeHandle, target: DispatchTarget) {
    TARGETS.insert(method.addr(), Arc::new(target));
}

pub(crate) fn is_registered(method: NativeHandle) -> bool {
    TARGETS.contains_key(&method.addr())
}

fn lookup(method: usize) -> Option<Arc<DispatchTarget>> {
    // Cloned out so no shard lock is held while managed code runs
    TARGETS.get(&method).map(|entry| entry.value().clone())
}

fn dispatch(this: usize, words: &[usize], method: usize) -> usize {
    let Some(target) = lookup(method) else {
        error!("No managed target for injected method {}", NativeHandle::from_addr(method));
        return 0;
    };
    let this = NativeHandle::from_addr(this);
    match target.as_ref() {
        DispatchTarget::Method(target) => match target.state.managed_from_native(this) {
            Some(object) => target.trampoline.call(target.state.as_ref(), &object, words, &target.generic_arguments),
            None => {
                error!("{} called on {} which has no managed counterpart", target.trampoline.label(), this);
                0
            }
        },
        DispatchTarget::Constructor { state, ty } => {
            state.construct(this, ty);
            0
        }
        DispatchTarget::Finalizer { state } => {
            state.finalize(this);
            0
        }
    }
}

/// One register-sized argument or result
///
/// Integer words travel in general purpose registers and floating point ones
/// in vector registers. Single precision values sit in the low half of a
/// double precision register, so one `f64` carrier serves both widths.
trait Word: Copy {
    fn to_word(self) -> usize;
    fn from_word(word: usize) -> Self;
}

impl Word for usize {
    fn to_word(self) -> usize {
        self
    }

    fn from_word(word: usize) -> Self {
        word
    }
}

impl Word for f64 {
    fn to_word(self) -> usize {
        self.to_bits() as usize
    }

    fn from_word(word: usize) -> Self {
        f64::from_bits(word as u64)
    }
}

/// Expand `$leaf` once per combination of word carriers for a result and
/// the listed arguments, picking the one `$mask` selects at run time
///
/// Bit 0 of the mask marks a floating point result, bit `i + 1` argument `i`.
macro_rules! by_carriers {
    ($leaf:ident($($extra:tt)*), $mask:expr, [$($chosen:ty),*], []) => {
        $leaf!($($extra)*; $($chosen),*)
    };
    ($leaf:ident($($extra:tt)*), $mask:expr, [$($chosen:ty),*], [$_next:ident $(, $rest:ident)*]) => {
        if ($mask) & 1 != 0 {
            by_carriers!($leaf($($extra)*), ($mask) >> 1, [$($chosen,)* f64], [$($rest),*])
        } else {
            by_carriers!($leaf($($extra)*), ($mask) >> 1, [$($chosen,)* usize], [$($rest),*])
        }
    };
}

macro_rules! entry_address {
    ($entry:ident; $($carrier:ty),*) => {
        $entry::<$($carrier),*> as usize
    };
}

macro_rules! invoke_with {
    ($invoke:ident, $($arg:expr),*; $($carrier:ty),*) => {
        $invoke::<$($carrier),*>($($arg),*)
    };
}

macro_rules! entry_points {
    ($($name:ident, $invoke:ident <$($ty:ident: $arg:ident),*>;)*) => {
        $(
            #[allow(improper_ctypes_definitions)]
            unsafe extern "C" fn $name<R: Word, $($ty: Word),*>(this: usize, $($arg: $ty,)* method: usize) -> R {
                R::from_word(dispatch(this, &[$($arg.to_word()),*], method))
            }

            /// # Safety
            /// `pointer` must be `$name` instantiated with the same carriers.
            unsafe fn $invoke<R: Word, $($ty: Word),*>(pointer: usize, this: usize, words: &[usize], method: usize) -> usize {
                let [$($arg),*] = *words else {
                    error!("{} arguments passed to an entry point of another arity", words.len());
                    return 0;
                };
                let entry = std::mem::transmute::<usize, unsafe extern "C" fn(usize, $($ty,)* usize) -> R>(pointer);
                entry(this, $($ty::from_word($arg),)* method).to_word()
            }
        )*
    };
}

entry_points! {
    entry0, invoke0<>;
    entry1, invoke1<A: a0>;
    entry2, invoke2<A: a0, B: a1>;
    entry3, invoke3<A: a0, B: a1, C: a2>;
    entry4, invoke4<A: a0, B: a1, C: a2, D: a3>;
    entry5, invoke5<A: a0, B: a1, C: a2, D: a3, E: a4>;
    entry6, invoke6<A: a0, B: a1, C: a2, D: a3, E: a4, F: a5>;
    entry7, invoke7<A: a0, B: a1, C: a2, D: a3, E: a4, F: a5, G: a6>;
    entry8, invoke8<A: a0, B: a1, C: a2, D: a3, E: a4, F: a5, G: a6, H: a7>;
}

/// Native entry point for a method taking `arity` arguments besides `this`
///
/// `float_mask` has bit 0 set for a floating point result and bit `i + 1`
/// for each floating point argument `i`.
pub(crate) fn entry_point(arity: usize, float_mask: u16) -> Option<NativeHandle> {
    let addr = match arity {
        0 => by_carriers!(entry_address(entry0), float_mask, [], [r]),
        1 => by_carriers!(entry_address(entry1), float_mask, [], [r, a0]),
        2 => by_carriers!(entry_address(entry2), float_mask, [], [r, a0, a1]),
        3 => by_carriers!(entry_address(entry3), float_mask, [], [r, a0, a1, a2]),
        4 => by_carriers!(entry_address(entry4), float_mask, [], [r, a0, a1, a2, a3]),
        5 => by_carriers!(entry_address(entry5), float_mask, [], [r, a0, a1, a2, a3, a4]),
        6 => by_carriers!(entry_address(entry6), float_mask, [], [r, a0, a1, a2, a3, a4, a5]),
        7 => by_carriers!(entry_address(entry7), float_mask, [], [r, a0, a1, a2, a3, a4, a5, a6]),
        8 => by_carriers!(entry_address(entry8), float_mask, [], [r, a0, a1, a2, a3, a4, a5, a6, a7]),
        _ => return None,
    };
    Some(NativeHandle::from_addr(addr))
}

/// Call an entry point the way compiled code would
///
/// # Safety
/// `pointer` must be `entry_point(words.len(), float_mask)`.
unsafe fn call_entry(pointer: NativeHandle, this: usize, words: &[usize], float_mask: u16, method: usize) -> usize {
    let p = pointer.addr();
    match words.len() {
        0 => by_carriers!(invoke_with(invoke0, p, this, words, method), float_mask, [], [r]),
        1 => by_carriers!(invoke_with(invoke1, p, this, words, method), float_mask, [], [r, a0]),
        2 => by_carriers!(invoke_with(invoke2, p, this, words, method), float_mask, [], [r, a0, a1]),
        3 => by_carriers!(invoke_with(invoke3, p, this, words, method), float_mask, [], [r, a0, a1, a2]),
        4 => by_carriers!(invoke_with(invoke4, p, this, words, method), float_mask, [], [r, a0, a1, a2, a3]),
        5 => by_carriers!(invoke_with(invoke5, p, this, words, method), float_mask, [], [r, a0, a1, a2, a3, a4]),
        6 => by_carriers!(invoke_with(invoke6, p, this, words, method), float_mask, [], [r, a0, a1, a2, a3, a4, a5]),
        7 => by_carriers!(invoke_with(invoke7, p, this, words, method), float_mask, [], [r, a0, a1, a2, a3, a4, a5, a6]),
        8 => {
            by_carriers!(invoke_with(invoke8, p, this, words, method), float_mask, [], [r, a0, a1, a2, a3, a4, a5, a6, a7])
        }
        n => {
            error!("{} arguments exceed the entry point limit", n);
            0
        }
    }
}

/// Read one `runtime_invoke` argument as a word
///
/// Register-sized values are loaded; anything else is handed on as the
/// pointer to its data.
///
/// # Safety
/// `arg` must point to a value of `size` bytes.
unsafe fn read_value(arg: *mut c_void, size: usize) -> usize {
    let handle = NativeHandle::from_ptr(arg as *const c_void);
    match size {
        1 => memory::read::<u8>(handle, 0) as usize,
        2 => memory::read::<u16>(handle, 0) as usize,
        4 => memory::read::<u32>(handle, 0) as usize,
        8 => memory::read::<u64>(handle, 0) as usize,
        _ => arg as usize,
    }
}

/// `InvokerMethod` of every injected method
///
/// # Safety
/// Called by the runtime with `args` laid out for `method`'s signature.
pub(crate) unsafe extern "C" fn generic_invoker(
    method_pointer: NativeHandle,
    method: NativeHandle,
    object: NativeHandle,
    args: *mut *mut c_void,
) -> NativeHandle {
    let Some(target) = lookup(method.addr()) else {
        error!("No managed target for injected method {}", method);
        return NativeHandle::NULL;
    };
    let arity = target.arity();
    let mut words = Vec::with_capacity(arity);
    if let DispatchTarget::Method(target) = target.as_ref() {
        for (i, passing) in target.arguments.iter().enumerate() {
            let arg = if args.is_null() { std::ptr::null_mut() } else { *args.add(i) };
            words.push(match passing {
                ArgPassing::Reference => arg as usize,
                ArgPassing::Value(_) if arg.is_null() => 0,
                ArgPassing::Value(size) => read_value(arg, *size),
            });
        }
    }
    let float_mask = match target.as_ref() {
        DispatchTarget::Method(target) => target.trampoline.float_mask(),
        _ => 0,
    };
    let word = call_entry(method_pointer, object.addr(), &words, float_mask, method.addr());
    match target.as_ref() {
        DispatchTarget::Method(target) if !target.return_class.is_null() => {
            let mut value = word;
            target.state.api().value_box(target.return_class, NativeHandle::from(&mut value as *mut usize))
        }
        _ => NativeHandle::from_addr(word),
    }
}

pub(crate) fn generic_invoker_address() -> NativeHandle {
    NativeHandle::from_addr(generic_invoker as usize)
}
