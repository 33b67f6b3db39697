//! The call trampoline: invoke an arbitrary function pointer resolved by
//! the controller with up to eleven machine-word arguments.
//!
//! This is deliberately a fixed table of typed casts rather than a generic
//! variadic-FFI abstraction (see the design note on variadic dispatch): a
//! systems language has no safe way to call a function whose signature is
//! only known at runtime, so we replicate the arity switch verbatim instead
//! of trying to paper over it with "clean" generics.

use anyhow::anyhow;

use crate::consts::MAX_CALL_ARGC;

type Word = u64;
type Fn0 = unsafe extern "C" fn() -> Word;
type Fn1 = unsafe extern "C" fn(Word) -> Word;
type Fn2 = unsafe extern "C" fn(Word, Word) -> Word;
type Fn3 = unsafe extern "C" fn(Word, Word, Word) -> Word;
type Fn4 = unsafe extern "C" fn(Word, Word, Word, Word) -> Word;
type Fn5 = unsafe extern "C" fn(Word, Word, Word, Word, Word) -> Word;
type Fn6 = unsafe extern "C" fn(Word, Word, Word, Word, Word, Word) -> Word;
type Fn7 = unsafe extern "C" fn(Word, Word, Word, Word, Word, Word, Word) -> Word;
type Fn8 = unsafe extern "C" fn(Word, Word, Word, Word, Word, Word, Word, Word) -> Word;
type Fn9 = unsafe extern "C" fn(Word, Word, Word, Word, Word, Word, Word, Word, Word) -> Word;
type Fn10 = unsafe extern "C" fn(Word, Word, Word, Word, Word, Word, Word, Word, Word, Word) -> Word;
type Fn11 =
    unsafe extern "C" fn(Word, Word, Word, Word, Word, Word, Word, Word, Word, Word, Word) -> Word;

/// Calls the function at `address` with `args`, whose length is the arity.
/// If `address` does not actually point at a function of that signature,
/// or at a function at all, this is undefined behavior on the agent's own
/// terms: the controller is trusted to have resolved a sane address (see
/// the "no authentication" non-goal). A trap here kills the agent process,
/// which is accepted by design.
///
/// # Safety
/// `address` must be a valid, callable function pointer whose actual
/// signature matches `args.len()` machine-word arguments returning one
/// machine word. This is exactly as unsafe as the wire protocol describes.
pub unsafe fn invoke(address: u64, args: &[u64]) -> anyhow::Result<u64> {
    if args.len() > MAX_CALL_ARGC {
        return Err(anyhow!("call argc {} exceeds max {}", args.len(), MAX_CALL_ARGC));
    }

    let ret = match args.len() {
        0 => {
            let f: Fn0 = std::mem::transmute(address as *const ());
            f()
        }
        1 => {
            let f: Fn1 = std::mem::transmute(address as *const ());
            f(args[0])
        }
        2 => {
            let f: Fn2 = std::mem::transmute(address as *const ());
            f(args[0], args[1])
        }
        3 => {
            let f: Fn3 = std::mem::transmute(address as *const ());
            f(args[0], args[1], args[2])
        }
        4 => {
            let f: Fn4 = std::mem::transmute(address as *const ());
            f(args[0], args[1], args[2], args[3])
        }
        5 => {
            let f: Fn5 = std::mem::transmute(address as *const ());
            f(args[0], args[1], args[2], args[3], args[4])
        }
        6 => {
            let f: Fn6 = std::mem::transmute(address as *const ());
            f(args[0], args[1], args[2], args[3], args[4], args[5])
        }
        7 => {
            let f: Fn7 = std::mem::transmute(address as *const ());
            f(args[0], args[1], args[2], args[3], args[4], args[5], args[6])
        }
        8 => {
            let f: Fn8 = std::mem::transmute(address as *const ());
            f(args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7])
        }
        9 => {
            let f: Fn9 = std::mem::transmute(address as *const ());
            f(args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7], args[8])
        }
        10 => {
            let f: Fn10 = std::mem::transmute(address as *const ());
            f(
                args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7], args[8],
                args[9],
            )
        }
        11 => {
            let f: Fn11 = std::mem::transmute(address as *const ());
            f(
                args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7], args[8],
                args[9], args[10],
            )
        }
        _ => unreachable!("checked above"),
    };

    Ok(ret)
}
