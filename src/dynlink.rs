//! Thin wrappers over the platform dynamic linker: `dlopen`, `dlsym`,
//! `dlclose`. No distinguishing error replies exist on the wire for these;
//! a null handle or address *is* the error, exactly as `libdl` reports it.

use std::ffi::CString;
use std::os::raw::{c_int, c_void};

use anyhow::Context;

/// Returns the opaque handle as a 64-bit value, or 0 on failure.
pub fn dlopen(filename: &str, mode: i32) -> anyhow::Result<u64> {
    let cpath = CString::new(filename).context("filename contains an embedded NUL")?;
    let handle = unsafe { libc::dlopen(cpath.as_ptr(), mode as c_int) };
    Ok(handle as u64)
}

/// Returns the platform's integer status from `dlclose`.
pub fn dlclose(handle: u64) -> anyhow::Result<i64> {
    let status = unsafe { libc::dlclose(handle as *mut c_void) };
    Ok(status as i64)
}

/// Resolves `name` against `handle`, returning the address as a 64-bit
/// value, or 0 if unresolved.
pub fn dlsym(handle: u64, name: &str) -> anyhow::Result<u64> {
    let csym = CString::new(name).context("symbol name contains an embedded NUL")?;
    let addr = unsafe { libc::dlsym(handle as *mut c_void, csym.as_ptr()) };
    Ok(addr as u64)
}
