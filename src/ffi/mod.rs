/**
 * ffi/mod.rs
 *
 * Foreign Function Interface so a native setup dialog can drive sessions
 * Uses C-ABI for maximum compatibility
 */

mod session;
mod types;

pub use session::*;
pub use types::*;

use std::ffi::{CStr, CString};
use libc::c_char;
use std::panic;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};

static LAST_ERROR: Mutex<Option<String>> = Mutex::new(None);
static LAST_ERROR_CODE: AtomicI32 = AtomicI32::new(0);

/// Initialize the library (call once at startup)
#[no_mangle]
pub extern "C" fn netplay_init() -> i32 {
    // Keep panics from unwinding silently into the host application
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!("netplay panic: {}", panic_info);
    }));
    0
}

/// Get library version string, release with `netplay_free_string`
#[no_mangle]
pub extern "C" fn netplay_version() -> *mut c_char {
    to_c_string(env!("CARGO_PKG_VERSION"))
}

/// Free a string allocated by the library
#[no_mangle]
pub extern "C" fn netplay_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

/// Get last error message, null if none.
/// Release with `netplay_free_string`.
#[no_mangle]
pub extern "C" fn netplay_last_error() -> *mut c_char {
    match LAST_ERROR.lock().unwrap_or_else(PoisonError::into_inner).as_deref() {
        Some(err) => to_c_string(err),
        None => std::ptr::null_mut(),
    }
}

/// Numeric kind of the last error, 0 if none (see `SessionError::code`)
#[no_mangle]
pub extern "C" fn netplay_last_error_code() -> i32 {
    LAST_ERROR_CODE.load(Ordering::Relaxed)
}

/// Clear last error
#[no_mangle]
pub extern "C" fn netplay_clear_error() {
    *LAST_ERROR.lock().unwrap_or_else(PoisonError::into_inner) = None;
    LAST_ERROR_CODE.store(0, Ordering::Relaxed);
}

/// Set last error (internal helper)
pub(crate) fn set_last_error(code: i32, error: &str) {
    *LAST_ERROR.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    LAST_ERROR_CODE.store(code, Ordering::Relaxed);
}

/// Helper to convert C string to Rust string
pub(crate) fn c_str_to_rust(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe {
        CStr::from_ptr(ptr)
            .to_str()
            .ok()
            .map(|s| s.to_string())
    }
}

/// Owned C string for the caller, null if `s` holds an interior NUL
pub(crate) fn to_c_string(s: &str) -> *mut c_char {
    CString::new(s)
        .map(CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}
