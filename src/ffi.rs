//! C ABI of the bridge
//!
//! Strings are NUL-terminated UTF-8. Strings returned by
//! [`mt5bridge_eval_json`] and [`mt5bridge_last_error`] are owned by the
//! caller and must be released with [`mt5bridge_string_free`]. Panics never
//! cross this boundary: they are recorded as the last error and reported as
//! a failure.

use crate::error::BridgeError;
use crate::{get_bridge, init_logging};
use std::any::Any;
use std::ffi::{c_char, c_int, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;

fn guarded<T>(on_panic: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            get_bridge().reject(BridgeError::Internal(panic_message(payload.as_ref())));
            on_panic
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic inside mt5bridge".to_string()
    }
}

/// # Safety
///
/// `ptr` must be NULL or point to a NUL-terminated string that outlives `'a`.
unsafe fn read_str<'a>(ptr: *const c_char, what: &str) -> Result<Option<&'a str>, BridgeError> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(Some)
        .map_err(|_| BridgeError::InvalidRequest(format!("{} is not valid UTF-8", what)))
}

fn into_c_string(text: String) -> *mut c_char {
    // Foreign messages may carry NUL bytes; C strings cannot.
    let text = if text.contains('\0') {
        text.replace('\0', "\\0")
    } else {
        text
    };
    CString::new(text).map_or(ptr::null_mut(), CString::into_raw)
}

/// Initialize the bridge. `python_home` may be NULL to use the configured
/// default. Returns 0 on success or a negative status code.
///
/// # Safety
///
/// `python_home` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn mt5bridge_initialize(python_home: *const c_char) -> c_int {
    guarded(BridgeError::Internal(String::new()).code(), || {
        init_logging("warn");
        let bridge = get_bridge();
        let home = match read_str(python_home, "python home") {
            Ok(home) => home,
            Err(e) => return bridge.reject(e).code(),
        };
        match bridge.initialize(home.map(Path::new)) {
            Ok(_) => 0,
            Err(e) => e.code(),
        }
    })
}

/// Shut the bridge down. Safe to call when not initialized.
#[no_mangle]
pub extern "C" fn mt5bridge_shutdown() {
    guarded((), || {
        let _ = get_bridge().shutdown();
    })
}

/// Evaluate a JSON request. Returns a newly allocated compact JSON response
/// (`"null"` when the vendor had no data) or NULL on failure.
///
/// # Safety
///
/// `request` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn mt5bridge_eval_json(request: *const c_char) -> *mut c_char {
    guarded(ptr::null_mut(), || {
        let bridge = get_bridge();
        let request = match read_str(request, "request") {
            Ok(Some(request)) => request,
            Ok(None) => {
                bridge.reject(BridgeError::InvalidRequest("request is null".to_string()));
                return ptr::null_mut();
            }
            Err(e) => {
                bridge.reject(e);
                return ptr::null_mut();
            }
        };
        match bridge.eval_json(request) {
            Ok(response) => {
                let out = into_c_string(response);
                if out.is_null() {
                    bridge.reject(BridgeError::Serialization(
                        "response contains a NUL byte".to_string(),
                    ));
                }
                out
            }
            Err(_) => ptr::null_mut(),
        }
    })
}

/// Copy of the last error message, or NULL when none is pending.
#[no_mangle]
pub extern "C" fn mt5bridge_last_error() -> *mut c_char {
    match panic::catch_unwind(|| get_bridge().last_error()) {
        Ok(Some(message)) => into_c_string(message),
        _ => ptr::null_mut(),
    }
}

/// Release a string returned by this library.
///
/// # Safety
///
/// `s` must be NULL or a pointer returned by [`mt5bridge_eval_json`] or
/// [`mt5bridge_last_error`] that was not freed before.
#[no_mangle]
pub unsafe extern "C" fn mt5bridge_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Version of the bridge library as a static string.
#[no_mangle]
pub extern "C" fn mt5bridge_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr().cast()
}
