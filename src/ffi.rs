//! Function-style C ABI over a process-wide [`NativeLib`].
//!
//! Strings cross the boundary as NUL-terminated UTF-8. Text returned by
//! [`neural_gauge_get_generated_text`] is a fresh allocation owned by the
//! caller and must be released with [`neural_gauge_free_string`]. No entry
//! point unwinds into the host: a panic is logged and reported as a failure
//! status.

use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::OnceLock;

use tracing::error;

use crate::api::NativeLib;
use crate::config::ModelConfig;
use crate::error::GaugeError;

/// Host callback: piece text and step latency in milliseconds. The pointer
/// is only valid for the duration of the call.
pub type TokenCallback = extern "C" fn(token: *const c_char, time_ms: i64);

static LIB: OnceLock<NativeLib> = OnceLock::new();

fn lib() -> &'static NativeLib {
    LIB.get_or_init(|| NativeLib::new(ModelConfig::default()))
}

fn guarded<T>(what: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!(call = what, "Panic caught at the FFI boundary");
        fallback
    })
}

/// Borrow a C string as UTF-8. `None` for null or invalid UTF-8.
///
/// # Safety
/// `s` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn borrow_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s).to_str().ok()
}

fn to_c_string(text: &str) -> CString {
    CString::new(text.replace('\0', "")).unwrap_or_default()
}

/// Load a GGUF model. Returns 0 on success, negative on failure.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn neural_gauge_load_model(path: *const c_char) -> i32 {
    let not_loadable = GaugeError::ModelLoadFailure {
        path: String::new(),
        reason: "invalid path".into(),
    }
    .status_code();

    let Some(path) = borrow_str(path) else {
        return not_loadable;
    };
    guarded("load_model", not_loadable, || lib().load_model(path))
}

/// Register (or, with null, clear) the token callback.
#[no_mangle]
pub extern "C" fn neural_gauge_set_token_callback(callback: Option<TokenCallback>) {
    guarded("set_token_callback", (), || match callback {
        Some(callback) => lib().set_token_callback(move |piece, ms| {
            let piece = to_c_string(piece);
            callback(piece.as_ptr(), ms);
        }),
        None => lib().clear_token_callback(),
    })
}

/// Generate up to `max_tokens` tokens. Returns the number generated, or a
/// negative status.
///
/// # Safety
/// `prompt` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn neural_gauge_run_inference(prompt: *const c_char, max_tokens: i32) -> i32 {
    let untokenizable = GaugeError::TokenizationFailure(String::new()).status_code();

    let Some(prompt) = borrow_str(prompt) else {
        return untokenizable;
    };
    guarded("run_inference", untokenizable, || {
        lib().run_inference(prompt, max_tokens)
    })
}

#[no_mangle]
pub extern "C" fn neural_gauge_get_ram_usage_mb() -> f64 {
    guarded("get_ram_usage_mb", 0.0, || lib().get_ram_usage_mb())
}

#[no_mangle]
pub extern "C" fn neural_gauge_dispose_model() {
    guarded("dispose_model", (), || lib().dispose_model())
}

/// Text of the most recent generation as a newly allocated string.
/// Release it with [`neural_gauge_free_string`].
#[no_mangle]
pub extern "C" fn neural_gauge_get_generated_text() -> *mut c_char {
    guarded("get_generated_text", ptr::null_mut(), || {
        to_c_string(&lib().generated_text()).into_raw()
    })
}

/// Release a string returned by this library.
///
/// # Safety
/// `s` must be null or a pointer obtained from
/// [`neural_gauge_get_generated_text`] that has not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn neural_gauge_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}
