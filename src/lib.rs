//! neural-gauge: on-device text generation core.
//!
//! Loads a quantized model through a llama.cpp-style backend, evaluates a
//! prompt, and streams greedily decoded tokens back to the caller while
//! reporting the memory held by the model and its context.
//!
//! Two call surfaces share one core: [`api::NativeLib`] (method style,
//! status codes) and the `extern "C"` functions in [`ffi`].

pub mod api;
pub mod config;
pub mod error;
pub mod ffi;
pub mod inference;

pub use config::Config;
pub use error::{GaugeError, Result};
pub use inference::engine::{CancelFlag, GenerationOutcome, GenerationRequest, StopReason};
pub use inference::session::SessionManager;
