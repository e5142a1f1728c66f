//! Local text generation.
//!
//! - [`session`]: Single active model/context pair and its lifecycle
//! - [`engine`]: Prompt prefill and the token-by-token decode loop
//! - [`sampler`]: Next-token selection policies
//! - [`sink`]: Streaming of generated pieces to the caller
//! - [`telemetry`]: Memory footprint reporting
//! - [`llama_ffi`]: Backend adapter traits and the in-process stub backend
//! - [`model_loader`]: GGUF header inspection

pub mod engine;
pub mod llama_ffi;
pub mod model_loader;
pub mod sampler;
pub mod session;
pub mod sink;
pub mod telemetry;
