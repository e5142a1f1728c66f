//! Method-style call surface with integer status codes.
//!
//! Mirrors the host binding contract: `0` for success, a negative
//! [`GaugeError::status_code`](crate::error::GaugeError::status_code) on
//! failure, and a non-negative token count from [`NativeLib::run_inference`].

use parking_lot::Mutex;
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::STATUS_OK;
use crate::inference::engine::{GenerationOutcome, GenerationRequest};
use crate::inference::llama_ffi::{Backend, StubBackend};
use crate::inference::session::SessionManager;
use crate::inference::sink::StepTiming;

/// Status-code facade over a [`SessionManager`].
pub struct NativeLib<B: Backend = StubBackend> {
    manager: SessionManager<B>,
    last_outcome: Mutex<Option<GenerationOutcome>>,
}

impl NativeLib<StubBackend> {
    pub fn new(config: ModelConfig) -> Self {
        Self::with_backend(StubBackend::new(), config)
    }
}

impl<B: Backend> NativeLib<B> {
    pub fn with_backend(backend: B, config: ModelConfig) -> Self {
        Self {
            manager: SessionManager::new(backend, config),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &SessionManager<B> {
        &self.manager
    }

    /// Returns 0 on success, negative on failure.
    pub fn load_model(&self, path: &str) -> i32 {
        match self.manager.load(path) {
            Ok(()) => STATUS_OK,
            Err(e) => e.status_code(),
        }
    }

    /// Register a callback invoked with each piece and its step latency in
    /// milliseconds.
    pub fn set_token_callback(&self, mut callback: impl FnMut(&str, i64) + Send + 'static) {
        self.manager
            .set_sink(move |piece: &str, timing: StepTiming| {
                callback(piece, timing.step_ms as i64)
            });
    }

    pub fn clear_token_callback(&self) {
        self.manager.clear_sink();
    }

    /// Returns the number of tokens generated, or a negative status.
    /// A negative `max_tokens` generates nothing.
    pub fn run_inference(&self, prompt: &str, max_tokens: i32) -> i32 {
        *self.last_outcome.lock() = None;

        let request = GenerationRequest::new(prompt, max_tokens.max(0) as usize);
        match self.manager.generate(&request) {
            Ok(outcome) => {
                let generated = i32::try_from(outcome.tokens_generated).unwrap_or(i32::MAX);
                if let Some(failure) = &outcome.failure {
                    debug!(error = %failure, generated, "Generation ended early");
                }
                *self.last_outcome.lock() = Some(outcome);
                generated
            }
            Err(e) => e.status_code(),
        }
    }

    pub fn get_ram_usage_mb(&self) -> f64 {
        self.manager.memory_usage_mb()
    }

    pub fn dispose_model(&self) {
        self.manager.dispose();
        *self.last_outcome.lock() = None;
    }

    /// Text of the most recent generation; empty after a failed run or dispose.
    pub fn generated_text(&self) -> String {
        self.last_outcome
            .lock()
            .as_ref()
            .map(|o| o.text.clone())
            .unwrap_or_default()
    }

    pub fn last_outcome(&self) -> Option<GenerationOutcome> {
        self.last_outcome.lock().clone()
    }
}
