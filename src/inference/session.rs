//! Session management: the single active (model, context) pair.
//!
//! A [`ModelSession`] owns a model handle and the execution context built
//! from it. Fields drop in declaration order, so the context is always
//! released before the model it depends on, on every exit path.
//!
//! The [`SessionManager`] holds at most one session behind a lock. Load,
//! generate and dispose each take the lock for their whole duration, so
//! they are mutually exclusive; a second caller blocks until the first
//! finishes.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ModelConfig;
use crate::error::{GaugeError, Result};
use crate::inference::engine::{GenerationOutcome, GenerationRequest, InferenceEngine};
use crate::inference::llama_ffi::{Backend, BackendContext, BackendModel};
use crate::inference::sampler::Sampler;
use crate::inference::sink::{NullSink, TokenSink};
use crate::inference::telemetry::MemoryReport;

/// A loaded model and its execution context, created and released together.
pub struct ModelSession<B: Backend> {
    /// Declared before `model` so it is dropped first.
    pub(crate) context: B::Context,
    pub(crate) model: B::Model,

    /// Next position to write in the context.
    pub(crate) position: u32,

    path: PathBuf,
}

impl<B: Backend> ModelSession<B> {
    /// Load the model at `path` and build a context for it. If the context
    /// cannot be created the model is released before returning.
    pub fn open(backend: &B, path: &Path, config: &ModelConfig) -> Result<Self> {
        let model = backend
            .load_model(path, &config.model_params())
            .map_err(|e| GaugeError::model_load(path, e))?;

        let context_params = config.context_params();
        let context = backend
            .new_context(&model, &context_params)
            .map_err(|e| GaugeError::ContextCreationFailure(e.to_string()))?;

        info!(
            path = %path.display(),
            n_ctx = context_params.n_ctx,
            n_batch = context_params.n_batch,
            n_threads = context_params.n_threads,
            "Model loaded"
        );

        Ok(Self {
            context,
            model,
            position: 0,
            path: path.to_path_buf(),
        })
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn capacity(&self) -> u32 {
        self.context.n_ctx()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn memory_report(&self) -> MemoryReport {
        MemoryReport {
            model_bytes: self.model.size_bytes(),
            context_bytes: self.context.state_size() as u64,
        }
    }
}

impl<B: Backend> Drop for ModelSession<B> {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Releasing context and model");
    }
}

struct ManagerState<B: Backend> {
    session: Option<ModelSession<B>>,
    runtime_active: bool,
    sink: Option<Box<dyn TokenSink + Send>>,
    engine: InferenceEngine,
}

/// Owner of the single active session.
pub struct SessionManager<B: Backend> {
    backend: B,
    config: ModelConfig,
    state: Mutex<ManagerState<B>>,
}

impl<B: Backend> SessionManager<B> {
    pub fn new(backend: B, config: ModelConfig) -> Self {
        let engine = InferenceEngine::new(&config);
        Self {
            backend,
            config,
            state: Mutex::new(ManagerState {
                session: None,
                runtime_active: false,
                sink: None,
                engine,
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Load a model, replacing the active one.
    ///
    /// The previous context and model are released before anything new is
    /// acquired. On failure no session is active.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut state = self.state.lock();

        if let Some(previous) = state.session.take() {
            info!(previous = %previous.path().display(), "Replacing loaded model");
            drop(previous);
        }

        if !state.runtime_active {
            self.backend.init();
            state.runtime_active = true;
        }

        info!(path = %path.display(), "Loading model");
        match ModelSession::open(&self.backend, path, &self.config) {
            Ok(session) => {
                state.session = Some(session);
                Ok(())
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load model");
                Err(e)
            }
        }
    }

    /// Release the session and the backend runtime and forget the
    /// registered sink. Calling it with nothing loaded is a no-op.
    pub fn dispose(&self) {
        let mut state = self.state.lock();

        let had_session = state.session.take().is_some();
        if state.runtime_active {
            self.backend.free();
            state.runtime_active = false;
        }
        state.sink = None;

        if had_session {
            info!("Model disposed");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Register the sink used by [`generate`](Self::generate).
    pub fn set_sink(&self, sink: impl TokenSink + Send + 'static) {
        self.state.lock().sink = Some(Box::new(sink));
    }

    pub fn clear_sink(&self) {
        self.state.lock().sink = None;
    }

    /// Replace the sampling policy for subsequent generations.
    pub fn set_sampler(&self, sampler: impl Sampler + Send + 'static) {
        self.state.lock().engine.set_sampler(Box::new(sampler));
    }

    /// Generate with the registered sink, if any.
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(session) = state.session.as_mut() else {
            warn!(request_id = %request.request_id, "Generation requested with no model loaded");
            return Err(GaugeError::NotLoaded);
        };

        let mut null = NullSink;
        let sink: &mut dyn TokenSink = match state.sink.as_mut() {
            Some(sink) => sink.as_mut(),
            None => &mut null,
        };
        state.engine.generate(session, request, sink)
    }

    /// Generate, streaming to `sink` instead of the registered sink.
    pub fn generate_with(
        &self,
        request: &GenerationRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationOutcome> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(session) = state.session.as_mut() else {
            warn!(request_id = %request.request_id, "Generation requested with no model loaded");
            return Err(GaugeError::NotLoaded);
        };
        state.engine.generate(session, request, sink)
    }

    /// Committed positions of the active session.
    pub fn position(&self) -> Option<u32> {
        self.state.lock().session.as_ref().map(ModelSession::position)
    }

    pub fn capacity(&self) -> Option<u32> {
        self.state.lock().session.as_ref().map(ModelSession::capacity)
    }

    pub fn memory_report(&self) -> MemoryReport {
        self.state
            .lock()
            .session
            .as_ref()
            .map(ModelSession::memory_report)
            .unwrap_or_default()
    }

    /// Model plus context footprint in megabytes; 0 when nothing is loaded.
    pub fn memory_usage_mb(&self) -> f64 {
        self.memory_report().total_mb()
    }
}

impl<B: Backend> Drop for SessionManager<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}
