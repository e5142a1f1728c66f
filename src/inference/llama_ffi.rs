//! Backend adapter: the boundary to a llama.cpp-style execution library.
//!
//! The generation core only talks to the three traits defined here:
//! [`Backend`] (runtime + handle construction), [`BackendModel`] (weights
//! and vocabulary) and [`BackendContext`] (decode-time state). A native
//! binding implements them over `llama_model` / `llama_context` pointers.
//!
//! When no native library is linked, [`StubBackend`] simulates llama.cpp
//! with a byte-level vocabulary and an "echo" model: after the prompt is
//! evaluated, greedy decoding replays the prompt's bytes and then emits the
//! end-of-generation token. That makes end-to-end behaviour deterministic
//! for the CLI, the tests and the benches.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::inference::model_loader::{self, ModelMetadata};

#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Context creation failed: {0}")]
    ContextFailed(String),

    #[error("Token {token} has no text piece: {reason}")]
    PieceFailed { token: TokenId, reason: String },
}

/// Token ID type.
pub type TokenId = i32;

/// Largest text piece a single token may expand to.
pub const MAX_PIECE_BYTES: usize = 256;

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone)]
pub struct ModelParams {
    /// Number of layers to offload to an accelerator. Always 0 here.
    pub n_gpu_layers: i32,

    /// Use memory mapping for the model file.
    pub use_mmap: bool,

    /// Use memory locking.
    pub use_mlock: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Maximum tokens accepted by a single decode call.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_threads: 4,
        }
    }
}

/// Runtime-level operations of an execution backend.
pub trait Backend {
    type Model: BackendModel;
    type Context: BackendContext;

    /// Initialise process-wide backend state (llama_backend_init).
    fn init(&self);

    /// Release process-wide backend state (llama_backend_free).
    fn free(&self);

    /// Load weights and vocabulary from a model file.
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model, LlamaError>;

    /// Create decode-time state for `model`.
    fn new_context(
        &self,
        model: &Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context, LlamaError>;
}

/// A loaded model: vocabulary and weights.
pub trait BackendModel {
    fn n_vocab(&self) -> usize;

    /// Tokenize `text`, optionally prefixing the beginning-of-sequence token.
    /// `special` allows control-token markup in the text to map to control tokens.
    fn tokenize(&self, text: &str, add_bos: bool, special: bool)
        -> Result<Vec<TokenId>, LlamaError>;

    /// Text fragment of a single token. May be empty for control tokens.
    fn token_to_piece(&self, token: TokenId) -> Result<String, LlamaError>;

    /// Whether `token` marks the end of generation.
    fn is_eog(&self, token: TokenId) -> bool;

    /// Bytes occupied by the weights (llama_model_size).
    fn size_bytes(&self) -> u64;
}

/// Decode-time state bound to a model.
pub trait BackendContext {
    /// Configured capacity in tokens.
    fn n_ctx(&self) -> u32;

    /// Evaluate `tokens` starting at position `pos`. On success the scores
    /// for the position after the last token are available via [`logits`].
    ///
    /// [`logits`]: BackendContext::logits
    fn decode(&mut self, tokens: &[TokenId], pos: u32) -> Result<(), LlamaError>;

    /// Next-token scores from the most recent successful decode.
    fn logits(&self) -> &[f32];

    /// Drop all committed positions.
    fn kv_cache_clear(&mut self);

    /// Bytes needed to snapshot this context (llama_get_state_size).
    fn state_size(&self) -> usize;
}

// ─── Stub backend ──────────────────────────────────────────────────────────

/// Stub vocabulary layout: three control tokens followed by one token per byte.
pub mod vocab {
    use super::TokenId;

    pub const UNK: TokenId = 0;
    pub const BOS: TokenId = 1;
    pub const EOS: TokenId = 2;
    pub const BYTE_OFFSET: TokenId = 3;
    pub const N_VOCAB: usize = 3 + 256;

    pub fn byte_token(b: u8) -> TokenId {
        BYTE_OFFSET + b as TokenId
    }
}

/// In-process stand-in for the native library.
///
/// Counts live runtime/model/context objects so callers can observe that
/// everything created is also released.
#[derive(Debug, Clone, Default)]
pub struct StubBackend {
    counters: Arc<StubCounters>,
}

#[derive(Debug, Default)]
pub struct StubCounters {
    pub runtime_inits: AtomicUsize,
    pub runtime_frees: AtomicUsize,
    pub live_models: AtomicUsize,
    pub live_contexts: AtomicUsize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &StubCounters {
        &self.counters
    }
}

/// Stub model handle.
///
/// In a real implementation, this would wrap `*mut llama_model` from the C library.
pub struct LlamaModel {
    /// Model file path.
    pub path: String,

    /// Header metadata.
    pub metadata: ModelMetadata,

    counters: Arc<StubCounters>,
}

/// Stub context handle.
///
/// In a real implementation, this would wrap `*mut llama_context`.
pub struct LlamaContext {
    n_ctx: u32,
    n_batch: u32,
    state_bytes: usize,

    /// Committed tokens; the length is the KV cache fill level.
    history: Vec<TokenId>,

    /// Length of the batch submitted at position 0.
    prompt_len: usize,

    logits: Vec<f32>,

    counters: Arc<StubCounters>,
}

impl Backend for StubBackend {
    type Model = LlamaModel;
    type Context = LlamaContext;

    fn init(&self) {
        self.counters.runtime_inits.fetch_add(1, Ordering::SeqCst);
    }

    fn free(&self) {
        self.counters.runtime_frees.fetch_add(1, Ordering::SeqCst);
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<LlamaModel, LlamaError> {
        let metadata = model_loader::load_metadata(path)
            .map_err(|e| LlamaError::ModelLoadFailed(e.to_string()))?;

        debug!(
            path = %path.display(),
            n_gpu_layers = params.n_gpu_layers,
            use_mmap = params.use_mmap,
            "Stub model loaded"
        );

        self.counters.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(LlamaModel {
            path: path.display().to_string(),
            metadata,
            counters: self.counters.clone(),
        })
    }

    fn new_context(
        &self,
        model: &LlamaModel,
        params: &ContextParams,
    ) -> Result<LlamaContext, LlamaError> {
        if params.n_ctx == 0 || params.n_batch == 0 {
            return Err(LlamaError::ContextFailed(format!(
                "n_ctx ({}) and n_batch ({}) must be positive",
                params.n_ctx, params.n_batch
            )));
        }

        let state_bytes =
            model.metadata.kv_cache_size(params.n_ctx as usize) + vocab::N_VOCAB * 4;

        self.counters.live_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(LlamaContext {
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            state_bytes,
            history: Vec::new(),
            prompt_len: 0,
            logits: Vec::new(),
            counters: self.counters.clone(),
        })
    }
}

impl BackendModel for LlamaModel {
    fn n_vocab(&self) -> usize {
        vocab::N_VOCAB
    }

    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        special: bool,
    ) -> Result<Vec<TokenId>, LlamaError> {
        if text.contains('\0') {
            return Err(LlamaError::TokenizeFailed(
                "prompt contains an interior NUL byte".into(),
            ));
        }

        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(vocab::BOS);
        }

        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            if special {
                if let Some(tail) = rest.strip_prefix("</s>") {
                    tokens.push(vocab::EOS);
                    rest = tail;
                    continue;
                }
                if let Some(tail) = rest.strip_prefix("<s>") {
                    tokens.push(vocab::BOS);
                    rest = tail;
                    continue;
                }
            }
            let mut buf = [0u8; 4];
            tokens.extend(c.encode_utf8(&mut buf).bytes().map(vocab::byte_token));
            rest = &rest[c.len_utf8()..];
        }

        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String, LlamaError> {
        match token {
            vocab::UNK | vocab::BOS | vocab::EOS => Ok(String::new()),
            t if (vocab::BYTE_OFFSET..vocab::N_VOCAB as TokenId).contains(&t) => {
                let b = (t - vocab::BYTE_OFFSET) as u8;
                if b.is_ascii() {
                    Ok((b as char).to_string())
                } else {
                    Err(LlamaError::PieceFailed {
                        token,
                        reason: format!("byte 0x{b:02x} is not valid UTF-8 on its own"),
                    })
                }
            }
            _ => Err(LlamaError::PieceFailed {
                token,
                reason: "token id outside vocabulary".into(),
            }),
        }
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == vocab::EOS
    }

    fn size_bytes(&self) -> u64 {
        self.metadata.file_size
    }
}

impl Drop for LlamaModel {
    fn drop(&mut self) {
        self.counters.live_models.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LlamaContext {
    /// Echo prediction: the prompt's content tokens in order, then EOS.
    fn predict_next(&self) -> TokenId {
        let prompt = &self.history[..self.prompt_len];
        let first_content = usize::from(prompt.first() == Some(&vocab::BOS));
        let generated = self.history.len() - self.prompt_len;
        prompt
            .get(first_content + generated)
            .copied()
            .unwrap_or(vocab::EOS)
    }

    /// Get the current KV cache usage in tokens.
    pub fn kv_cache_used(&self) -> usize {
        self.history.len()
    }
}

impl BackendContext for LlamaContext {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn decode(&mut self, tokens: &[TokenId], pos: u32) -> Result<(), LlamaError> {
        if tokens.is_empty() {
            return Err(LlamaError::DecodeFailed("empty batch".into()));
        }
        if tokens.len() > self.n_batch as usize {
            return Err(LlamaError::DecodeFailed(format!(
                "batch of {} tokens exceeds n_batch {}",
                tokens.len(),
                self.n_batch
            )));
        }
        if pos as usize != self.history.len() {
            return Err(LlamaError::DecodeFailed(format!(
                "position {pos} does not follow the {} committed tokens",
                self.history.len()
            )));
        }
        if pos as usize + tokens.len() > self.n_ctx as usize {
            return Err(LlamaError::DecodeFailed(format!(
                "KV cache full ({} + {} > {})",
                pos,
                tokens.len(),
                self.n_ctx
            )));
        }
        if let Some(bad) = tokens
            .iter()
            .find(|t| !(0..vocab::N_VOCAB as TokenId).contains(*t))
        {
            return Err(LlamaError::DecodeFailed(format!("invalid token id {bad}")));
        }

        if pos == 0 {
            self.prompt_len = tokens.len();
        }
        self.history.extend_from_slice(tokens);

        let next = self.predict_next();
        self.logits.clear();
        self.logits.resize(vocab::N_VOCAB, 0.0);
        self.logits[next as usize] = 1.0;

        trace!(pos, n = tokens.len(), next, "Stub decode");
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn kv_cache_clear(&mut self) {
        self.history.clear();
        self.prompt_len = 0;
        self.logits.clear();
    }

    fn state_size(&self) -> usize {
        self.state_bytes
    }
}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        self.counters.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}
