//! Prompt evaluation and the autoregressive decode loop.
//!
//! The engine is driven by the session manager with exclusive access to the
//! active [`ModelSession`]. For each request it:
//! 1. Tokenizes the prompt and checks it against the context capacity
//! 2. Evaluates the whole prompt in one batch (prefill)
//! 3. Selects, commits and emits one token at a time until the end-of-generation
//!    token, the token budget, a cancellation or a backend failure
//!
//! Failures inside the loop end the generation early but are reported in
//! the [`GenerationOutcome`] rather than as errors; the session stays usable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Serialize, Serializer};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ModelConfig;
use crate::error::{GaugeError, Result};
use crate::inference::llama_ffi::{
    Backend, BackendContext, BackendModel, LlamaError, TokenId, MAX_PIECE_BYTES,
};
use crate::inference::sampler::{GreedySampler, Sampler};
use crate::inference::session::ModelSession;
use crate::inference::sink::{StepTiming, TokenSink};

/// Shared flag a host can set to stop a running generation. Polled once per
/// decode step.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique request ID, used in logs.
    pub request_id: String,

    /// Prompt text.
    pub prompt: String,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Optional cancellation point.
    pub cancel: Option<CancelFlag>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            max_tokens,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Why the decode loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced its end-of-generation token.
    EndOfGeneration,
    /// `max_tokens` iterations ran.
    MaxTokensReached,
    /// The request's cancel flag was set.
    Cancelled,
    /// Committing a token to the context failed.
    StepDecodeFailure,
    /// A selected token could not be turned into text.
    EmitFailure,
}

impl StopReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, StopReason::StepDecodeFailure | StopReason::EmitFailure)
    }
}

/// Result of a generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub request_id: String,

    /// Tokens committed after the prompt. Each non-empty piece was handed to the sink.
    pub tokens_generated: usize,

    /// Concatenation of the emitted pieces.
    pub text: String,

    pub stop_reason: StopReason,

    /// The error behind a failure stop reason.
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "display_failure")]
    pub failure: Option<GaugeError>,

    /// Tokens evaluated during prefill.
    pub prompt_tokens: usize,

    /// Committed positions in the context when the loop stopped.
    pub position: u32,

    pub prefill_ms: f64,
    pub decode_ms: f64,
}

impl GenerationOutcome {
    /// Decode throughput, excluding prefill.
    pub fn tokens_per_sec(&self) -> f64 {
        if self.decode_ms <= 0.0 {
            return 0.0;
        }
        self.tokens_generated as f64 / (self.decode_ms / 1000.0)
    }
}

/// The inference engine: tokenization settings plus the active sampling policy.
pub struct InferenceEngine {
    sampler: Box<dyn Sampler + Send>,
    add_bos: bool,
    parse_special: bool,
}

impl InferenceEngine {
    /// Create an engine with greedy sampling.
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            sampler: Box::new(GreedySampler),
            add_bos: config.add_bos,
            parse_special: config.parse_special,
        }
    }

    /// Replace the sampling policy for subsequent generations.
    pub fn set_sampler(&mut self, sampler: Box<dyn Sampler + Send>) {
        self.sampler = sampler;
    }

    /// Tokenize `prompt` and evaluate it from position 0.
    ///
    /// Any previously committed positions are discarded first. On failure
    /// the context is left empty; nothing partial is committed. Returns the
    /// number of prompt tokens.
    pub fn prefill<B: Backend>(&self, session: &mut ModelSession<B>, prompt: &str) -> Result<usize> {
        let tokens = session
            .model
            .tokenize(prompt, self.add_bos, self.parse_special)
            .map_err(|e| GaugeError::TokenizationFailure(e.to_string()))?;

        if tokens.is_empty() {
            warn!("Prompt produced no tokens");
            return Err(GaugeError::PrefillFailure("empty batch".into()));
        }

        let capacity = session.context.n_ctx() as usize;
        if tokens.len() > capacity {
            warn!(needed = tokens.len(), capacity, "Prompt does not fit in context");
            return Err(GaugeError::CapacityExceeded {
                needed: tokens.len(),
                capacity,
            });
        }

        session.context.kv_cache_clear();
        session.position = 0;

        if let Err(e) = session.context.decode(&tokens, 0) {
            session.context.kv_cache_clear();
            warn!(n_tokens = tokens.len(), error = %e, "Prompt evaluation failed");
            return Err(GaugeError::PrefillFailure(e.to_string()));
        }

        session.position = tokens.len() as u32;
        debug!(n_tokens = tokens.len(), "Prompt evaluated");
        Ok(tokens.len())
    }

    /// Run a generation request, streaming pieces to `sink`.
    pub fn generate<B: Backend>(
        &mut self,
        session: &mut ModelSession<B>,
        request: &GenerationRequest,
        sink: &mut dyn TokenSink,
    ) -> Result<GenerationOutcome> {
        info!(
            request_id = %request.request_id,
            prompt_bytes = request.prompt.len(),
            max_tokens = request.max_tokens,
            "Starting generation"
        );

        let prefill_start = Instant::now();
        let prompt_tokens = self.prefill(session, &request.prompt)?;
        let prefill_ms = prefill_start.elapsed().as_secs_f64() * 1000.0;

        let n_vocab = session.model.n_vocab();
        let capacity = session.context.n_ctx();
        let decode_start = Instant::now();

        let mut outcome = GenerationOutcome {
            request_id: request.request_id.clone(),
            tokens_generated: 0,
            text: String::new(),
            stop_reason: StopReason::MaxTokensReached,
            failure: None,
            prompt_tokens,
            position: session.position,
            prefill_ms,
            decode_ms: 0.0,
        };

        for _ in 0..request.max_tokens {
            if request.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                outcome.stop_reason = StopReason::Cancelled;
                break;
            }

            let step_start = Instant::now();
            let token = self.sampler.sample(session.context.logits(), n_vocab);

            if session.model.is_eog(token) {
                outcome.stop_reason = StopReason::EndOfGeneration;
                break;
            }

            // Tokens reach the sink only after they are committed.
            let pos = session.position;
            if pos >= capacity {
                warn!(request_id = %request.request_id, pos, capacity, "Context full");
                outcome.stop_reason = StopReason::StepDecodeFailure;
                outcome.failure = Some(GaugeError::StepDecodeFailure {
                    position: pos,
                    reason: format!("context full at {pos} of {capacity} tokens"),
                });
                break;
            }

            let piece = match piece_for(&session.model, token) {
                Ok(piece) => piece,
                Err(e) => {
                    warn!(request_id = %request.request_id, token, error = %e, "Failed to convert token to text");
                    outcome.stop_reason = StopReason::EmitFailure;
                    outcome.failure = Some(GaugeError::EmitFailure {
                        token,
                        reason: e.to_string(),
                    });
                    break;
                }
            };

            if let Err(e) = session.context.decode(&[token], pos) {
                warn!(request_id = %request.request_id, pos, error = %e, "Failed to evaluate token");
                outcome.stop_reason = StopReason::StepDecodeFailure;
                outcome.failure = Some(GaugeError::StepDecodeFailure {
                    position: pos,
                    reason: e.to_string(),
                });
                break;
            }
            session.position += 1;
            outcome.tokens_generated += 1;

            if !piece.is_empty() {
                let timing = StepTiming {
                    step_ms: step_start.elapsed().as_millis() as u64,
                    elapsed_ms: decode_start.elapsed().as_millis() as u64,
                };
                trace!(token, piece = %piece, step_ms = timing.step_ms, "Emitting token");
                sink.on_token(&piece, timing);
                outcome.text.push_str(&piece);
            }
        }

        outcome.position = session.position;
        outcome.decode_ms = decode_start.elapsed().as_secs_f64() * 1000.0;

        info!(
            request_id = %request.request_id,
            prompt_tokens,
            generated = outcome.tokens_generated,
            stop_reason = ?outcome.stop_reason,
            tokens_per_sec = outcome.tokens_per_sec(),
            "Generation complete"
        );

        Ok(outcome)
    }
}

fn display_failure<S: Serializer>(
    failure: &Option<GaugeError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match failure {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

fn piece_for<M: BackendModel>(model: &M, token: TokenId) -> std::result::Result<String, LlamaError> {
    let piece = model.token_to_piece(token)?;
    if piece.len() > MAX_PIECE_BYTES {
        return Err(LlamaError::PieceFailed {
            token,
            reason: format!("piece of {} bytes exceeds {MAX_PIECE_BYTES}", piece.len()),
        });
    }
    Ok(piece)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::inference::llama_ffi::{vocab, StubBackend};
    use crate::inference::model_loader::write_test_header;
    use crate::inference::sink::{NullSink, RecordingSink};
    use std::io::Write;

    fn stub_session(n_ctx: u32) -> (tempfile::NamedTempFile, ModelSession<StubBackend>) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write_test_header(&mut file, "llama", &[("block_count", 2)], 8).unwrap();
        file.flush().unwrap();

        let mut config = Config::default().model;
        config.n_ctx = n_ctx;
        let session = ModelSession::open(&StubBackend::new(), file.path(), &config).unwrap();
        (file, session)
    }

    fn engine() -> InferenceEngine {
        InferenceEngine::new(&Config::default().model)
    }

    #[test]
    fn test_generation_echoes_prompt_until_eog() {
        let (_file, mut session) = stub_session(64);
        let sink = RecordingSink::new();
        let request = GenerationRequest::new("Hey", 10);

        let outcome = engine()
            .generate(&mut session, &request, &mut sink.clone())
            .unwrap();

        assert_eq!(outcome.tokens_generated, 3);
        assert_eq!(outcome.text, "Hey");
        assert_eq!(outcome.stop_reason, StopReason::EndOfGeneration);
        assert_eq!(sink.text(), "Hey");
        // BOS + 3 prompt bytes, then one committed position per emitted token.
        assert_eq!(outcome.prompt_tokens, 4);
        assert_eq!(session.position(), 4 + 3);
    }

    #[test]
    fn test_max_tokens_bounds_generation() {
        let (_file, mut session) = stub_session(64);
        let request = GenerationRequest::new("Hello world", 4);

        let outcome = engine().generate(&mut session, &request, &mut NullSink).unwrap();

        assert_eq!(outcome.tokens_generated, 4);
        assert_eq!(outcome.text, "Hell");
        assert_eq!(outcome.stop_reason, StopReason::MaxTokensReached);
        assert_eq!(outcome.position as usize, outcome.prompt_tokens + 4);
    }

    #[test]
    fn test_zero_max_tokens_emits_nothing() {
        let (_file, mut session) = stub_session(64);
        let sink = RecordingSink::new();
        let request = GenerationRequest::new("Hello", 0);

        let outcome = engine()
            .generate(&mut session, &request, &mut sink.clone())
            .unwrap();

        assert_eq!(outcome.tokens_generated, 0);
        assert_eq!(outcome.stop_reason, StopReason::MaxTokensReached);
        assert!(sink.is_empty());
        assert_eq!(session.position(), 6);
    }

    #[test]
    fn test_capacity_exceeded_commits_nothing() {
        let (_file, mut session) = stub_session(4);
        let request = GenerationRequest::new("Hello", 10);

        let err = engine().generate(&mut session, &request, &mut NullSink).unwrap_err();

        assert!(matches!(
            err,
            GaugeError::CapacityExceeded { needed: 6, capacity: 4 }
        ));
        assert_eq!(session.context.kv_cache_used(), 0);
        assert_eq!(session.position(), 0);
    }

    #[test]
    fn test_emit_failure_returns_partial_outcome() {
        let (_file, mut session) = stub_session(64);
        let request = GenerationRequest::new("ab\u{e9}cd", 10);

        let outcome = engine().generate(&mut session, &request, &mut NullSink).unwrap();

        assert_eq!(outcome.stop_reason, StopReason::EmitFailure);
        assert_eq!(outcome.tokens_generated, 2);
        assert_eq!(outcome.text, "ab");
        assert!(outcome.stop_reason.is_failure());
        assert!(matches!(
            outcome.failure,
            Some(GaugeError::EmitFailure { token, .. }) if token == vocab::byte_token(0xC3)
        ));
    }

    #[test]
    fn test_context_full_stops_with_step_decode_failure() {
        // BOS + 5 bytes fills 6 of 8 slots; two more tokens fit.
        let (_file, mut session) = stub_session(8);
        let sink = RecordingSink::new();
        let request = GenerationRequest::new("Hello", 10);

        let outcome = engine()
            .generate(&mut session, &request, &mut sink.clone())
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::StepDecodeFailure);
        assert!(matches!(
            outcome.failure,
            Some(GaugeError::StepDecodeFailure { position: 8, .. })
        ));
        assert_eq!(outcome.tokens_generated, 2);
        assert_eq!(outcome.text, "He");
        assert_eq!(sink.len(), 2);
        assert_eq!(outcome.position as usize, outcome.prompt_tokens + outcome.tokens_generated);
        assert_eq!(session.context.kv_cache_used(), 8);
    }

    #[test]
    fn test_empty_prompt_without_bos_is_prefill_failure() {
        let (_file, mut session) = stub_session(64);
        let mut config = Config::default().model;
        config.add_bos = false;

        let err = InferenceEngine::new(&config)
            .generate(&mut session, &GenerationRequest::new("", 5), &mut NullSink)
            .unwrap_err();

        assert!(matches!(err, GaugeError::PrefillFailure(_)));
        assert_eq!(session.context.kv_cache_used(), 0);
    }

    #[test]
    fn test_cancel_before_first_step() {
        let (_file, mut session) = stub_session(64);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let request = GenerationRequest::new("Hello", 10).with_cancel(cancel);

        let outcome = engine().generate(&mut session, &request, &mut NullSink).unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(outcome.tokens_generated, 0);
    }

    #[test]
    fn test_cancel_from_sink() {
        let (_file, mut session) = stub_session(64);
        let cancel = CancelFlag::new();
        let request = GenerationRequest::new("Hello", 10).with_cancel(cancel.clone());

        let mut seen = 0;
        let mut sink = |_: &str, _: StepTiming| {
            seen += 1;
            if seen == 2 {
                cancel.cancel();
            }
        };
        let outcome = engine().generate(&mut session, &request, &mut sink).unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(outcome.tokens_generated, 2);
        assert_eq!(outcome.text, "He");
    }

    #[test]
    fn test_custom_sampler_replaces_greedy() {
        let (_file, mut session) = stub_session(64);
        let mut engine = engine();
        engine.set_sampler(Box::new(|_: &[f32], _: usize| vocab::byte_token(b'z')));

        let outcome = engine
            .generate(&mut session, &GenerationRequest::new("a", 3), &mut NullSink)
            .unwrap();
        assert_eq!(outcome.text, "zzz");
    }

    #[test]
    fn test_second_generation_restarts_from_zero() {
        let (_file, mut session) = stub_session(64);
        let mut engine = engine();

        engine
            .generate(&mut session, &GenerationRequest::new("abc", 10), &mut NullSink)
            .unwrap();
        let outcome = engine
            .generate(&mut session, &GenerationRequest::new("xy", 10), &mut NullSink)
            .unwrap();

        assert_eq!(outcome.text, "xy");
        assert_eq!(outcome.position, 3 + 2);
    }

    #[test]
    fn test_tokenization_failure() {
        let (_file, mut session) = stub_session(64);
        let err = engine()
            .generate(&mut session, &GenerationRequest::new("a\0", 3), &mut NullSink)
            .unwrap_err();
        assert!(matches!(err, GaugeError::TokenizationFailure(_)));
    }

    #[test]
    fn test_timing_is_non_decreasing() {
        let (_file, mut session) = stub_session(64);
        let sink = RecordingSink::new();
        engine()
            .generate(
                &mut session,
                &GenerationRequest::new("abcdefgh", 8),
                &mut sink.clone(),
            )
            .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 8);
        assert!(events
            .windows(2)
            .all(|w| w[0].timing.elapsed_ms <= w[1].timing.elapsed_ms));
    }
}
