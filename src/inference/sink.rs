//! Token streaming.
//!
//! A [`TokenSink`] is invoked synchronously from the generation loop, once
//! per emitted token with a non-empty text piece, strictly in generation
//! order. A slow sink stalls generation; a sink must not call back into the
//! session manager that is driving it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Timing attached to each streamed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepTiming {
    /// Time spent selecting and converting this token, in milliseconds.
    pub step_ms: u64,

    /// Time since the first decode step started, in milliseconds.
    /// Non-decreasing across a generation.
    pub elapsed_ms: u64,
}

/// Receives streamed tokens.
pub trait TokenSink {
    fn on_token(&mut self, piece: &str, timing: StepTiming);
}

impl<F> TokenSink for F
where
    F: FnMut(&str, StepTiming),
{
    fn on_token(&mut self, piece: &str, timing: StepTiming) {
        self(piece, timing)
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TokenSink for NullSink {
    fn on_token(&mut self, _piece: &str, _timing: StepTiming) {}
}

/// A streamed token as seen by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenEvent {
    pub piece: String,
    pub timing: StepTiming,
}

/// Sink that records every event behind a shared handle, so a copy can be
/// registered with a session while the caller keeps another to inspect.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TokenEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TokenEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Concatenation of all recorded pieces.
    pub fn text(&self) -> String {
        self.events.lock().iter().map(|e| e.piece.as_str()).collect()
    }
}

impl TokenSink for RecordingSink {
    fn on_token(&mut self, piece: &str, timing: StepTiming) {
        self.events.lock().push(TokenEvent {
            piece: piece.to_string(),
            timing,
        });
    }
}
