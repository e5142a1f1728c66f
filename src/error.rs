//! Error kinds surfaced by the generation core.
//!
//! Every public operation returns one of these as an explicit value. The
//! status-code surfaces ([`crate::api`], [`crate::ffi`]) flatten them into
//! negative integers via [`GaugeError::status_code`].

use thiserror::Error;

/// Status code returned by the call surfaces on success.
pub const STATUS_OK: i32 = 0;

#[derive(Error, Debug, Clone)]
pub enum GaugeError {
    #[error("No model loaded")]
    NotLoaded,

    #[error("Failed to load model from {path}: {reason}")]
    ModelLoadFailure { path: String, reason: String },

    #[error("Failed to create execution context: {0}")]
    ContextCreationFailure(String),

    #[error("Tokenization failed: {0}")]
    TokenizationFailure(String),

    #[error("Prompt needs {needed} tokens but the context holds {capacity}")]
    CapacityExceeded { needed: usize, capacity: usize },

    #[error("Prompt evaluation failed: {0}")]
    PrefillFailure(String),

    #[error("Decode failed at position {position}: {reason}")]
    StepDecodeFailure { position: u32, reason: String },

    #[error("Failed to convert token {token} to text: {reason}")]
    EmitFailure { token: i32, reason: String },
}

impl GaugeError {
    /// Negative status code for this error kind.
    pub fn status_code(&self) -> i32 {
        match self {
            GaugeError::NotLoaded => -1,
            GaugeError::ModelLoadFailure { .. } => -2,
            GaugeError::ContextCreationFailure(_) => -3,
            GaugeError::TokenizationFailure(_) => -4,
            GaugeError::CapacityExceeded { .. } => -5,
            GaugeError::PrefillFailure(_) => -6,
            GaugeError::StepDecodeFailure { .. } => -7,
            GaugeError::EmitFailure { .. } => -8,
        }
    }

    pub(crate) fn model_load(path: &std::path::Path, reason: impl ToString) -> Self {
        GaugeError::ModelLoadFailure {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GaugeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct_and_negative() {
        let errors = [
            GaugeError::NotLoaded,
            GaugeError::model_load(std::path::Path::new("m.gguf"), "bad"),
            GaugeError::ContextCreationFailure("x".into()),
            GaugeError::TokenizationFailure("x".into()),
            GaugeError::CapacityExceeded { needed: 10, capacity: 4 },
            GaugeError::PrefillFailure("x".into()),
            GaugeError::StepDecodeFailure { position: 3, reason: "x".into() },
            GaugeError::EmitFailure { token: 7, reason: "x".into() },
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.status_code()).collect();
        assert!(codes.iter().all(|c| *c < STATUS_OK));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
