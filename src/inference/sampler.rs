//! Next-token selection.

use crate::inference::llama_ffi::TokenId;

/// Something which selects a token from the scores output by the backend.
///
/// The generation loop only relies on this being total: every call returns
/// some token id, and the loop itself decides what to do with it.
pub trait Sampler {
    /// Pick a token from `logits`, whose first `n_vocab` entries are the
    /// scores of the vocabulary in id order.
    fn sample(&mut self, logits: &[f32], n_vocab: usize) -> TokenId;
}

/// Deterministic argmax. Ties go to the lowest token id; NaN scores are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(&mut self, logits: &[f32], n_vocab: usize) -> TokenId {
        argmax(&logits[..n_vocab.min(logits.len())])
    }
}

/// Closures can stand in for a sampler.
impl<F> Sampler for F
where
    F: FnMut(&[f32], usize) -> TokenId,
{
    fn sample(&mut self, logits: &[f32], n_vocab: usize) -> TokenId {
        self(logits, n_vocab)
    }
}

/// Index of the first maximal score, 0 for an empty or all-NaN slice.
pub fn argmax(scores: &[f32]) -> TokenId {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if score <= b => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i as TokenId).unwrap_or(0)
}
