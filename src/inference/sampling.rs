//! Sampling context
//!
//! Wraps the engine's sampler with the recent-token history the stop
//! controller reads from. One instance per generation call.

use std::collections::VecDeque;

use crate::inference::backend::{EngineError, InferenceContext, Model, Token, TokenSampler};

/// Engine sampler plus a bounded ring of accepted tokens
pub struct SamplingContext<S> {
    sampler: S,
    prev: VecDeque<Token>,
    capacity: usize,
}

impl<S: TokenSampler> SamplingContext<S> {
    /// `n_prev` bounds the history; it is raised to at least `min_history`
    /// so antiprompt matching always has its lookback available.
    pub fn new(sampler: S, n_prev: usize, min_history: usize) -> Self {
        let capacity = n_prev.max(min_history).max(1);
        Self {
            sampler,
            prev: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Draw the next token from the context's last logits
    pub fn sample<C>(&mut self, ctx: &C, guidance: Option<&C>) -> Result<Token, EngineError>
    where
        C: InferenceContext<Sampler = S>,
    {
        ctx.sample(&mut self.sampler, guidance)
    }

    /// Record a token. Replayed prompt tokens pass `apply_grammar = false`
    /// so the grammar only constrains freshly generated text.
    pub fn accept(&mut self, token: Token, apply_grammar: bool) {
        self.sampler.accept(token, apply_grammar);
        if self.prev.len() == self.capacity {
            self.prev.pop_front();
        }
        self.prev.push_back(token);
    }

    /// Most recently accepted token
    pub fn last(&self) -> Option<Token> {
        self.prev.back().copied()
    }

    /// Up to `n` most recent tokens, oldest first
    pub fn recent(&self, n: usize) -> Vec<Token> {
        let skip = self.prev.len().saturating_sub(n);
        self.prev.iter().skip(skip).copied().collect()
    }

    /// Detokenized text of the last `n` accepted tokens
    pub fn recent_text<M: Model>(&self, model: &M, n: usize) -> Result<String, EngineError> {
        model.detokenize(&self.recent(n))
    }
}

/// Blend classifier-free guidance into `logits` in place.
///
/// Both rows are log-softmax normalised, then
/// `out = guidance + scale * (logits - guidance)`.
pub fn apply_guidance(logits: &mut [f32], guidance: &[f32], scale: f32) {
    let main = log_softmax(logits);
    let neg = log_softmax(guidance);
    for ((out, m), g) in logits.iter_mut().zip(main).zip(neg) {
        *out = scale * (m - g) + g;
    }
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum();
    let log_sum = sum.ln();
    logits.iter().map(|&l| l - max - log_sum).collect()
}
