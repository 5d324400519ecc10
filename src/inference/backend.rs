//! Engine collaborator interface
//!
//! The driver owns no tensor math. Everything it needs from the inference
//! engine (vocabulary, key/value cache edits, batch decode, sampling) is
//! expressed here so the control loop can run against llama.cpp or a stub.

use thiserror::Error;

use crate::types::{ContextParams, ModelParams, SamplingParams};

/// Vocabulary token id
pub type Token = i32;

/// Failures reported by the inference engine
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Detokenization failed: {0}")]
    Detokenization(String),

    #[error("Decode rejected at position {position}: {reason}")]
    Decode { position: i32, reason: String },

    #[error("KV cache operation failed: {0}")]
    KvCache(String),

    #[error("Sampler failed: {0}")]
    Sampler(String),
}

/// Loads models. One backend per process.
pub trait Backend {
    type Model: Model;

    fn load_model(&self, params: &ModelParams) -> Result<Self::Model, EngineError>;
}

/// A loaded, read-only model: vocabulary plus a factory for inference contexts.
pub trait Model {
    type Context<'m>: InferenceContext
    where
        Self: 'm;

    /// `parse_special` controls whether template markers such as
    /// `<|im_start|>` map to their special tokens.
    fn tokenize(&self, text: &str, add_bos: bool, parse_special: bool)
        -> Result<Vec<Token>, EngineError>;

    /// Raw bytes of a single token; may be a partial UTF-8 sequence.
    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError>;

    fn token_bos(&self) -> Token;

    fn token_eos(&self) -> Token;

    /// Whether prompts for this model start with a beginning-of-sequence token
    fn add_bos(&self) -> bool;

    fn new_context(&self, params: &ContextParams) -> Result<Self::Context<'_>, EngineError>;

    /// Lossy text for a run of tokens
    fn detokenize(&self, tokens: &[Token]) -> Result<String, EngineError> {
        let mut bytes = Vec::new();
        for &token in tokens {
            bytes.extend(self.token_to_bytes(token)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Position edits on sequence 0 of the key/value cache.
///
/// Ranges are half-open `[p0, p1)`.
pub trait KvCache {
    fn kv_remove(&mut self, p0: i32, p1: i32) -> Result<(), EngineError>;

    fn kv_shift(&mut self, p0: i32, p1: i32, delta: i32) -> Result<(), EngineError>;

    fn kv_divide(&mut self, p0: i32, p1: i32, divisor: i32) -> Result<(), EngineError>;
}

/// Engine-owned sampling state (history for penalties, grammar, mirostat).
pub trait TokenSampler {
    /// Record a token. Grammar state only advances when `apply_grammar` is set.
    fn accept(&mut self, token: Token, apply_grammar: bool);
}

/// One inference context with its key/value cache.
pub trait InferenceContext: KvCache {
    type Sampler: TokenSampler;

    /// Context capacity in tokens
    fn n_ctx(&self) -> u32;

    /// Evaluate `tokens` at positions `n_past..n_past + tokens.len()`.
    fn decode(&mut self, tokens: &[Token], n_past: i32) -> Result<(), EngineError>;

    fn new_sampler(&self, params: &SamplingParams) -> Result<Self::Sampler, EngineError>;

    /// Pick the next token from the logits of the last decoded position,
    /// blended with the guidance context's logits when one is given.
    fn sample(&self, sampler: &mut Self::Sampler, guidance: Option<&Self>)
        -> Result<Token, EngineError>;
}
