//! Generation driver
//!
//! The control loop over an inference engine: transcript formatting, context
//! window management, batched decode, sampling with stop detection and
//! streamed output. `llama` binds the loop to llama.cpp.

pub mod backend;
pub mod decode;
pub mod engine;
pub mod formatter;
pub mod llama;
pub mod model;
pub mod sampling;
pub mod stop;
pub mod streaming;
pub mod window;

#[cfg(test)]
pub(crate) mod stub;

// Re-export main types for convenience
pub use backend::{Backend, EngineError, InferenceContext, KvCache, Model, Token, TokenSampler};
pub use engine::{
    GenerationSession, GenerationSummary, SessionError, SessionState, StopHandle, StopReason,
};
pub use llama::{LlamaCppBackend, LlamaCppModel};
pub use model::{validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use streaming::StreamChunk;
