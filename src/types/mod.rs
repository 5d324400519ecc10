//! Shared data types
//!
//! Transcript messages and the generation configuration snapshot.

pub mod config;
pub mod message;

pub use config::{
    ConfigError, ContextParams, GenerationConfig, MirostatMode, ModelParams, NumaStrategy,
    PredictLimit, PromptParams, RopeScalingType, SamplingParams, SplitMode, TemplateMode,
};
pub use message::{ChatMessage, Role, Transcript};
