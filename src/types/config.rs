//! Generation configuration
//!
//! A single immutable snapshot of model placement, context sizing, sampling
//! strategy and prompt formatting, taken once at session setup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration values that cannot be clamped into a usable range
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Batch size must be at least 1")]
    ZeroBatch,

    #[error("Context size {0} leaves no room for input (must exceed 4)")]
    ContextTooSmall(u32),

    #[error("Group-attention factor must be at least 1")]
    ZeroGroupFactor,

    #[error("Group-attention width {width} must be a multiple of factor {factor} and at least as large")]
    GroupWidth { factor: u32, width: u32 },
}

/// How the model is split across multiple GPUs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// Single GPU
    None,
    /// Split layers and KV across GPUs
    #[default]
    Layer,
    /// Split rows across GPUs
    Row,
}

/// NUMA memory placement policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumaStrategy {
    #[default]
    Disabled,
    Distribute,
    Isolate,
    Numactl,
    Mirror,
}

/// RoPE frequency scaling method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RopeScalingType {
    /// Use whatever the model file specifies
    #[default]
    Unspecified,
    None,
    Linear,
    Yarn,
}

/// Mirostat adaptive sampling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirostatMode {
    #[default]
    Disabled,
    V1,
    V2,
}

/// Role-template used to delimit transcript turns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateMode {
    #[default]
    Plain,
    /// Alpaca-style `### Instruction:` / `### Response:` markers
    Instruct,
    /// `<|im_start|>role` ... `<|im_end|>` markers
    ChatMl,
}

impl TemplateMode {
    /// Whether turns are wrapped in template markers
    pub fn is_templated(self) -> bool {
        !matches!(self, TemplateMode::Plain)
    }
}

/// How many tokens a single generation may produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictLimit {
    /// Generate until another stop condition fires; the context is shifted as needed
    #[default]
    Unlimited,
    /// Stop once the context window is full instead of reclaiming space
    UntilContextFull,
    /// Generate at most this many tokens
    Tokens(u32),
}

impl PredictLimit {
    /// Initial value of the remaining-token budget. Negative sentinels never
    /// reach zero by decrementing.
    pub fn initial_budget(self) -> i64 {
        match self {
            PredictLimit::Unlimited => -1,
            PredictLimit::UntilContextFull => -2,
            PredictLimit::Tokens(n) => i64::from(n),
        }
    }

    pub fn is_bounded(self) -> bool {
        matches!(self, PredictLimit::Tokens(_))
    }
}

/// Model file and device placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Path to the GGUF model file
    pub path: PathBuf,
    /// Number of layers to offload to GPU (None = engine default)
    pub n_gpu_layers: Option<u32>,
    /// GPU used for scratch and small tensors
    pub main_gpu: i32,
    pub split_mode: SplitMode,
    pub numa: NumaStrategy,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            n_gpu_layers: None,
            main_gpu: 0,
            split_mode: SplitMode::default(),
            numa: NumaStrategy::default(),
        }
    }
}

/// Inference context sizing and reclaim strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Context capacity in tokens
    pub n_ctx: u32,
    /// Maximum tokens submitted per decode call
    pub n_batch: u32,
    /// Tokens of the prompt kept on context shift (negative = whole prompt)
    pub n_keep: i32,
    pub n_threads: Option<i32>,
    pub n_threads_batch: Option<i32>,
    /// Self-extension group factor (1 = use context shifting instead)
    pub grp_attn_n: u32,
    /// Self-extension group width
    pub grp_attn_w: u32,
    pub rope_scaling: RopeScalingType,
    /// RoPE base frequency (0 = from model)
    pub rope_freq_base: f32,
    /// RoPE frequency scaling factor (0 = from model)
    pub rope_freq_scale: f32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            n_batch: 512,
            n_keep: 0,
            n_threads: None,
            n_threads_batch: None,
            grp_attn_n: 1,
            grp_attn_w: 512,
            rope_scaling: RopeScalingType::default(),
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
        }
    }
}

/// Sampling strategy handed to the engine's sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Recent tokens remembered for penalties and antiprompt matching
    pub n_prev: usize,
    /// Minimum candidates each filtering sampler must keep (0 = 1)
    pub min_keep: usize,
    /// <= 0 to use vocab size
    pub top_k: i32,
    /// 1.0 = disabled
    pub top_p: f32,
    /// 0.0 = disabled
    pub min_p: f32,
    /// Tail-free z (1.0 = disabled)
    pub tfs_z: f32,
    /// 1.0 = disabled
    pub typical_p: f32,
    /// <= 0.0 samples greedily
    pub temp: f32,
    /// 0.0 = disabled
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    /// Last n tokens to penalize (0 = disabled, -1 = context size)
    pub penalty_last_n: i32,
    /// 1.0 = disabled
    pub penalty_repeat: f32,
    /// 0.0 = disabled
    pub penalty_freq: f32,
    /// 0.0 = disabled
    pub penalty_present: f32,
    pub mirostat: MirostatMode,
    /// Target entropy
    pub mirostat_tau: f32,
    /// Learning rate
    pub mirostat_eta: f32,
    /// Optional GBNF grammar constraining generated text
    pub grammar: Option<String>,
    /// Negative prompt for classifier-free guidance
    pub cfg_negative_prompt: Option<String>,
    /// Guidance strength (guidance is active above 1.0)
    pub cfg_scale: f32,
    /// Sampler seed (None = random)
    pub seed: Option<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            n_prev: 64,
            min_keep: 0,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            tfs_z: 1.0,
            typical_p: 1.0,
            temp: 0.8,
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            mirostat: MirostatMode::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            grammar: None,
            cfg_negative_prompt: None,
            cfg_scale: 1.0,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn is_greedy(&self) -> bool {
        self.temp <= 0.0
    }

    /// Guidance needs both a negative prompt and a scale above 1.0
    pub fn guidance_prompt(&self) -> Option<&str> {
        match &self.cfg_negative_prompt {
            Some(prompt) if self.cfg_scale > 1.0 => Some(prompt.as_str()),
            _ => None,
        }
    }
}

/// Transcript formatting and stop behaviour
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptParams {
    pub n_predict: PredictLimit,
    pub template: TemplateMode,
    /// Return control to the caller on antiprompts and budget exhaustion
    pub interactive: bool,
    /// Rewrite `\n`, `\r`, `\t`, quotes and backslash escapes before tokenizing
    pub escape: bool,
    /// Text inserted before every user turn
    pub input_prefix: String,
    /// Text inserted after every user turn
    pub input_suffix: String,
    /// Reverse prompts that end generation when they appear in the output
    pub antiprompts: Vec<String>,
}

/// Complete configuration for a generation session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: ModelParams,
    pub context: ContextParams,
    pub sampling: SamplingParams,
    pub prompt: PromptParams,
}

impl GenerationConfig {
    /// Clamp soft ranges and reject combinations the engine cannot run
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let s = &mut self.sampling;
        s.top_p = s.top_p.clamp(0.0, 1.0);
        s.min_p = s.min_p.clamp(0.0, 1.0);
        s.typical_p = s.typical_p.clamp(0.0, 1.0);
        s.tfs_z = s.tfs_z.clamp(0.0, 1.0);
        s.dynatemp_range = s.dynatemp_range.max(0.0);
        if s.cfg_scale < 1.0 {
            s.cfg_scale = 1.0;
        }

        let c = &self.context;
        if c.n_batch == 0 {
            return Err(ConfigError::ZeroBatch);
        }
        if c.n_ctx <= 4 {
            return Err(ConfigError::ContextTooSmall(c.n_ctx));
        }
        if c.grp_attn_n == 0 {
            return Err(ConfigError::ZeroGroupFactor);
        }
        if c.grp_attn_n > 1 && (c.grp_attn_w % c.grp_attn_n != 0 || c.grp_attn_w < c.grp_attn_n) {
            return Err(ConfigError::GroupWidth {
                factor: c.grp_attn_n,
                width: c.grp_attn_w,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GenerationConfig::default();
        assert_eq!(config.prompt.template, TemplateMode::Plain);
        assert_eq!(config.prompt.n_predict, PredictLimit::Unlimited);
        assert!(config.sampling.grammar.is_none());
        assert!(config.sampling.guidance_prompt().is_none());
        assert!(!config.sampling.is_greedy());
        assert_eq!(config.context.grp_attn_n, 1);
    }

    #[test]
    fn test_validate_clamps_soft_ranges() {
        let mut config = GenerationConfig::default();
        config.sampling.top_p = 3.0;
        config.sampling.min_p = -1.0;
        config.sampling.cfg_scale = 0.2;
        config.validate().unwrap();
        assert_eq!(config.sampling.top_p, 1.0);
        assert_eq!(config.sampling.min_p, 0.0);
        assert_eq!(config.sampling.cfg_scale, 1.0);
    }

    #[test]
    fn test_validate_rejects_bad_group_attention() {
        let mut config = GenerationConfig::default();
        config.context.grp_attn_n = 4;
        config.context.grp_attn_w = 510;
        assert_eq!(
            config.validate(),
            Err(ConfigError::GroupWidth {
                factor: 4,
                width: 510
            })
        );

        config.context.grp_attn_w = 2;
        assert!(config.validate().is_err());

        config.context.grp_attn_w = 512;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_context() {
        let mut config = GenerationConfig::default();
        config.context.n_ctx = 4;
        assert_eq!(config.validate(), Err(ConfigError::ContextTooSmall(4)));

        config.context.n_ctx = 512;
        config.context.n_batch = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatch));
    }

    #[test]
    fn test_predict_limit_budget() {
        assert_eq!(PredictLimit::Unlimited.initial_budget(), -1);
        assert_eq!(PredictLimit::UntilContextFull.initial_budget(), -2);
        assert_eq!(PredictLimit::Tokens(16).initial_budget(), 16);
        assert!(PredictLimit::Tokens(0).is_bounded());
        assert!(!PredictLimit::Unlimited.is_bounded());
    }

    #[test]
    fn test_guidance_requires_scale_above_one() {
        let mut sampling = SamplingParams {
            cfg_negative_prompt: Some("be rude".to_string()),
            ..SamplingParams::default()
        };
        assert!(sampling.guidance_prompt().is_none());
        sampling.cfg_scale = 1.5;
        assert_eq!(sampling.guidance_prompt(), Some("be rude"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "prompt": { "template": "chat_ml", "n_predict": { "tokens": 32 } } }"#;
        let config: GenerationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.prompt.template, TemplateMode::ChatMl);
        assert_eq!(config.prompt.n_predict, PredictLimit::Tokens(32));
        assert_eq!(config.context.n_ctx, 512);
    }
}
