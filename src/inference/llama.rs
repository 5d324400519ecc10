//! llama.cpp engine binding
//!
//! Implements the collaborator traits over `llama-cpp-2`: model loading with
//! device placement, positioned batch decode, sequence-0 cache edits, and a
//! sampler chain built from `SamplingParams`.

use std::num::{NonZeroU32, NonZeroU8};
use std::sync::Arc;

use llama_cpp_2::context::params::{LlamaContextParams, RopeScalingType as LlamaRopeScaling};
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::{LlamaBackend, NumaStrategy as LlamaNuma};
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::{LlamaModelParams, LlamaSplitMode};
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::data::LlamaTokenData;
use llama_cpp_2::token::data_array::LlamaTokenDataArray;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};

use crate::inference::backend::{
    Backend, EngineError, InferenceContext, KvCache, Model, Token, TokenSampler,
};
use crate::inference::model::validate_gguf;
use crate::inference::sampling::apply_guidance;
use crate::types::{
    ContextParams, MirostatMode, ModelParams, NumaStrategy, RopeScalingType, SamplingParams,
    SplitMode,
};

/// Candidates kept by mirostat v1 when estimating `s_hat`
const MIROSTAT_M: i32 = 100;

/// The process-wide llama.cpp backend
pub struct LlamaCppBackend {
    backend: Arc<LlamaBackend>,
}

impl LlamaCppBackend {
    /// Initialize llama.cpp. Fails if it was already initialized in this process.
    pub fn new(numa: NumaStrategy) -> Result<Self, EngineError> {
        send_logs_to_tracing(LogOptions::default());

        let backend = match numa {
            NumaStrategy::Disabled => LlamaBackend::init(),
            strategy => LlamaBackend::init_numa(match strategy {
                NumaStrategy::Distribute => LlamaNuma::DISTRIBUTE,
                NumaStrategy::Isolate => LlamaNuma::ISOLATE,
                NumaStrategy::Numactl => LlamaNuma::NUMACTL,
                NumaStrategy::Mirror => LlamaNuma::MIRROR,
                NumaStrategy::Disabled => LlamaNuma::DISABLED,
            }),
        }
        .map_err(|e| EngineError::ModelLoad(format!("backend init: {e}")))?;

        tracing::info!("llama.cpp backend initialized (numa: {:?})", numa);
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl Backend for LlamaCppBackend {
    type Model = LlamaCppModel;

    fn load_model(&self, params: &ModelParams) -> Result<LlamaCppModel, EngineError> {
        let header = validate_gguf(&params.path)
            .map_err(|e| EngineError::ModelLoad(format!("{}: {e}", params.path.display())))?;
        tracing::debug!(
            "GGUF v{} header: {} tensors, {} metadata entries",
            header.version,
            header.tensor_count,
            header.metadata_kv_count
        );

        let mut model_params = LlamaModelParams::default()
            .with_main_gpu(params.main_gpu)
            .with_split_mode(match params.split_mode {
                SplitMode::None => LlamaSplitMode::None,
                SplitMode::Layer => LlamaSplitMode::Layer,
                SplitMode::Row => LlamaSplitMode::Row,
            });
        if let Some(layers) = params.n_gpu_layers {
            model_params = model_params.with_n_gpu_layers(layers);
        }

        let model = LlamaModel::load_from_file(&self.backend, &params.path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        // absent key means the tokenizer expects BOS
        let add_bos = model
            .meta_val_str("tokenizer.ggml.add_bos_token")
            .map(|v| v != "false")
            .unwrap_or(true);

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx train)",
            params.path.display(),
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );

        Ok(LlamaCppModel {
            model,
            backend: Arc::clone(&self.backend),
            add_bos,
        })
    }
}

/// A loaded model. `model` is declared first so it is freed before the
/// backend reference is released.
pub struct LlamaCppModel {
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    add_bos: bool,
}

impl Model for LlamaCppModel {
    type Context<'m> = LlamaCppContext<'m>;

    // llama-cpp-2 always maps special-token text, so `parse_special` has no
    // effect here
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        _parse_special: bool,
    ) -> Result<Vec<Token>, EngineError> {
        let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| EngineError::Detokenization(e.to_string()))
    }

    fn token_bos(&self) -> Token {
        self.model.token_bos().0
    }

    fn token_eos(&self) -> Token {
        self.model.token_eos().0
    }

    fn add_bos(&self) -> bool {
        self.add_bos
    }

    fn new_context(&self, params: &ContextParams) -> Result<LlamaCppContext<'_>, EngineError> {
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.n_ctx))
            .with_n_batch(params.n_batch)
            .with_rope_scaling_type(match params.rope_scaling {
                RopeScalingType::Unspecified => LlamaRopeScaling::Unspecified,
                RopeScalingType::None => LlamaRopeScaling::None,
                RopeScalingType::Linear => LlamaRopeScaling::Linear,
                RopeScalingType::Yarn => LlamaRopeScaling::Yarn,
            })
            .with_rope_freq_base(params.rope_freq_base)
            .with_rope_freq_scale(params.rope_freq_scale);
        if let Some(n_threads) = params.n_threads {
            ctx_params = ctx_params.with_n_threads(n_threads);
        }
        if let Some(n_threads_batch) = params.n_threads_batch {
            ctx_params = ctx_params.with_n_threads_batch(n_threads_batch);
        }

        let ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        Ok(LlamaCppContext {
            ctx,
            model: self,
            n_batch: params.n_batch.max(1) as usize,
            logits_index: 0,
        })
    }
}

pub struct LlamaCppContext<'m> {
    ctx: LlamaContext<'m>,
    model: &'m LlamaCppModel,
    n_batch: usize,
    /// Batch index of the token whose logits the next sample reads
    logits_index: i32,
}

fn position(p: i32) -> Result<Option<u32>, EngineError> {
    u32::try_from(p)
        .map(Some)
        .map_err(|_| EngineError::KvCache(format!("negative position {p}")))
}

impl KvCache for LlamaCppContext<'_> {
    fn kv_remove(&mut self, p0: i32, p1: i32) -> Result<(), EngineError> {
        self.ctx
            .clear_kv_cache_seq(Some(0), position(p0)?, position(p1)?)
            .map(|_| ())
            .map_err(|e| EngineError::KvCache(e.to_string()))
    }

    fn kv_shift(&mut self, p0: i32, p1: i32, delta: i32) -> Result<(), EngineError> {
        self.ctx
            .kv_cache_seq_add(0, position(p0)?, position(p1)?, delta)
            .map_err(|e| EngineError::KvCache(e.to_string()))
    }

    fn kv_divide(&mut self, p0: i32, p1: i32, divisor: i32) -> Result<(), EngineError> {
        let divisor = u8::try_from(divisor)
            .ok()
            .and_then(NonZeroU8::new)
            .ok_or_else(|| EngineError::KvCache(format!("invalid divisor {divisor}")))?;
        self.ctx
            .kv_cache_seq_div(0, position(p0)?, position(p1)?, divisor)
            .map_err(|e| EngineError::KvCache(e.to_string()))
    }
}

/// Sampler chain plus a grammar sampler that only sees generated tokens
pub struct LlamaCppSampler {
    chain: LlamaSampler,
    grammar: Option<LlamaSampler>,
    cfg_scale: f32,
}

impl TokenSampler for LlamaCppSampler {
    fn accept(&mut self, token: Token, apply_grammar: bool) {
        self.chain.accept(LlamaToken(token));
        if apply_grammar {
            if let Some(grammar) = self.grammar.as_mut() {
                grammar.accept(LlamaToken(token));
            }
        }
    }
}

impl InferenceContext for LlamaCppContext<'_> {
    type Sampler = LlamaCppSampler;

    fn n_ctx(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn decode(&mut self, tokens: &[Token], n_past: i32) -> Result<(), EngineError> {
        let decode_error = |reason: String| EngineError::Decode {
            position: n_past,
            reason,
        };

        let mut batch = LlamaBatch::new(tokens.len().max(self.n_batch), 1);
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            batch
                .add(LlamaToken(token), n_past + i as i32, &[0], i == last)
                .map_err(|e| decode_error(e.to_string()))?;
        }
        self.ctx
            .decode(&mut batch)
            .map_err(|e| decode_error(e.to_string()))?;
        self.logits_index = last as i32;
        Ok(())
    }

    fn new_sampler(&self, params: &SamplingParams) -> Result<LlamaCppSampler, EngineError> {
        let model = &self.model.model;
        let seed = params.seed.unwrap_or_else(rand_seed);
        let min_keep = params.min_keep.max(1);
        let penalty_last_n = if params.penalty_last_n < 0 {
            self.ctx.n_ctx() as i32
        } else {
            params.penalty_last_n
        };
        if (params.tfs_z - 1.0).abs() > f32::EPSILON {
            tracing::warn!("Tail-free sampling is not available, ignoring tfs_z = {}", params.tfs_z);
        }

        let mut samplers = vec![LlamaSampler::penalties(
            penalty_last_n,
            params.penalty_repeat,
            params.penalty_freq,
            params.penalty_present,
        )];
        if params.is_greedy() {
            samplers.push(LlamaSampler::greedy());
        } else {
            match params.mirostat {
                MirostatMode::Disabled => {
                    samplers.push(LlamaSampler::top_k(params.top_k));
                    samplers.push(LlamaSampler::typical(params.typical_p, min_keep));
                    samplers.push(LlamaSampler::top_p(params.top_p, min_keep));
                    samplers.push(LlamaSampler::min_p(params.min_p, min_keep));
                    samplers.push(LlamaSampler::temp_ext(
                        params.temp,
                        params.dynatemp_range,
                        params.dynatemp_exponent,
                    ));
                    samplers.push(LlamaSampler::dist(seed));
                }
                MirostatMode::V1 => {
                    samplers.push(LlamaSampler::temp(params.temp));
                    samplers.push(LlamaSampler::mirostat(
                        model.n_vocab(),
                        seed,
                        params.mirostat_tau,
                        params.mirostat_eta,
                        MIROSTAT_M,
                    ));
                }
                MirostatMode::V2 => {
                    samplers.push(LlamaSampler::temp(params.temp));
                    samplers.push(LlamaSampler::mirostat_v2(
                        seed,
                        params.mirostat_tau,
                        params.mirostat_eta,
                    ));
                }
            }
        }

        let grammar = match params.grammar.as_deref() {
            Some(gbnf) if !gbnf.trim().is_empty() => Some(
                LlamaSampler::grammar(model, gbnf, "root")
                    .map_err(|e| EngineError::Sampler(format!("invalid grammar: {e}")))?,
            ),
            _ => None,
        };

        Ok(LlamaCppSampler {
            chain: LlamaSampler::chain_simple(samplers),
            grammar,
            cfg_scale: params.cfg_scale,
        })
    }

    fn sample(
        &self,
        sampler: &mut LlamaCppSampler,
        guidance: Option<&Self>,
    ) -> Result<Token, EngineError> {
        let mut logits = self.ctx.get_logits_ith(self.logits_index).to_vec();
        if let Some(guidance) = guidance {
            let negative = guidance.ctx.get_logits_ith(guidance.logits_index);
            apply_guidance(&mut logits, negative, sampler.cfg_scale);
        }

        let mut candidates = LlamaTokenDataArray::from_iter(
            logits
                .iter()
                .enumerate()
                .map(|(id, &logit)| LlamaTokenData::new(LlamaToken(id as i32), logit, 0.0)),
            false,
        );
        if let Some(grammar) = sampler.grammar.as_mut() {
            candidates.apply_sampler(grammar);
        }
        candidates.apply_sampler(&mut sampler.chain);

        candidates
            .selected_token()
            .map(|t| t.0)
            .ok_or_else(|| EngineError::Sampler("no token selected".to_string()))
    }
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
