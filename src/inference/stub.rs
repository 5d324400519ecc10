//! Deterministic in-memory engine for tests
//!
//! Char-level tokenizer, scripted sampler, injectable decode failures and a
//! shared log of every decode and cache edit.

use std::sync::{Arc, Mutex};

use crate::inference::backend::{
    Backend, EngineError, InferenceContext, KvCache, Model, Token, TokenSampler,
};
use crate::types::{ContextParams, ModelParams, SamplingParams};

pub const BOS: Token = 1;
pub const EOS: Token = 2;
pub const IM_START: Token = 3;
pub const IM_END: Token = 4;
pub const CHAR_BASE: Token = 1000;

const SPECIALS: [(&str, Token); 2] = [("<|im_start|>", IM_START), ("<|im_end|>", IM_END)];

#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Remove(i32, i32),
    Shift(i32, i32, i32),
    Divide(i32, i32, i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeCall {
    /// 0 = main context, 1 = guidance context
    pub context: usize,
    pub tokens: Vec<Token>,
    pub n_past: i32,
}

#[derive(Debug, Default)]
pub struct StubLog {
    pub decodes: Vec<DecodeCall>,
    pub kv_ops: Vec<KvOp>,
    pub accepted: Vec<(Token, bool)>,
    pub contexts_created: usize,
    pub guided_samples: usize,
}

pub type SampleHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Tokens for `text` without BOS, specials parsed
pub fn chars(text: &str) -> Vec<Token> {
    text.chars().map(|c| CHAR_BASE + c as Token).collect()
}

#[derive(Clone)]
pub struct StubModel {
    pub log: Arc<Mutex<StubLog>>,
    /// Tokens returned by successive samples
    pub script: Vec<Token>,
    /// Returned once the script is exhausted
    pub fallback: Token,
    /// Zero-based index of the main-context decode call that fails
    pub fail_decode_call: Option<usize>,
    pub fail_context: bool,
    pub add_bos: bool,
    pub on_sample: Option<SampleHook>,
}

impl Default for StubModel {
    fn default() -> Self {
        Self {
            log: Arc::new(Mutex::new(StubLog::default())),
            script: Vec::new(),
            fallback: EOS,
            fail_decode_call: None,
            fail_context: false,
            add_bos: true,
            on_sample: None,
        }
    }
}

impl StubModel {
    pub fn scripted(script: Vec<Token>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, StubLog> {
        self.log.lock().unwrap()
    }
}

impl Model for StubModel {
    type Context<'m> = StubContext<'m>;

    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
    ) -> Result<Vec<Token>, EngineError> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS);
        }
        let mut rest = text;
        'outer: while let Some(c) = rest.chars().next() {
            if parse_special {
                for (marker, id) in SPECIALS {
                    if let Some(tail) = rest.strip_prefix(marker) {
                        tokens.push(id);
                        rest = tail;
                        continue 'outer;
                    }
                }
            }
            tokens.push(CHAR_BASE + c as Token);
            rest = &rest[c.len_utf8()..];
        }
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, EngineError> {
        let text = match token {
            BOS | EOS => String::new(),
            IM_START => "<|im_start|>".to_string(),
            IM_END => "<|im_end|>".to_string(),
            t if t >= CHAR_BASE => char::from_u32((t - CHAR_BASE) as u32)
                .map(String::from)
                .ok_or_else(|| EngineError::Detokenization(format!("bad token {t}")))?,
            t => format!("<{t}>"),
        };
        Ok(text.into_bytes())
    }

    fn token_bos(&self) -> Token {
        BOS
    }

    fn token_eos(&self) -> Token {
        EOS
    }

    fn add_bos(&self) -> bool {
        self.add_bos
    }

    fn new_context(&self, params: &ContextParams) -> Result<StubContext<'_>, EngineError> {
        if self.fail_context {
            return Err(EngineError::ContextCreate("out of memory".to_string()));
        }
        let mut log = self.log();
        let index = log.contexts_created;
        log.contexts_created += 1;
        Ok(StubContext {
            model: self,
            index,
            n_ctx: params.n_ctx,
            main_decodes: 0,
        })
    }
}

pub struct StubContext<'m> {
    model: &'m StubModel,
    index: usize,
    n_ctx: u32,
    main_decodes: usize,
}

impl KvCache for StubContext<'_> {
    fn kv_remove(&mut self, p0: i32, p1: i32) -> Result<(), EngineError> {
        self.model.log().kv_ops.push(KvOp::Remove(p0, p1));
        Ok(())
    }

    fn kv_shift(&mut self, p0: i32, p1: i32, delta: i32) -> Result<(), EngineError> {
        self.model.log().kv_ops.push(KvOp::Shift(p0, p1, delta));
        Ok(())
    }

    fn kv_divide(&mut self, p0: i32, p1: i32, divisor: i32) -> Result<(), EngineError> {
        self.model.log().kv_ops.push(KvOp::Divide(p0, p1, divisor));
        Ok(())
    }
}

pub struct StubSampler {
    log: Arc<Mutex<StubLog>>,
    script: Vec<Token>,
    fallback: Token,
    cursor: usize,
    on_sample: Option<SampleHook>,
}

impl TokenSampler for StubSampler {
    fn accept(&mut self, token: Token, apply_grammar: bool) {
        self.log.lock().unwrap().accepted.push((token, apply_grammar));
    }
}

impl InferenceContext for StubContext<'_> {
    type Sampler = StubSampler;

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn decode(&mut self, tokens: &[Token], n_past: i32) -> Result<(), EngineError> {
        if self.index == 0 {
            let call = self.main_decodes;
            self.main_decodes += 1;
            if self.model.fail_decode_call == Some(call) {
                return Err(EngineError::Decode {
                    position: n_past,
                    reason: "rejected by stub".to_string(),
                });
            }
        }
        self.model.log().decodes.push(DecodeCall {
            context: self.index,
            tokens: tokens.to_vec(),
            n_past,
        });
        Ok(())
    }

    fn new_sampler(&self, _params: &SamplingParams) -> Result<StubSampler, EngineError> {
        Ok(StubSampler {
            log: Arc::clone(&self.model.log),
            script: self.model.script.clone(),
            fallback: self.model.fallback,
            cursor: 0,
            on_sample: self.model.on_sample.clone(),
        })
    }

    fn sample(
        &self,
        sampler: &mut StubSampler,
        guidance: Option<&Self>,
    ) -> Result<Token, EngineError> {
        if guidance.is_some() {
            self.model.log().guided_samples += 1;
        }
        let n = sampler.cursor;
        sampler.cursor += 1;
        if let Some(hook) = &sampler.on_sample {
            hook(n);
        }
        Ok(sampler.script.get(n).copied().unwrap_or(sampler.fallback))
    }
}

pub struct StubBackend {
    pub model: StubModel,
}

impl Backend for StubBackend {
    type Model = StubModel;

    fn load_model(&self, params: &ModelParams) -> Result<StubModel, EngineError> {
        if params.path.to_string_lossy().contains("missing") {
            return Err(EngineError::ModelLoad(format!(
                "{} not found",
                params.path.display()
            )));
        }
        Ok(self.model.clone())
    }
}
