//! Generation session
//!
//! Owns the loaded model and drives one generation at a time: format the
//! transcript, admit it into the context window, then alternate decode and
//! sample steps until a stop condition fires.
//!
//! # Architecture
//!
//! Inference contexts borrow the model, so they are created at the start of
//! each `generate` call and released before it returns. The session mutex
//! serializes calls; the stop flag is shared so any thread can cancel the
//! running loop between iterations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::inference::backend::{Backend, EngineError, InferenceContext, Model, Token};
use crate::inference::decode::{DecodeDriver, GuidanceStream};
use crate::inference::formatter::format;
use crate::inference::sampling::SamplingContext;
use crate::inference::stop::{find_antiprompt, TerminatorSet, ANTIPROMPT_LOOKBACK};
use crate::inference::streaming::{OutputPump, StreamChunk};
use crate::inference::window::{admit, ContextState, ContextWindow, Reclaim, ReclaimStrategy};
use crate::types::{ChatMessage, ContextParams, GenerationConfig, Transcript};

/// Errors surfaced by the session boundary
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Context not initialized")]
    ContextNotReady,

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("Failed to create context: {0}")]
    Context(String),

    #[error("Decode failed at position {position} ({batch} tokens): {reason}")]
    Decode {
        position: i32,
        batch: usize,
        reason: String,
    },

    #[error("Context of {capacity} tokens cannot hold any input")]
    ContextOverflow { capacity: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Why a generation call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced its end-of-stream token
    EndOfStream,
    /// A configured antiprompt appeared in the output
    Antiprompt,
    /// A template or antiprompt token sequence was generated and removed
    Terminator,
    /// The predict limit was used up
    BudgetExhausted,
    /// The window filled and the predict limit forbids reclaiming space
    ContextFull,
    /// Interactive mode handed control back to the caller
    AwaitingInput,
    Cancelled,
    ReceiverDropped,
}

/// Counters and timings of one generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub stop_reason: StopReason,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prompt_eval: Duration,
    pub generation: Duration,
}

impl GenerationSummary {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.generation.as_secs_f64();
        if secs > 0.0 {
            self.generated_tokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    ModelLoaded,
    ContextReady,
    Generating,
    Cleaned,
}

/// Cancels the session's running generation from any thread
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct SessionInner<M> {
    config: GenerationConfig,
    model: Option<M>,
    terminators: TerminatorSet,
    context_ready: bool,
    cleaned: bool,
}

/// One model, one generation at a time.
///
/// `inner` is declared before `backend` so the model is released first.
pub struct GenerationSession<B: Backend> {
    inner: Mutex<SessionInner<B::Model>>,
    backend: B,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
}

/// Clears the running flag however `generate` exits
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<B: Backend> GenerationSession<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                config: GenerationConfig::default(),
                model: None,
                terminators: TerminatorSet::default(),
                context_ready: false,
                cleaned: false,
            }),
            backend,
            stop: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner<B::Model>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the model named by `config` and build its terminator set.
    ///
    /// Replaces any previously loaded model; the context must be
    /// initialized again afterwards.
    pub fn init_model(&self, mut config: GenerationConfig) -> Result<(), SessionError> {
        config
            .validate()
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

        let mut inner = self.lock();
        inner.model = None;
        inner.context_ready = false;

        tracing::info!("Loading model from {}", config.model.path.display());
        let started = Instant::now();
        let model = self.backend.load_model(&config.model).map_err(|e| {
            tracing::error!("Model load failed: {}", e);
            match e {
                EngineError::ModelLoad(msg) => SessionError::Load(msg),
                other => SessionError::Load(other.to_string()),
            }
        })?;

        let terminators =
            TerminatorSet::build(&model, config.prompt.template, &config.prompt.antiprompts)?;

        tracing::info!(
            "Model loaded in {:.2}s ({:?} template, {} antiprompts)",
            started.elapsed().as_secs_f64(),
            config.prompt.template,
            config.prompt.antiprompts.len()
        );

        inner.model = Some(model);
        inner.terminators = terminators;
        inner.config = config;
        inner.cleaned = false;
        Ok(())
    }

    /// Record the context parameters used by every following generation.
    ///
    /// Contexts borrow the model, so allocation itself happens per call;
    /// allocation failures surface from `generate` as `SessionError::Context`.
    pub fn init_context(&self, params: ContextParams) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if inner.model.is_none() {
            return Err(SessionError::NoModelLoaded);
        }

        let mut config = inner.config.clone();
        config.context = params;
        config
            .validate()
            .map_err(|e| SessionError::InvalidConfig(e.to_string()))?;

        tracing::info!(
            "Context ready: n_ctx = {}, n_batch = {}, reclaim = {:?}",
            config.context.n_ctx,
            config.context.n_batch,
            ReclaimStrategy::from_params(&config.context)
        );
        inner.config = config;
        inner.context_ready = true;
        Ok(())
    }

    /// Run one generation on the calling thread.
    ///
    /// Text is streamed into `tx` and exactly one `StreamChunk::Done` is
    /// sent, whether the call succeeds, fails or is cancelled. Text generated
    /// before a failure is flushed ahead of `Done`.
    pub fn generate(
        &self,
        transcript: &Transcript,
        tx: &Sender<StreamChunk>,
    ) -> Result<GenerationSummary, SessionError> {
        self.generate_with(transcript, tx, true)
    }

    fn generate_with(
        &self,
        transcript: &Transcript,
        tx: &Sender<StreamChunk>,
        reset_stop: bool,
    ) -> Result<GenerationSummary, SessionError> {
        let mut pump = OutputPump::new(tx);
        let inner = self.lock();
        if reset_stop {
            self.stop.store(false, Ordering::SeqCst);
        }
        self.running.store(true, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        let model = inner.model.as_ref().ok_or(SessionError::NoModelLoaded)?;
        if !inner.context_ready {
            return Err(SessionError::ContextNotReady);
        }

        let result = run(
            model,
            &inner.config,
            &inner.terminators,
            &self.stop,
            transcript,
            &mut pump,
        );
        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                if let Err(flush) = pump.finish(model) {
                    tracing::warn!("Could not flush output after failure: {}", flush);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Generation stopped ({:?}): prompt eval {} tokens in {:.2} ms, generated {} tokens in {:.2} ms ({:.2} tokens/s)",
            summary.stop_reason,
            summary.prompt_tokens,
            summary.prompt_eval.as_secs_f64() * 1000.0,
            summary.generated_tokens,
            summary.generation.as_secs_f64() * 1000.0,
            summary.tokens_per_second()
        );
        Ok(summary)
    }

    /// Run `generate` on a worker thread and hand back the chunk stream.
    ///
    /// The receiver's iterator ends after `Done`. The stop flag is cleared
    /// here rather than on the worker, so a `stop()` issued as soon as this
    /// returns cancels the queued generation.
    pub fn generate_stream(
        self: &Arc<Self>,
        transcript: Vec<ChatMessage>,
    ) -> (
        Receiver<StreamChunk>,
        JoinHandle<Result<GenerationSummary, SessionError>>,
    )
    where
        B: Send + Sync + 'static,
        B::Model: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.stop.store(false, Ordering::SeqCst);
        let session = Arc::clone(self);
        let handle = thread::spawn(move || session.generate_with(&transcript, &tx, false));
        (rx, handle)
    }

    /// Request cancellation of the running or queued generation.
    ///
    /// A synchronous `generate` clears the flag once it holds the session,
    /// so a stop issued while idle has no effect on it.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Cancel any running generation, wait for it, and release the model.
    /// Safe to call repeatedly or before any initialization.
    pub fn cleanup(&self) {
        self.stop();
        let mut inner = self.lock();
        if inner.model.take().is_some() {
            tracing::info!("Model released");
        }
        inner.terminators = TerminatorSet::default();
        inner.context_ready = false;
        inner.cleaned = true;
    }

    pub fn state(&self) -> SessionState {
        if self.running.load(Ordering::SeqCst) {
            return SessionState::Generating;
        }
        let inner = self.lock();
        match (&inner.model, inner.context_ready) {
            (Some(_), true) => SessionState::ContextReady,
            (Some(_), false) => SessionState::ModelLoaded,
            (None, _) if inner.cleaned => SessionState::Cleaned,
            (None, _) => SessionState::Unloaded,
        }
    }

    /// Configuration the session is running with
    pub fn config(&self) -> GenerationConfig {
        self.lock().config.clone()
    }
}

fn decode_error(e: EngineError, batch: usize) -> SessionError {
    match e {
        EngineError::Decode { position, reason } => SessionError::Decode {
            position,
            batch,
            reason,
        },
        other => SessionError::Engine(other),
    }
}

/// The generation loop
fn run<M: Model>(
    model: &M,
    config: &GenerationConfig,
    terminators: &TerminatorSet,
    stop: &AtomicBool,
    transcript: &Transcript,
    pump: &mut OutputPump<'_>,
) -> Result<GenerationSummary, SessionError> {
    let prompt = &config.prompt;
    let started = Instant::now();

    let mut ctx = model
        .new_context(&config.context)
        .map_err(|e| SessionError::Context(e.to_string()))?;
    let n_ctx = ctx.n_ctx() as usize;

    let formatted = format(model, transcript, prompt)?;
    let admitted = admit(
        formatted,
        n_ctx,
        model.token_bos(),
        model.add_bos(),
        config.context.n_keep,
        prompt.template,
    )
    .map_err(|capacity| SessionError::ContextOverflow { capacity })?;
    let prompt_tokens = admitted.tokens.len();
    tracing::debug!(
        "Prompt admitted: {} tokens, n_keep = {}, truncated = {}",
        prompt_tokens,
        admitted.n_keep,
        admitted.truncated
    );

    let mut guidance = match config.sampling.guidance_prompt() {
        Some(negative) => {
            let g_ctx = model
                .new_context(&config.context)
                .map_err(|e| SessionError::Context(e.to_string()))?;
            let tokens = model.tokenize(negative, model.add_bos(), true)?;
            tracing::debug!(
                "Guidance prompt: {} tokens, scale {}",
                tokens.len(),
                config.sampling.cfg_scale
            );
            Some(GuidanceStream::new(g_ctx, tokens, prompt_tokens))
        }
        None => None,
    };

    let sampler = ctx.new_sampler(&config.sampling)?;
    let mut sampling = SamplingContext::new(sampler, config.sampling.n_prev, ANTIPROMPT_LOOKBACK);

    let driver = DecodeDriver::new(config.context.n_batch);
    let window = ContextWindow {
        n_ctx: n_ctx as i32,
        n_keep: admitted.n_keep as i32,
        strategy: ReclaimStrategy::from_params(&config.context),
        limit: prompt.n_predict,
    };
    let mut state = ContextState::new(prompt.n_predict);
    pump.hold_back(terminators);

    let eos = model.token_eos();
    let returns_control = prompt.interactive || prompt.template.is_templated();
    let mut pending: Vec<Token> = admitted.tokens;
    let mut embd: Vec<Token> = Vec::new();
    let mut generated = 0usize;
    let mut rearmed = false;
    let mut first_sample: Option<Instant> = None;

    let stop_reason = loop {
        if stop.load(Ordering::SeqCst) {
            tracing::debug!("Generation stopped by request");
            break StopReason::Cancelled;
        }
        if state.n_remain == 0 {
            break StopReason::BudgetExhausted;
        }

        if !embd.is_empty() {
            let guidance_offset = guidance.as_ref().map_or(0, |g| g.offset);
            let reclaimed = window.reclaim(
                &mut ctx,
                &mut state,
                embd.len(),
                guidance_offset,
                guidance.as_mut().map(|g| &mut g.n_past),
            )?;
            match reclaimed {
                Reclaim::Halt => {
                    tracing::info!("Context full after {} generated tokens", generated);
                    break StopReason::ContextFull;
                }
                Reclaim::Shifted { discarded } => {
                    tracing::debug!("Discarded {} cached tokens", discarded);
                }
                Reclaim::Extended { passes } => {
                    tracing::debug!("Self-extend ran {} passes", passes);
                }
                Reclaim::NotNeeded => {}
            }

            if let Some(g) = guidance.as_mut() {
                g.decode(&driver, &embd)
                    .map_err(|e| decode_error(e, embd.len()))?;
            }
            state.n_past = driver
                .decode(&mut ctx, &embd, state.n_past)
                .map_err(|e| decode_error(e, embd.len()))?;
        }
        embd.clear();

        let sampled = state.n_consumed >= pending.len();
        if sampled {
            let token = sampling.sample(&ctx, guidance.as_ref().map(|g| &g.ctx))?;
            first_sample.get_or_insert_with(Instant::now);
            sampling.accept(token, true);
            embd.push(token);
            state.n_remain -= 1;
            generated += 1;

            if token != eos {
                pump.push(token);
                if pump.excise(terminators) {
                    tracing::debug!("Terminator sequence generated");
                    break StopReason::Terminator;
                }
                pump.emit_ready(model)?;
                if !pump.is_connected() {
                    break StopReason::ReceiverDropped;
                }
            }
        } else {
            while state.n_consumed < pending.len() {
                let token = pending[state.n_consumed];
                embd.push(token);
                sampling.accept(token, false);
                state.n_consumed += 1;
                if embd.len() >= driver.n_batch() {
                    break;
                }
            }
        }

        // stop conditions apply once the pending input is consumed and
        // something has been generated
        if state.n_consumed < pending.len() || generated == 0 {
            continue;
        }

        if !prompt.antiprompts.is_empty() {
            let recent = sampling.recent_text(model, ANTIPROMPT_LOOKBACK)?;
            if let Some(i) = find_antiprompt(&recent, &prompt.antiprompts, prompt.interactive) {
                tracing::debug!("Antiprompt {:?} found", prompt.antiprompts[i]);
                break StopReason::Antiprompt;
            }
            if rearmed {
                break StopReason::Antiprompt;
            }
        }

        if sampled && sampling.last() == Some(eos) {
            if !returns_control {
                tracing::debug!("End of text");
                break StopReason::EndOfStream;
            }
            match prompt.antiprompts.first() {
                Some(first) if !rearmed => {
                    // hand the turn back by replaying the first antiprompt
                    pending.extend(model.tokenize(first, false, true)?);
                    rearmed = true;
                }
                _ => break StopReason::AwaitingInput,
            }
        }

        if state.n_remain == 0 && prompt.interactive && prompt.n_predict.is_bounded() {
            state.n_remain = prompt.n_predict.initial_budget();
            break StopReason::AwaitingInput;
        }
    };

    pump.finish(model)?;

    let finished = Instant::now();
    let (prompt_eval, generation) = match first_sample {
        Some(at) => (at - started, finished - at),
        None => (finished - started, Duration::ZERO),
    };
    Ok(GenerationSummary {
        stop_reason,
        prompt_tokens,
        generated_tokens: generated,
        prompt_eval,
        generation,
    })
}
