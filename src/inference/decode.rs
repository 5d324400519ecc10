//! Batched decoding
//!
//! Pushes token runs through the engine in batches at increasing positions,
//! and keeps an optional classifier-free guidance context in lockstep.

use crate::inference::backend::{EngineError, InferenceContext, Token};

/// Splits token runs into engine-sized batches
#[derive(Debug, Clone, Copy)]
pub struct DecodeDriver {
    n_batch: usize,
}

impl DecodeDriver {
    pub fn new(n_batch: u32) -> Self {
        Self {
            n_batch: n_batch.max(1) as usize,
        }
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    /// Decode `tokens` starting at `start`, returning the new position.
    ///
    /// The first rejected batch aborts the call; no batch is retried.
    pub fn decode<C: InferenceContext>(
        &self,
        ctx: &mut C,
        tokens: &[Token],
        start: i32,
    ) -> Result<i32, EngineError> {
        let mut n_past = start;
        for (i, batch) in tokens.chunks(self.n_batch).enumerate() {
            ctx.decode(batch, n_past).map_err(|e| {
                tracing::error!(
                    "Failed to eval batch {} ({} tokens, batch size {}, n_past {}): {}",
                    i,
                    tokens.len(),
                    self.n_batch,
                    n_past,
                    e
                );
                e
            })?;
            n_past += batch.len() as i32;
        }
        Ok(n_past)
    }
}

/// Secondary decode stream seeded with a negative prompt
pub struct GuidanceStream<C> {
    pub ctx: C,
    /// Tokenized negative prompt
    prompt: Vec<Token>,
    /// Length of the real prompt the negative prompt stands in for
    original_prompt_len: usize,
    /// `prompt.len() - original_prompt_len`
    pub offset: i32,
    pub n_past: i32,
}

impl<C: InferenceContext> GuidanceStream<C> {
    pub fn new(ctx: C, prompt: Vec<Token>, original_prompt_len: usize) -> Self {
        let offset = prompt.len() as i32 - original_prompt_len as i32;
        Self {
            ctx,
            prompt,
            original_prompt_len,
            offset,
            n_past: 0,
        }
    }

    /// Tokens the guidance context should see for the live batch `embd`.
    ///
    /// Until the negative prompt has been evaluated it replaces the original
    /// prompt, followed by whatever of `embd` lies past the original prompt.
    pub fn input_for(&self, embd: &[Token]) -> Vec<Token> {
        if (self.n_past as usize) < self.prompt.len() {
            let mut input = self.prompt.clone();
            if embd.len() > self.original_prompt_len {
                input.extend_from_slice(&embd[self.original_prompt_len..]);
            }
            input
        } else {
            embd.to_vec()
        }
    }

    pub fn decode(&mut self, driver: &DecodeDriver, embd: &[Token]) -> Result<(), EngineError> {
        let input = self.input_for(embd);
        self.n_past = driver.decode(&mut self.ctx, &input, self.n_past)?;
        Ok(())
    }
}
