//! Streaming output
//!
//! Buffers generated tokens so a terminator is never emitted half-way, turns
//! the released tokens into UTF-8 text and pushes it to the caller.

use std::sync::mpsc::Sender;

use crate::inference::backend::{EngineError, Model, Token};
use crate::inference::stop::TerminatorSet;

/// One item of a generation's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Incremental generated text
    Text(String),
    /// Generation ended; nothing follows
    Done,
}

impl StreamChunk {
    /// Returns true if this is a text variant
    pub fn is_text(&self) -> bool {
        matches!(self, StreamChunk::Text(_))
    }

    /// Returns true for the terminal marker
    pub fn is_final(&self) -> bool {
        matches!(self, StreamChunk::Done)
    }

    /// Extracts the text if this is a Text variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StreamChunk::Text(s) => Some(s),
            StreamChunk::Done => None,
        }
    }
}

/// Holds back the newest tokens until they can no longer start a terminator.
///
/// Always sends exactly one `Done`: from `finish`, or from `Drop` when the
/// generation bailed out before finishing.
pub struct OutputPump<'a> {
    tx: &'a Sender<StreamChunk>,
    cache: Vec<Token>,
    holdback: usize,
    utf8: Vec<u8>,
    connected: bool,
    finished: bool,
}

impl<'a> OutputPump<'a> {
    pub fn new(tx: &'a Sender<StreamChunk>) -> Self {
        Self {
            tx,
            cache: Vec::new(),
            holdback: 0,
            utf8: Vec::new(),
            connected: true,
            finished: false,
        }
    }

    /// Hold back as many tokens as the longest terminator
    pub fn hold_back(&mut self, terminators: &TerminatorSet) {
        self.holdback = terminators.max_len();
    }

    /// False once the receiver has gone away
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn push(&mut self, token: Token) {
        self.cache.push(token);
    }

    /// Tokens generated but not yet emitted
    #[cfg(test)]
    pub fn pending(&self) -> &[Token] {
        &self.cache
    }

    /// Remove a completed terminator from the held-back tokens
    pub fn excise(&mut self, terminators: &TerminatorSet) -> bool {
        terminators.excise(&mut self.cache)
    }

    /// Emit every token older than the hold-back window
    pub fn emit_ready<M: Model>(&mut self, model: &M) -> Result<(), EngineError> {
        if self.cache.len() <= self.holdback {
            return Ok(());
        }
        let release = self.cache.len() - self.holdback;
        let ready: Vec<Token> = self.cache.drain(..release).collect();
        for token in ready {
            self.utf8.extend(model.token_to_bytes(token)?);
        }
        let text = self.take_valid_utf8();
        self.send_text(text);
        Ok(())
    }

    /// Emit everything still held, then the terminal marker
    pub fn finish<M: Model>(&mut self, model: &M) -> Result<(), EngineError> {
        let rest = std::mem::take(&mut self.cache);
        let mut result = Ok(());
        for token in rest {
            match model.token_to_bytes(token) {
                Ok(bytes) => self.utf8.extend(bytes),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        let text = String::from_utf8_lossy(&std::mem::take(&mut self.utf8)).into_owned();
        self.send_text(text);
        self.send_done();
        result
    }

    /// Longest valid UTF-8 prefix of the byte buffer; an incomplete trailing
    /// sequence stays buffered, invalid bytes are replaced.
    fn take_valid_utf8(&mut self) -> String {
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.utf8) {
                Ok(s) => {
                    text.push_str(s);
                    self.utf8.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to guarantees this prefix is UTF-8
                    text.push_str(&String::from_utf8_lossy(&self.utf8[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.utf8.drain(..valid + bad);
                        }
                        None => {
                            self.utf8.drain(..valid);
                            return text;
                        }
                    }
                }
            }
        }
    }

    fn send_text(&mut self, text: String) {
        if text.is_empty() || !self.connected {
            return;
        }
        if self.tx.send(StreamChunk::Text(text)).is_err() {
            tracing::debug!("Receiver dropped, stopping generation");
            self.connected = false;
        }
    }

    fn send_done(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let _ = self.tx.send(StreamChunk::Done);
    }
}

impl Drop for OutputPump<'_> {
    fn drop(&mut self) {
        self.send_done();
    }
}
