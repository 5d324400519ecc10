//! Stop detection
//!
//! Antiprompt substring matching over recent output and token-level
//! terminator sequences built from the role-template and antiprompts.

use crate::floor_char_boundary;
use crate::inference::backend::{EngineError, Model, Token};
use crate::types::TemplateMode;

/// Accepted tokens detokenized for antiprompt matching
pub const ANTIPROMPT_LOOKBACK: usize = 32;

/// Extra characters searched past an antiprompt outside interactive mode,
/// for sub-word tokens that glue trailing punctuation onto it
const NON_INTERACTIVE_PADDING: usize = 2;

/// Index of the first configured antiprompt found near the end of `output`.
///
/// Each antiprompt is searched in a trailing window of its own length plus
/// padding (0 interactive, 2 otherwise). Configuration order breaks ties.
pub fn find_antiprompt(output: &str, antiprompts: &[String], interactive: bool) -> Option<usize> {
    let padding = if interactive { 0 } else { NON_INTERACTIVE_PADDING };
    antiprompts.iter().position(|antiprompt| {
        if antiprompt.is_empty() {
            return false;
        }
        let window = antiprompt.len() + padding;
        let start = floor_char_boundary(output, output.len().saturating_sub(window));
        output[start..].contains(antiprompt.as_str())
    })
}

/// Token sequences whose appearance ends a generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminatorSet {
    sequences: Vec<Vec<Token>>,
}

impl TerminatorSet {
    pub fn new(sequences: Vec<Vec<Token>>) -> Self {
        Self {
            sequences: sequences.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Template end-of-turn markers followed by the tokenized antiprompts
    pub fn build<M: Model>(
        model: &M,
        template: TemplateMode,
        antiprompts: &[String],
    ) -> Result<Self, EngineError> {
        let markers: &[&str] = match template {
            TemplateMode::Plain => &[],
            TemplateMode::Instruct => &["### Instruction:", "### System:"],
            TemplateMode::ChatMl => &["<|im_end|>", "<|im_start|>"],
        };

        let mut sequences = Vec::with_capacity(markers.len() + antiprompts.len());
        for marker in markers {
            sequences.push(model.tokenize(marker, false, true)?);
        }
        for antiprompt in antiprompts {
            sequences.push(model.tokenize(antiprompt, false, true)?);
        }

        let set = Self::new(sequences);
        tracing::debug!(
            "Built {} terminator sequences (longest {} tokens)",
            set.sequences.len(),
            set.max_len()
        );
        Ok(set)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Length of the longest sequence
    pub fn max_len(&self) -> usize {
        self.sequences.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Find the first terminator occurring contiguously in `cache`, remove it
    /// and report a stop. Sequences are tried in set order.
    pub fn excise(&self, cache: &mut Vec<Token>) -> bool {
        for terminator in &self.sequences {
            if let Some(at) = cache
                .windows(terminator.len())
                .position(|window| window == terminator.as_slice())
            {
                cache.drain(at..at + terminator.len());
                return true;
            }
        }
        false
    }
}
