//! Transcript formatting
//!
//! Flattens a chat transcript into one token sequence using the configured
//! role-template, then primes the model for an assistant reply.

use crate::inference::backend::{EngineError, Model, Token};
use crate::types::{PromptParams, Role, TemplateMode, Transcript};

/// Token fragments delimiting turns for one template mode
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleTemplate {
    pub user_prefix: Vec<Token>,
    pub assistant_prefix: Vec<Token>,
    pub system_prefix: Vec<Token>,
    pub turn_suffix: Vec<Token>,
}

impl RoleTemplate {
    /// Marker strings as `(user, assistant, system, suffix)`
    pub fn markers(mode: TemplateMode) -> Option<(&'static str, &'static str, &'static str, &'static str)> {
        match mode {
            TemplateMode::Plain => None,
            TemplateMode::Instruct => Some((
                "### Instruction:\n\n",
                "### Response:\n\n",
                "### System:\n\n",
                "\n\n",
            )),
            TemplateMode::ChatMl => Some((
                "<|im_start|>user\n",
                "<|im_start|>assistant\n",
                "<|im_start|>system\n",
                "<|im_end|>\n",
            )),
        }
    }

    pub fn build<M: Model>(model: &M, mode: TemplateMode) -> Result<Self, EngineError> {
        let Some((user, assistant, system, suffix)) = Self::markers(mode) else {
            return Ok(Self::default());
        };
        Ok(Self {
            user_prefix: model.tokenize(user, false, true)?,
            assistant_prefix: model.tokenize(assistant, false, true)?,
            system_prefix: model.tokenize(system, false, true)?,
            turn_suffix: model.tokenize(suffix, false, true)?,
        })
    }

    fn prefix(&self, role: Role) -> &[Token] {
        match role {
            Role::System => &self.system_prefix,
            Role::User => &self.user_prefix,
            Role::Assistant => &self.assistant_prefix,
        }
    }
}

/// Format a transcript into tokens.
///
/// Turns of at most one character are skipped. The result carries no BOS;
/// the window manager adds it when admitting the sequence.
pub fn format<M: Model>(
    model: &M,
    transcript: &Transcript,
    params: &PromptParams,
) -> Result<Vec<Token>, EngineError> {
    let template = RoleTemplate::build(model, params.template)?;
    let line_prefix = model.tokenize(&params.input_prefix, false, true)?;
    let line_suffix = model.tokenize(&params.input_suffix, false, true)?;

    let mut tokens = Vec::new();
    for message in transcript.iter().filter(|m| m.is_substantive()) {
        tokens.extend_from_slice(template.prefix(message.role()));
        if message.role() == Role::User {
            tokens.extend_from_slice(&line_prefix);
        }

        let content = if params.escape {
            process_escapes(message.content())
        } else {
            message.content().to_string()
        };
        tokens.extend(model.tokenize(&content, false, false)?);

        if message.role() == Role::User {
            tokens.extend_from_slice(&line_suffix);
        }
        tokens.extend_from_slice(&template.turn_suffix);
    }

    tokens.extend_from_slice(&template.assistant_prefix);
    Ok(tokens)
}

/// Rewrite literal backslash escapes into the characters they name.
///
/// Handles `\n`, `\r`, `\t`, `\'`, `\"` and `\\`. Unknown escapes and a
/// trailing lone backslash are kept verbatim.
pub fn process_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
