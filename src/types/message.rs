//! Message types
//!
//! Defines chat transcript structures and roles.

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System prompt
    System,
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
}

/// A single chat turn. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    role: Role,
    content: String,
}

impl ChatMessage {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Turns of at most one character carry no content worth formatting.
    pub fn is_substantive(&self) -> bool {
        self.content.chars().nth(1).is_some()
    }
}

/// Ordered conversation, oldest turn first.
pub type Transcript = [ChatMessage];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = ChatMessage::user("Hello, world!");
        assert_eq!(msg.role(), Role::User);
        assert_eq!(msg.content(), "Hello, world!");
    }

    #[test]
    fn test_substantive_counts_chars_not_bytes() {
        assert!(!ChatMessage::user("").is_substantive());
        assert!(!ChatMessage::user("x").is_substantive());
        // one multi-byte character is still a single character
        assert!(!ChatMessage::user("é").is_substantive());
        assert!(ChatMessage::user("hi").is_substantive());
    }

    #[test]
    fn test_role_serialization() {
        let msg = ChatMessage::assistant("ok");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"assistant\""));
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
