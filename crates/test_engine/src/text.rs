//! Reference text: the immutable token sequence a session is judged
//! against.

use serde::Serialize;

/// Ordered tokens plus the space-joined form the client renders. Immutable
/// after construction; the same text judges every keystroke of a session.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceText {
    tokens: Vec<String>,
    joined: String,
    #[serde(skip)]
    chars: Vec<char>,
}

impl ReferenceText {
    pub fn from_tokens(tokens: Vec<String>) -> Self {
        let joined = tokens.join(" ");
        let chars = joined.chars().collect();
        Self {
            tokens,
            joined,
            chars,
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn joined(&self) -> &str {
        &self.joined
    }

    /// Total characters including the single-space delimiters.
    pub fn char_count(&self) -> usize {
        self.chars.len()
    }

    /// Character at a typing position, if in range.
    pub fn char_at(&self, position: usize) -> Option<char> {
        self.chars.get(position).copied()
    }
}
