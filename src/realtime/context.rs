//! Conversation context manager
//!
//! Sliding window of recent turns, injected into a session before the next
//! translation so pronouns and terminology stay consistent. Injection uses
//! `conversation.item.create` — never `session.update`, which would reset
//! the session's configuration.

use tracing::debug;

use crate::realtime::session::RealtimeSession;

pub const MAX_TURNS: usize = 6;
pub const MAX_CHARS_PER_TURN: usize = 100;

#[derive(Debug, Clone)]
struct Turn {
    role: String,
    text: String,
}

/// Six-turn window with a per-turn character cap. Cost: roughly 200 tokens,
/// negligible next to the audio.
pub struct ContextManager {
    turns: Vec<Turn>,
    max_turns: usize,
    max_chars: usize,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(MAX_TURNS, MAX_CHARS_PER_TURN)
    }
}

impl ContextManager {
    pub fn new(max_turns: usize, max_chars: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_turns,
            max_chars,
        }
    }

    /// Trim and append a completed turn, evicting the oldest when full.
    pub fn add_turn(&mut self, role: &str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.turns.push(Turn {
            role: role.to_string(),
            text: text.chars().take(self.max_chars).collect(),
        });
        if self.turns.len() > self.max_turns {
            let excess = self.turns.len() - self.max_turns;
            self.turns.drain(..excess);
        }
        debug!("Context: added {} turn ({} total)", role, self.turns.len());
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn format_context(&self) -> String {
        self.turns
            .iter()
            .map(|t| {
                let label = if t.role == "user" { "User" } else { "Recipient" };
                format!("{label}: {}", t.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Send the window to the given session as one context item.
    pub async fn inject_context(&self, session: &RealtimeSession) {
        let context = self.format_context();
        if context.is_empty() {
            return;
        }
        let item = format!(
            "[Previous conversation for context]\n{context}\n[End context — now translate the next utterance]"
        );
        if let Err(e) = session.send_text_item(&item).await {
            debug!("Context injection failed: {e}");
            return;
        }
        debug!("Context injected: {} turns", self.turns.len());
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_evicts_oldest() {
        let mut ctx = ContextManager::default();
        for i in 0..10 {
            ctx.add_turn("user", &format!("turn {i}"));
        }
        assert_eq!(ctx.turn_count(), MAX_TURNS);
        let formatted = ctx.format_context();
        assert!(!formatted.contains("turn 3"));
        assert!(formatted.contains("turn 4"));
        assert!(formatted.contains("turn 9"));
    }

    #[test]
    fn test_per_turn_char_cap() {
        let mut ctx = ContextManager::new(6, 10);
        ctx.add_turn("recipient", "a very long sentence that should be cut");
        assert_eq!(ctx.format_context(), "Recipient: a very lon");
    }

    #[test]
    fn test_empty_and_whitespace_ignored() {
        let mut ctx = ContextManager::default();
        ctx.add_turn("user", "");
        ctx.add_turn("user", "   ");
        assert_eq!(ctx.turn_count(), 0);
        assert_eq!(ctx.format_context(), "");
    }

    #[test]
    fn test_role_labels() {
        let mut ctx = ContextManager::default();
        ctx.add_turn("user", "hello");
        ctx.add_turn("recipient", "안녕하세요");
        assert_eq!(ctx.format_context(), "User: hello\nRecipient: 안녕하세요");
    }

    #[test]
    fn test_clear() {
        let mut ctx = ContextManager::default();
        ctx.add_turn("user", "hello");
        ctx.clear();
        assert_eq!(ctx.turn_count(), 0);
    }
}
