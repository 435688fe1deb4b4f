//! Content guardrail over streamed translation text
//!
//! The upstream delivers text deltas slightly ahead of the matching audio
//! deltas, so the text can be classified before the audio reaches the
//! carrier:
//!
//!   level 1 — pass, no further work
//!   level 2 — suspect register; audio goes out, correction runs in the
//!             background and is logged
//!   level 3 — disallowed; audio deltas are withheld, a filler utterance
//!             covers the gap, and the corrected text is re-synthesized
//!
//! Streaming checks run on ~100-char windows or sentence boundaries; the
//! level only escalates within one response and resets on the next.

pub mod dictionary;
pub mod fallback;
pub mod filter;

use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

use crate::config::Config;
use dictionary::get_filler_text;
use fallback::FallbackLlm;
use filter::{FilterResult, TextFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GuardrailLevel {
    Pass = 1,
    Correct = 2,
    Block = 3,
}

impl GuardrailLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone)]
pub struct GuardrailResult {
    pub level: GuardrailLevel,
    pub original_text: String,
    pub corrected_text: String,
    pub filler_text: String,
    pub correction_time_ms: f64,
}

impl GuardrailResult {
    pub fn is_blocked(&self) -> bool {
        self.level == GuardrailLevel::Block
    }
}

struct CheckerState {
    text_buffer: String,
    current_level: GuardrailLevel,
    events: Vec<Value>,
}

/// Streaming guardrail classifier. One per call; state resets per response.
pub struct GuardrailChecker {
    enabled: bool,
    target_language: String,
    text_filter: TextFilter,
    fallback: FallbackLlm,
    state: Mutex<CheckerState>,
}

impl GuardrailChecker {
    pub fn new(config: &Config, target_language: &str) -> Self {
        Self {
            enabled: config.guardrail.enabled,
            target_language: target_language.to_string(),
            text_filter: TextFilter::new(target_language),
            fallback: FallbackLlm::new(config),
            state: Mutex::new(CheckerState {
                text_buffer: String::new(),
                current_level: GuardrailLevel::Pass,
                events: Vec::new(),
            }),
        }
    }

    pub fn current_level(&self) -> GuardrailLevel {
        self.state.lock().unwrap().current_level
    }

    /// True while the current response is classified as disallowed; audio
    /// deltas must not reach the carrier.
    pub fn is_blocking(&self) -> bool {
        self.current_level() == GuardrailLevel::Block
    }

    /// Recorded guardrail events (for the call log).
    pub fn events(&self) -> Vec<Value> {
        self.state.lock().unwrap().events.clone()
    }

    /// New response: clear buffer and level.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.text_buffer.clear();
        state.current_level = GuardrailLevel::Pass;
    }

    /// Feed one streamed text delta; classify on ~100-char windows or
    /// sentence boundaries. The level only escalates.
    pub fn check_text_delta(&self, delta: &str) -> GuardrailLevel {
        if !self.enabled {
            return GuardrailLevel::Pass;
        }

        let mut state = self.state.lock().unwrap();
        state.text_buffer.push_str(delta);

        let at_boundary = delta
            .trim_end()
            .ends_with(&['.', '!', '?', '요', '다'][..]);
        if state.text_buffer.chars().count() >= 100 || at_boundary {
            let buffer = state.text_buffer.clone();
            let level = self.classify(&buffer);
            if level > state.current_level {
                state.current_level = level;
                info!(
                    "Guardrail level escalated to {} for text: '{}'",
                    level.as_u8(),
                    truncate(&buffer, 60)
                );
            }
        }
        state.current_level
    }

    /// Classify a complete text (used on response completion).
    pub fn check_full_text(&self, text: &str) -> GuardrailResult {
        if !self.enabled {
            return GuardrailResult {
                level: GuardrailLevel::Pass,
                original_text: text.to_string(),
                corrected_text: String::new(),
                filler_text: String::new(),
                correction_time_ms: 0.0,
            };
        }

        let filter_result = self.text_filter.check(text);
        let level = Self::level_for(&filter_result);
        GuardrailResult {
            level,
            original_text: text.to_string(),
            corrected_text: String::new(),
            filler_text: if level == GuardrailLevel::Block {
                get_filler_text(&self.target_language).to_string()
            } else {
                String::new()
            },
            correction_time_ms: 0.0,
        }
    }

    /// Level-3 path: correct synchronously (bounded by the fallback timeout)
    /// and record the event.
    pub async fn correct_text(&self, text: &str) -> GuardrailResult {
        let start = Instant::now();
        let mut result = self.check_full_text(text);
        if result.level == GuardrailLevel::Pass {
            return result;
        }

        let filter_result = self.text_filter.check(text);
        let corrected = self.fallback.correct(text, &self.target_language).await;
        result.correction_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        result.corrected_text = corrected.clone();

        let event = json!({
            "level": result.level.as_u8(),
            "original": text,
            "corrected": if corrected != text { Some(corrected) } else { None },
            "category": filter_result.categories(),
            "correction_time_ms": result.correction_time_ms,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.state.lock().unwrap().events.push(event);

        result
    }

    /// Level-2 path: correct in the background, log the delta for review.
    pub async fn correct_async(&self, text: &str) {
        let result = self.correct_text(text).await;
        if !result.corrected_text.is_empty() && result.corrected_text != text {
            info!(
                "Async correction (level 2): '{}' -> '{}' ({:.0}ms)",
                truncate(text, 60),
                truncate(&result.corrected_text, 60),
                result.correction_time_ms
            );
        }
    }

    fn classify(&self, text: &str) -> GuardrailLevel {
        Self::level_for(&self.text_filter.check(text))
    }

    fn level_for(result: &FilterResult) -> GuardrailLevel {
        if result.has_profanity() {
            GuardrailLevel::Block
        } else if result.has_informal() {
            GuardrailLevel::Correct
        } else {
            GuardrailLevel::Pass
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> GuardrailChecker {
        GuardrailChecker::new(&Config::default(), "ko")
    }

    #[test]
    fn test_clean_delta_passes() {
        let g = checker();
        assert_eq!(g.check_text_delta("예약을 확인했습니다."), GuardrailLevel::Pass);
        assert!(!g.is_blocking());
    }

    #[test]
    fn test_profanity_blocks() {
        let g = checker();
        assert_eq!(g.check_text_delta("씨발 뭐라고요."), GuardrailLevel::Block);
        assert!(g.is_blocking());
    }

    #[test]
    fn test_level_only_escalates_within_response() {
        let g = checker();
        g.check_text_delta("씨발.");
        assert_eq!(g.current_level(), GuardrailLevel::Block);
        // A later clean sentence does not de-escalate.
        g.check_text_delta("감사합니다.");
        assert_eq!(g.current_level(), GuardrailLevel::Block);
    }

    #[test]
    fn test_reset_clears_level() {
        let g = checker();
        g.check_text_delta("씨발.");
        g.reset();
        assert_eq!(g.current_level(), GuardrailLevel::Pass);
    }

    #[test]
    fn test_full_text_block_has_filler() {
        let g = checker();
        let result = g.check_full_text("씨발 안 된다고");
        assert!(result.is_blocked());
        assert_eq!(result.filler_text, "잠시만요.");
    }

    #[test]
    fn test_disabled_checker_never_triggers() {
        let mut config = Config::default();
        config.guardrail.enabled = false;
        let g = GuardrailChecker::new(&config, "ko");
        assert_eq!(g.check_text_delta("씨발."), GuardrailLevel::Pass);
    }
}
