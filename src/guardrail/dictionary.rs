//! Filler utterances per target language
//!
//! When a level-3 block discards a response mid-stream, the recipient hears
//! a short hold-on phrase instead of dead air while the corrected text is
//! re-synthesized.

use once_cell::sync::Lazy;
use std::collections::HashMap;

static FILLER_TEXTS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("ko", "잠시만요."),
        ("en", "One moment, please."),
        ("ja", "少々お待ちください。"),
        ("zh", "请稍等。"),
        ("es", "Un momento, por favor."),
    ])
});

pub fn get_filler_text(language: &str) -> &'static str {
    FILLER_TEXTS.get(language).copied().unwrap_or("One moment, please.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_language() {
        assert_eq!(get_filler_text("ko"), "잠시만요.");
    }

    #[test]
    fn test_unknown_language_falls_back_to_english() {
        assert_eq!(get_filler_text("fi"), "One moment, please.");
    }
}
