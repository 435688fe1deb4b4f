//! Rule-based text filter
//!
//! Regex dictionary matching over streamed translation text. Profanity and
//! banned phrases classify as blocking; informal register (for languages
//! where the relay must keep a polite register on the phone) classifies as
//! correctable.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCategory {
    Profanity,
    Informal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterMatch {
    pub category: FilterCategory,
    pub matched: String,
}

#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    pub matches: Vec<FilterMatch>,
}

impl FilterResult {
    pub fn has_profanity(&self) -> bool {
        self.matches
            .iter()
            .any(|m| m.category == FilterCategory::Profanity)
    }

    pub fn has_informal(&self) -> bool {
        self.matches
            .iter()
            .any(|m| m.category == FilterCategory::Informal)
    }

    pub fn categories(&self) -> String {
        let mut cats: Vec<&str> = self
            .matches
            .iter()
            .map(|m| match m.category {
                FilterCategory::Profanity => "profanity",
                FilterCategory::Informal => "informal",
            })
            .collect();
        cats.sort_unstable();
        cats.dedup();
        cats.join(",")
    }
}

static PROFANITY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Korean profanity stems.
        r"씨발|시발|ㅅㅂ|개새끼|병신|지랄|좆",
        // English.
        r"(?i)\b(fuck|shit|bitch|asshole)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("profanity pattern"))
    .collect()
});

/// Korean informal sentence endings. The relay speaks to strangers on the
/// phone, so banmal endings need correction to the polite register.
static INFORMAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(했|간|온|줘|래|냐|니|야)\s*[.!?]?\s*$",
        r"(해라|해봐|말해|줘봐)\s*[.!?]?\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("informal pattern"))
    .collect()
});

pub struct TextFilter {
    target_language: String,
}

impl TextFilter {
    pub fn new(target_language: &str) -> Self {
        Self {
            target_language: target_language.to_string(),
        }
    }

    pub fn check(&self, text: &str) -> FilterResult {
        let mut result = FilterResult::default();

        for pattern in PROFANITY_PATTERNS.iter() {
            if let Some(m) = pattern.find(text) {
                result.matches.push(FilterMatch {
                    category: FilterCategory::Profanity,
                    matched: m.as_str().to_string(),
                });
            }
        }

        // Register rules only apply to Korean output.
        if self.target_language == "ko" {
            for pattern in INFORMAL_PATTERNS.iter() {
                if let Some(m) = pattern.find(text) {
                    result.matches.push(FilterMatch {
                        category: FilterCategory::Informal,
                        matched: m.as_str().to_string(),
                    });
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_passes() {
        let filter = TextFilter::new("ko");
        let result = filter.check("예약을 도와드리겠습니다.");
        assert!(!result.has_profanity());
        assert!(!result.has_informal());
    }

    #[test]
    fn test_profanity_detected() {
        let filter = TextFilter::new("ko");
        assert!(filter.check("씨발 진짜").has_profanity());
        assert!(filter.check("oh fuck no").has_profanity());
    }

    #[test]
    fn test_informal_ending_detected() {
        let filter = TextFilter::new("ko");
        let result = filter.check("내일 2시에 와 줘");
        assert!(result.has_informal());
        assert!(!result.has_profanity());
    }

    #[test]
    fn test_informal_rules_only_for_korean() {
        let filter = TextFilter::new("en");
        assert!(!filter.check("내일 2시에 와 줘").has_informal());
    }

    #[test]
    fn test_categories_string() {
        let filter = TextFilter::new("ko");
        let result = filter.check("씨발 빨리 해라");
        assert_eq!(result.categories(), "informal,profanity");
    }
}
