use std::collections::HashSet;

use crate::config::{RECENCY_MAX_HOURS, RECENCY_MIN_HOURS};

/// Parse a `recencyHours` query/body value. Finite numbers are rounded and
/// clamped to the allowed window; a clamped value equal to the configured
/// default returns `None` so downstream code keeps default semantics.
pub fn parse_recency_hours(raw: Option<&str>, default_hours: u32) -> Option<u32> {
    let raw = raw?.trim();
    let parsed: f64 = raw.parse().ok()?;
    if !parsed.is_finite() {
        return None;
    }
    let clamped = (parsed.round() as i64)
        .clamp(RECENCY_MIN_HOURS as i64, RECENCY_MAX_HOURS as i64) as u32;
    if clamped == default_hours {
        None
    } else {
        Some(clamped)
    }
}

/// Truncate a string to at most `max_bytes` bytes at a character boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// Case-folded alphanumeric tokens of length > 3. Shared by the relevance
/// filter, the clusterer, and the novelty score so all three agree on what a
/// token is.
pub fn content_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 3)
        .map(|t| t.to_lowercase())
        .collect()
}

pub fn content_token_set(text: &str) -> HashSet<String> {
    content_tokens(text).into_iter().collect()
}

/// Count words as runs of word characters, the way the synthesis stage
/// reports them.
pub fn word_count(text: &str) -> usize {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .count()
}

/// Phrases that mark promotional copy rather than reporting. The filter
/// stage tolerates up to two matches; the article promotion guard rejects
/// any sentence containing one.
pub const PROMOTIONAL_PHRASES: &[&str] = &[
    "subscribe now",
    "sign up today",
    "limited time offer",
    "buy now",
    "click here",
    "special offer",
    "free trial",
    "discount code",
    "exclusive deal",
    "don't miss out",
];

pub fn promotional_phrase_count(text: &str) -> usize {
    let lowered = text.to_lowercase();
    PROMOTIONAL_PHRASES
        .iter()
        .filter(|phrase| lowered.contains(*phrase))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_clamps_low_and_high() {
        assert_eq!(parse_recency_hours(Some("5"), 24), Some(6));
        assert_eq!(parse_recency_hours(Some("720"), 24), Some(720));
        assert_eq!(parse_recency_hours(Some("721"), 24), Some(720));
    }

    #[test]
    fn recency_default_means_unset() {
        assert_eq!(parse_recency_hours(Some("24"), 24), None);
        assert_eq!(parse_recency_hours(Some("6"), 6), None);
        assert_eq!(parse_recency_hours(Some("168"), 168), None);
    }

    #[test]
    fn recency_rejects_garbage() {
        assert_eq!(parse_recency_hours(Some("abc"), 24), None);
        assert_eq!(parse_recency_hours(Some(""), 24), None);
        assert_eq!(parse_recency_hours(None, 24), None);
        assert_eq!(parse_recency_hours(Some("inf"), 24), None);
        assert_eq!(parse_recency_hours(Some("NaN"), 24), None);
    }

    #[test]
    fn recency_rounds_fractions() {
        assert_eq!(parse_recency_hours(Some("47.6"), 24), Some(48));
    }

    #[test]
    fn recency_is_idempotent_over_its_clamp() {
        for input in ["5", "6", "24", "300", "720", "721", "10000"] {
            if let Some(first) = parse_recency_hours(Some(input), 24) {
                let again = parse_recency_hours(Some(&first.to_string()), 24);
                assert_eq!(again, Some(first), "input {input}");
            }
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "Hello 世界";
        let truncated = truncate_to_char_boundary(text, 8);
        assert!(truncated.len() <= 8);
        assert!(text.starts_with(truncated));
        assert_eq!(truncate_to_char_boundary("short", 100), "short");
    }

    #[test]
    fn tokens_fold_case_and_drop_short_words(){
        let tokens = content_tokens("The EU's AI Act passed; regulators cheered");
        assert!(tokens.contains(&"passed".to_string()));
        assert!(tokens.contains(&"regulators".to_string()));
        assert!(!tokens.iter().any(|t| t == "the" || t == "ai" || t == "eu"));
    }

    #[test]
    fn word_count_counts_word_runs() {
        assert_eq!(word_count("one  two\nthree"), 3);
        assert_eq!(word_count("hy-phen, dots... [1]"), 4);
        assert_eq!(word_count(""), 0);
    }
}
