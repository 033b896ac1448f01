//! Confidence-level parsing.

use std::sync::OnceLock;

use regex::Regex;

/// Default returned for empty or unparseable input.
const DEFAULT_CONFIDENCE: f64 = 0.6;

fn number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(%?)").expect("static regex"))
}

/// Parse a confidence expression into [0.0, 1.0].
///
/// Accepts named levels (`high`/`strong` → 0.85, `medium`/`moderate` → 0.6,
/// `low`/`weak` → 0.3), bare numbers, and percentages. Values above 1 or
/// suffixed with `%` are treated as percentages. Never fails: anything
/// unparseable yields 0.6 (medium).
pub fn parse_confidence(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return DEFAULT_CONFIDENCE;
    }

    let lower = trimmed.to_lowercase();
    if contains_word(&lower, &["high", "strong"]) {
        return 0.85;
    }
    if contains_word(&lower, &["medium", "moderate"]) {
        return 0.6;
    }
    if contains_word(&lower, &["low", "weak"]) {
        return 0.3;
    }

    let Some(captures) = number_pattern().captures(&lower) else {
        return DEFAULT_CONFIDENCE;
    };
    let Ok(mut value) = captures[1].parse::<f64>() else {
        return DEFAULT_CONFIDENCE;
    };
    let is_percent = &captures[2] == "%";
    if is_percent || value > 1.0 {
        value /= 100.0;
    }
    value.clamp(0.0, 1.0)
}

fn contains_word(text: &str, words: &[&str]) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|token| words.contains(&token))
}
