//! Layered extraction of structured data from model free text.
//!
//! Models wrap JSON in markdown fences, XML tags, prose, or emit it bare
//! after a prefill. Rather than guessing one shape, strategies are tried in
//! order and the first one yielding valid data wins. On total failure every
//! attempted strategy and its error are reported, so a bad prompt is
//! diagnosable from the error alone.

use serde::de::DeserializeOwned;
use tracing::debug;

/// Extraction strategy, in attempt order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    /// The whole (trimmed) text is the payload.
    Direct,
    /// Payload inside a ``` fenced block (with or without a language tag).
    FencedBlock,
    /// Payload inside an XML-style tag pair.
    XmlTag,
    /// Payload completed from a `{` prefill: text starts mid-object.
    PrefillCompletion,
    /// Substring between the first `{` and last `}` (or `[`/`]`).
    BraceSpan,
}

impl std::fmt::Display for ParseStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::FencedBlock => write!(f, "fenced_block"),
            Self::XmlTag => write!(f, "xml_tag"),
            Self::PrefillCompletion => write!(f, "prefill_completion"),
            Self::BraceSpan => write!(f, "brace_span"),
        }
    }
}

/// All strategies failed; carries per-strategy diagnostics.
#[derive(Debug)]
pub struct StructuredParseError {
    pub attempts: Vec<(ParseStrategy, String)>,
}

impl std::fmt::Display for StructuredParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no strategy extracted valid structured data:")?;
        for (strategy, error) in &self.attempts {
            write!(f, " [{strategy}: {error}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for StructuredParseError {}

/// Extract a `T` from model output, trying each strategy in order. Returns
/// the value and the strategy that produced it.
pub fn extract_structured<T: DeserializeOwned>(
    text: &str,
) -> Result<(T, ParseStrategy), StructuredParseError> {
    let mut attempts = Vec::new();

    for strategy in [
        ParseStrategy::Direct,
        ParseStrategy::FencedBlock,
        ParseStrategy::XmlTag,
        ParseStrategy::PrefillCompletion,
        ParseStrategy::BraceSpan,
    ] {
        match candidate_payload(text, strategy) {
            Some(payload) => match serde_json::from_str::<T>(&payload) {
                Ok(value) => {
                    debug!(strategy = %strategy, "structured extraction succeeded");
                    return Ok((value, strategy));
                }
                Err(e) => attempts.push((strategy, e.to_string())),
            },
            None => attempts.push((strategy, "no candidate payload".to_string())),
        }
    }

    Err(StructuredParseError { attempts })
}

fn candidate_payload(text: &str, strategy: ParseStrategy) -> Option<String> {
    let trimmed = text.trim();
    match strategy {
        ParseStrategy::Direct => Some(trimmed.to_string()),
        ParseStrategy::FencedBlock => {
            let start = trimmed.find("```")?;
            let after_fence = &trimmed[start + 3..];
            // Skip an optional language tag on the fence line.
            let body_start = after_fence.find('\n')?;
            let body = &after_fence[body_start + 1..];
            let end = body.find("```")?;
            Some(body[..end].trim().to_string())
        }
        ParseStrategy::XmlTag => {
            let open_end = trimmed.find('>')?;
            let open = &trimmed[..open_end];
            let tag: String = open
                .trim_start_matches('<')
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if tag.is_empty() || !trimmed.starts_with('<') {
                return None;
            }
            let close = format!("</{tag}>");
            let close_at = trimmed.find(&close)?;
            Some(trimmed[open_end + 1..close_at].trim().to_string())
        }
        ParseStrategy::PrefillCompletion => {
            // A response continuing a `{` prefill starts with a key.
            if trimmed.starts_with('"') {
                Some(format!("{{{trimmed}"))
            } else {
                None
            }
        }
        ParseStrategy::BraceSpan => {
            let (open, close) = if let Some(first_brace) = trimmed.find('{') {
                (first_brace, trimmed.rfind('}')?)
            } else {
                (trimmed.find('[')?, trimmed.rfind(']')?)
            };
            if close <= open {
                return None;
            }
            Some(trimmed[open..=close].to_string())
        }
    }
}
