//! Vote-decision normalization.
//!
//! Legacy contract kept for compatibility with downstream vote aggregation:
//! free text resolves to one of yes/no/conditional/abstain. Conditional
//! phrasing is checked before yes/no so "Yes, if budget is approved" lands
//! on conditional, not yes.

use serde::{Deserialize, Serialize};

/// Normalized vote decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Yes,
    No,
    Conditional,
    Abstain,
}

impl std::fmt::Display for VoteDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "yes"),
            Self::No => write!(f, "no"),
            Self::Conditional => write!(f, "conditional"),
            Self::Abstain => write!(f, "abstain"),
        }
    }
}

const CONDITIONAL_PHRASES: &[&str] = &["conditional", " if ", "only if", "provided that"];
const YES_KEYWORDS: &[&str] = &["yes", "approve", "agree", "support", "endorse"];
const NO_KEYWORDS: &[&str] = &["reject", "oppose", "decline"];

/// Normalize free-text vote language. Never fails; anything unrecognized is
/// an abstention.
pub fn parse_vote_decision(text: &str) -> VoteDecision {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return VoteDecision::Abstain;
    }

    // Conditional check runs first: "yes, if X" is a conditional vote.
    if CONDITIONAL_PHRASES.iter().any(|p| lower.contains(p)) {
        return VoteDecision::Conditional;
    }

    if YES_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return VoteDecision::Yes;
    }

    if is_no(&lower) || NO_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return VoteDecision::No;
    }

    VoteDecision::Abstain
}

/// Word-boundary-aware "no" detection: a bare "no", a leading "no ", a
/// punctuated "no," / "no.", or a trailing " no". Substrings inside other
/// words ("innovation") must not match.
fn is_no(lower: &str) -> bool {
    lower == "no"
        || lower.starts_with("no ")
        || lower.contains("no,")
        || lower.contains("no.")
        || lower.ends_with(" no")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_beats_yes() {
        assert_eq!(
            parse_vote_decision("Yes, if budget is approved"),
            VoteDecision::Conditional
        );
        assert_eq!(
            parse_vote_decision("Only if we hire a security lead first"),
            VoteDecision::Conditional
        );
        assert_eq!(
            parse_vote_decision("Approve, provided that legal signs off"),
            VoteDecision::Conditional
        );
        assert_eq!(parse_vote_decision("conditional"), VoteDecision::Conditional);
    }

    #[test]
    fn test_yes_variants() {
        assert_eq!(parse_vote_decision("Yes"), VoteDecision::Yes);
        assert_eq!(parse_vote_decision("I fully support this"), VoteDecision::Yes);
        assert_eq!(parse_vote_decision("Approve."), VoteDecision::Yes);
        assert_eq!(parse_vote_decision("Agree with the plan"), VoteDecision::Yes);
    }

    #[test]
    fn test_no_variants() {
        assert_eq!(parse_vote_decision("No"), VoteDecision::No);
        assert_eq!(parse_vote_decision("no way"), VoteDecision::No);
        assert_eq!(parse_vote_decision("No, too risky"), VoteDecision::No);
        assert_eq!(parse_vote_decision("Definitely no"), VoteDecision::No);
        assert_eq!(parse_vote_decision("I oppose this plan"), VoteDecision::No);
        assert_eq!(parse_vote_decision("reject"), VoteDecision::No);
        assert_eq!(parse_vote_decision("We must decline"), VoteDecision::No);
    }

    #[test]
    fn test_no_substring_does_not_match() {
        // "innovation" contains "no" but is not a rejection.
        assert_eq!(parse_vote_decision("innovation matters"), VoteDecision::Abstain);
        assert_eq!(parse_vote_decision("nothing to add"), VoteDecision::Abstain);
    }

    #[test]
    fn test_abstain_default() {
        assert_eq!(parse_vote_decision(""), VoteDecision::Abstain);
        assert_eq!(parse_vote_decision("   "), VoteDecision::Abstain);
        assert_eq!(parse_vote_decision("unsure about this one"), VoteDecision::Abstain);
    }

    #[test]
    fn test_display() {
        assert_eq!(VoteDecision::Yes.to_string(), "yes");
        assert_eq!(VoteDecision::No.to_string(), "no");
        assert_eq!(VoteDecision::Conditional.to_string(), "conditional");
        assert_eq!(VoteDecision::Abstain.to_string(), "abstain");
    }

    #[test]
    fn test_serde_tags() {
        let json = serde_json::to_string(&VoteDecision::Conditional).unwrap();
        assert_eq!(json, "\"conditional\"");
    }
}
