//! Comparison-question detection and research-question templating.
//!
//! A cheap keyword pre-filter runs first so the common non-comparison case
//! never pays for regex work. When keywords are present, patterns are tried
//! from most specific (timing, build-vs-buy, hire-vs-outsource) to most
//! general ("X vs Y", "should we X or Y"), with a bare "X or Y" extraction
//! as the last resort.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Keywords whose absence short-circuits detection.
const COMPARISON_KEYWORDS: &[&str] = &["vs", "versus", "or", "compare", "comparison", "tradeoff"];

/// Category of a detected comparison, used to pick question templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonType {
    /// Act now vs wait/delay.
    Timing,
    BuildVsBuy,
    HireVsOutsource,
    /// Any other two-option comparison.
    General,
}

impl std::fmt::Display for ComparisonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timing => write!(f, "timing"),
            Self::BuildVsBuy => write!(f, "build_vs_buy"),
            Self::HireVsOutsource => write!(f, "hire_vs_outsource"),
            Self::General => write!(f, "general"),
        }
    }
}

/// Priority tag on a generated research question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionPriority {
    High,
    Medium,
}

impl std::fmt::Display for QuestionPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// A templated research question for a detected comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchQuestion {
    pub question: String,
    pub priority: QuestionPriority,
}

/// A comparison extracted from a problem statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedComparison {
    pub comparison_type: ComparisonType,
    pub option_a: String,
    pub option_b: String,
}

impl DetectedComparison {
    /// 2–3 research questions tailored to the comparison type.
    pub fn research_questions(&self) -> Vec<ResearchQuestion> {
        let a = &self.option_a;
        let b = &self.option_b;
        match self.comparison_type {
            ComparisonType::Timing => vec![
                ResearchQuestion {
                    question: format!("What is the cost of delaying \"{a}\" by one quarter?"),
                    priority: QuestionPriority::High,
                },
                ResearchQuestion {
                    question: format!("What market or competitive window closes if we {b}?"),
                    priority: QuestionPriority::High,
                },
                ResearchQuestion {
                    question: format!("What new information would waiting on \"{a}\" actually produce?"),
                    priority: QuestionPriority::Medium,
                },
            ],
            ComparisonType::BuildVsBuy => vec![
                ResearchQuestion {
                    question: format!("What is the total cost of ownership of \"{a}\" over 3 years versus \"{b}\"?"),
                    priority: QuestionPriority::High,
                },
                ResearchQuestion {
                    question: format!("Which vendors cover the \"{b}\" option and how mature are they?"),
                    priority: QuestionPriority::High,
                },
                ResearchQuestion {
                    question: "Is this capability a durable differentiator or a commodity?".to_string(),
                    priority: QuestionPriority::Medium,
                },
            ],
            ComparisonType::HireVsOutsource => vec![
                ResearchQuestion {
                    question: format!("What is the fully-loaded annual cost of \"{a}\" versus \"{b}\"?"),
                    priority: QuestionPriority::High,
                },
                ResearchQuestion {
                    question: "How much institutional knowledge does this work generate, and who retains it?".to_string(),
                    priority: QuestionPriority::Medium,
                },
            ],
            ComparisonType::General => vec![
                ResearchQuestion {
                    question: format!("What are the decisive differences between \"{a}\" and \"{b}\" for our constraints?"),
                    priority: QuestionPriority::High,
                },
                ResearchQuestion {
                    question: format!("What would make \"{a}\" clearly wrong in 12 months?"),
                    priority: QuestionPriority::Medium,
                },
                ResearchQuestion {
                    question: format!("What would make \"{b}\" clearly wrong in 12 months?"),
                    priority: QuestionPriority::Medium,
                },
            ],
        }
    }
}

struct Patterns {
    timing: Regex,
    build_vs_buy: Regex,
    hire_vs_outsource: Regex,
    general_vs: Regex,
    should_we: Regex,
    bare_or: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        timing: Regex::new(
            r"(?i)\b(.{3,60}?)\s+now\s+(?:vs\.?|versus|or)\s+(wait(?:ing)?|later|delay(?:ing)?\w*)",
        )
        .expect("static regex"),
        build_vs_buy: Regex::new(r"(?i)\b(build\w*(?:\s+in[- ]house)?)\s+(?:vs\.?|versus|or)\s+(buy\w*)\b")
            .expect("static regex"),
        hire_vs_outsource: Regex::new(r"(?i)\b(hir\w+)\s+(?:vs\.?|versus|or)\s+(outsourc\w+)\b")
            .expect("static regex"),
        general_vs: Regex::new(r"(?i)\b([\w][\w\s-]{1,50}?)\s+(?:vs\.?|versus)\s+([\w][\w\s-]{1,50}?)(?:\s*[.?!,;:]|$)")
            .expect("static regex"),
        should_we: Regex::new(r"(?i)\bshould\s+(?:we|i)\s+(.{2,60}?)\s+or\s+(.{2,60}?)(?:\s*[.?!]|$)")
            .expect("static regex"),
        bare_or: Regex::new(r"(?i)\b([\w-]+(?:\s+[\w-]+){0,3})\s+or\s+([\w-]+(?:\s+[\w-]+){0,3})\b")
            .expect("static regex"),
    })
}

/// Detect a two-option comparison in a problem statement plus optional
/// context. Returns `None` quickly when no comparison keyword is present.
pub fn detect_comparison(problem: &str, context: Option<&str>) -> Option<DetectedComparison> {
    let combined = match context {
        Some(ctx) if !ctx.is_empty() => format!("{problem} {ctx}"),
        _ => problem.to_string(),
    };

    if !keyword_prefilter(&combined) {
        return None;
    }

    let p = patterns();

    if let Some(caps) = p.timing.captures(&combined) {
        return Some(DetectedComparison {
            comparison_type: ComparisonType::Timing,
            option_a: format!("{} now", clean_option(&caps[1])),
            option_b: clean_option(&caps[2]),
        });
    }
    if let Some(caps) = p.build_vs_buy.captures(&combined) {
        return Some(DetectedComparison {
            comparison_type: ComparisonType::BuildVsBuy,
            option_a: clean_option(&caps[1]),
            option_b: clean_option(&caps[2]),
        });
    }
    if let Some(caps) = p.hire_vs_outsource.captures(&combined) {
        return Some(DetectedComparison {
            comparison_type: ComparisonType::HireVsOutsource,
            option_a: clean_option(&caps[1]),
            option_b: clean_option(&caps[2]),
        });
    }
    if let Some(caps) = p.general_vs.captures(&combined) {
        return Some(DetectedComparison {
            comparison_type: ComparisonType::General,
            option_a: clean_option(&caps[1]),
            option_b: clean_option(&caps[2]),
        });
    }
    if let Some(caps) = p.should_we.captures(&combined) {
        return Some(DetectedComparison {
            comparison_type: ComparisonType::General,
            option_a: clean_option(&caps[1]),
            option_b: clean_option(&caps[2]),
        });
    }
    // Keyword filter fired but no specific pattern matched: bare "X or Y".
    if let Some(caps) = p.bare_or.captures(&combined) {
        return Some(DetectedComparison {
            comparison_type: ComparisonType::General,
            option_a: clean_option(&caps[1]),
            option_b: clean_option(&caps[2]),
        });
    }

    None
}

fn keyword_prefilter(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .any(|token| {
            COMPARISON_KEYWORDS.contains(&token)
                || token.starts_with("tradeoff")
                || token.starts_with("trade-off")
                || token.starts_with("compar")
        })
}

fn clean_option(raw: &str) -> String {
    raw.trim().trim_end_matches([',', '.', '?', '!']).to_string()
}
