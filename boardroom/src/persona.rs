//! Persona catalog — the configured board-member profiles.
//!
//! Profiles are loaded once per session and read-only during deliberation.
//! Panel selection scores each profile's capability descriptors against the
//! problem statement and fills remaining seats in catalog order, so a panel
//! is reproducible for a given problem and catalog.

use serde::{Deserialize, Serialize};

/// Archetype/category of a board persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    /// Big-picture opportunity framing.
    Visionary,
    /// Risk, downside, and failure-mode analysis.
    Skeptic,
    /// Unit economics and capital allocation.
    Finance,
    /// Execution, staffing, and process.
    Operations,
    /// Customer and market perspective.
    Customer,
    /// Technical feasibility and architecture.
    Technologist,
}

impl std::fmt::Display for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Visionary => write!(f, "visionary"),
            Self::Skeptic => write!(f, "skeptic"),
            Self::Finance => write!(f, "finance"),
            Self::Operations => write!(f, "operations"),
            Self::Customer => write!(f, "customer"),
            Self::Technologist => write!(f, "technologist"),
        }
    }
}

/// A configured board-member profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaProfile {
    /// Unique code, stable across sessions.
    pub code: String,
    pub display_name: String,
    pub archetype: Archetype,
    /// Behavioral traits injected into the persona's prompt.
    pub traits: Vec<String>,
    /// Vote weight before any session-specific adjustment.
    pub default_weight: f64,
    /// Generation temperature before the facilitator's phase schedule.
    /// Personas without one inherit the session's base temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Expertise the persona claims; drives panel selection.
    pub capabilities: Vec<String>,
}

impl PersonaProfile {
    /// Relevance of this persona to a problem statement: the number of
    /// capability descriptors appearing in the lowercased problem text.
    fn relevance(&self, problem_lower: &str) -> usize {
        self.capabilities
            .iter()
            .filter(|cap| problem_lower.contains(cap.as_str()))
            .count()
    }
}

/// The persona catalog a session selects its panel from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaCatalog {
    personas: Vec<PersonaProfile>,
}

impl PersonaCatalog {
    pub fn new(personas: Vec<PersonaProfile>) -> Self {
        Self { personas }
    }

    /// The built-in board of six archetypes.
    pub fn builtin() -> Self {
        let persona = |code: &str,
                       name: &str,
                       archetype: Archetype,
                       traits: &[&str],
                       weight: f64,
                       temperature: f32,
                       capabilities: &[&str]| PersonaProfile {
            code: code.to_string(),
            display_name: name.to_string(),
            archetype,
            traits: traits.iter().map(|s| s.to_string()).collect(),
            default_weight: weight,
            temperature: Some(temperature),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        };

        Self::new(vec![
            persona(
                "visionary",
                "The Visionary",
                Archetype::Visionary,
                &["ambitious", "contrarian", "market-first"],
                1.0,
                0.85,
                &["growth", "market", "expansion", "product", "strategy", "launch"],
            ),
            persona(
                "skeptic",
                "The Skeptic",
                Archetype::Skeptic,
                &["cautious", "evidence-driven", "adversarial"],
                1.1,
                0.55,
                &["risk", "compliance", "legal", "security", "downside", "failure"],
            ),
            persona(
                "cfo",
                "The CFO",
                Archetype::Finance,
                &["numerate", "capital-disciplined"],
                1.0,
                0.5,
                &["cost", "budget", "revenue", "margin", "pricing", "funding", "cash"],
            ),
            persona(
                "coo",
                "The Operator",
                Archetype::Operations,
                &["pragmatic", "process-minded"],
                0.9,
                0.6,
                &["hiring", "team", "process", "operations", "timeline", "capacity"],
            ),
            persona(
                "customer_advocate",
                "The Customer Advocate",
                Archetype::Customer,
                &["empathetic", "retention-focused"],
                0.9,
                0.7,
                &["customer", "user", "churn", "retention", "support", "onboarding"],
            ),
            persona(
                "cto",
                "The CTO",
                Archetype::Technologist,
                &["technical", "tradeoff-aware"],
                1.0,
                0.6,
                &["technology", "platform", "infrastructure", "build", "migrate", "data"],
            ),
        ])
    }

    pub fn personas(&self) -> &[PersonaProfile] {
        &self.personas
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn get(&self, code: &str) -> Option<&PersonaProfile> {
        self.personas.iter().find(|p| p.code == code)
    }

    /// Select a panel of up to `size` personas for a problem. Personas with
    /// matching capabilities rank first; remaining seats fill in catalog
    /// order. The returned order is the stable persona order used for
    /// round execution and dedup filtering.
    pub fn select_panel(&self, problem: &str, size: usize) -> Vec<PersonaProfile> {
        let problem_lower = problem.to_lowercase();
        let mut indexed: Vec<(usize, usize)> = self
            .personas
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.relevance(&problem_lower)))
            .collect();
        // Stable sort: ties keep catalog order.
        indexed.sort_by(|a, b| b.1.cmp(&a.1));
        indexed
            .into_iter()
            .take(size)
            .map(|(i, _)| self.personas[i].clone())
            .collect()
    }
}
