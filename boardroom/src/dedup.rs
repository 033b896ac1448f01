//! Near-duplicate filtering for persona contributions.
//!
//! Primary scoring is embedding cosine similarity; when the embedding
//! provider is down the scorer degrades to keyword Jaccard overlap, and when
//! no similarity signal is available at all it fails open: a contribution is
//! never rejected solely because scoring failed. Missed duplicates cost
//! quality; false rejections cost board members, which is worse.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::cosine_similarity;
use crate::model::SharedEmbeddingProvider;

/// Jaccard similarity runs numerically lower than cosine similarity, so the
/// duplicate threshold is rescaled on the keyword path. The 0.6 factor is an
/// empirical calibration against the embedding path; override it via
/// [`DedupConfig`] rather than re-deriving it.
pub const KEYWORD_THRESHOLD_SCALE: f64 = 0.6;

/// Words carrying no topical signal, excluded from keyword sets.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "has", "have", "was",
    "were", "will", "with", "this", "that", "these", "those", "from", "they", "them", "their",
    "would", "could", "should", "about", "which", "when", "what", "where", "there", "been",
    "being", "into", "more", "most", "some", "such", "than", "then", "its", "our", "out", "also",
];

/// Which scoring path produced a novelty verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMethod {
    /// Embedding cosine similarity (primary).
    Embedding,
    /// Keyword Jaccard overlap (fallback).
    Keyword,
    /// No similarity signal available; accepted fail-open.
    FailOpen,
}

impl std::fmt::Display for SimilarityMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedding => write!(f, "embedding"),
            Self::Keyword => write!(f, "keyword"),
            Self::FailOpen => write!(f, "fail_open"),
        }
    }
}

/// Verdict for one candidate against a set of prior texts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoveltyCheck {
    pub is_novel: bool,
    /// Maximum similarity observed against any prior text.
    pub max_similarity: f64,
    pub method: SimilarityMethod,
}

/// Dedup thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Cosine similarity above which two texts are duplicates.
    pub threshold: f64,
    /// Rescale applied to `threshold` on the keyword fallback path.
    pub keyword_threshold_scale: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.80,
            keyword_threshold_scale: KEYWORD_THRESHOLD_SCALE,
        }
    }
}

/// One dropped item with the evidence that condemned it.
#[derive(Debug, Clone)]
pub struct DroppedDuplicate<T> {
    pub item: T,
    pub similarity: f64,
    pub method: SimilarityMethod,
}

/// Result of filtering one round's contributions.
#[derive(Debug, Clone)]
pub struct FilterOutcome<T> {
    pub kept: Vec<T>,
    pub dropped: Vec<DroppedDuplicate<T>>,
}

impl<T> FilterOutcome<T> {
    /// Fraction of the input that survived filtering. 1.0 for empty input.
    pub fn novelty_rate(&self) -> f64 {
        let total = self.kept.len() + self.dropped.len();
        if total == 0 {
            1.0
        } else {
            self.kept.len() as f64 / total as f64
        }
    }
}

/// Similarity-based duplicate filter with graceful degradation.
pub struct SemanticDedup {
    embeddings: Option<SharedEmbeddingProvider>,
    config: DedupConfig,
}

impl SemanticDedup {
    pub fn new(embeddings: SharedEmbeddingProvider, config: DedupConfig) -> Self {
        Self {
            embeddings: Some(embeddings),
            config,
        }
    }

    /// A filter with no embedding provider: keyword scoring only.
    pub fn keyword_only(config: DedupConfig) -> Self {
        Self {
            embeddings: None,
            config,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// The same filter with the duplicate threshold replaced. Session setup
    /// uses this so the session config's threshold is the one that applies.
    pub fn with_threshold(&self, threshold: f64) -> Self {
        Self {
            embeddings: self.embeddings.clone(),
            config: DedupConfig {
                threshold,
                ..self.config.clone()
            },
        }
    }

    /// Score `candidate` against `prior_texts`. Never errors: degraded
    /// scoring paths are taken instead, and logged.
    pub async fn check_novelty(&self, candidate: &str, prior_texts: &[&str]) -> NoveltyCheck {
        if prior_texts.is_empty() {
            return NoveltyCheck {
                is_novel: true,
                max_similarity: 0.0,
                method: SimilarityMethod::Embedding,
            };
        }

        if let Some(embeddings) = &self.embeddings {
            match self
                .embedding_novelty(embeddings, candidate, prior_texts)
                .await
            {
                Ok(check) => return check,
                Err(reason) => {
                    warn!(
                        operation = "check_novelty",
                        cause = %reason,
                        fallback = "keyword_jaccard",
                        "embedding similarity unavailable, degrading to keyword overlap"
                    );
                }
            }
        }

        self.keyword_novelty(candidate, prior_texts)
    }

    async fn embedding_novelty(
        &self,
        embeddings: &SharedEmbeddingProvider,
        candidate: &str,
        prior_texts: &[&str],
    ) -> Result<NoveltyCheck, String> {
        let candidate_vec = embeddings
            .embed(candidate)
            .await
            .map_err(|e| e.to_string())?;

        let mut max_similarity = 0.0f64;
        for prior in prior_texts {
            let prior_vec = embeddings.embed(prior).await.map_err(|e| e.to_string())?;
            let similarity = cosine_similarity(&candidate_vec, &prior_vec);
            if similarity > max_similarity {
                max_similarity = similarity;
            }
            // Early exit: one confirmed duplicate is enough.
            if similarity > self.config.threshold {
                return Ok(NoveltyCheck {
                    is_novel: false,
                    max_similarity: similarity,
                    method: SimilarityMethod::Embedding,
                });
            }
        }

        Ok(NoveltyCheck {
            is_novel: true,
            max_similarity,
            method: SimilarityMethod::Embedding,
        })
    }

    fn keyword_novelty(&self, candidate: &str, prior_texts: &[&str]) -> NoveltyCheck {
        let candidate_set = keyword_set(candidate);
        if candidate_set.is_empty() {
            // No signal either way; accept rather than block the board.
            warn!(
                operation = "check_novelty",
                cause = "empty keyword set",
                fallback = "fail_open",
                "no similarity signal available, accepting contribution"
            );
            return NoveltyCheck {
                is_novel: true,
                max_similarity: 0.0,
                method: SimilarityMethod::FailOpen,
            };
        }

        let scaled_threshold = self.config.threshold * self.config.keyword_threshold_scale;
        let mut max_similarity = 0.0f64;
        for prior in prior_texts {
            let similarity = jaccard_similarity(&candidate_set, &keyword_set(prior));
            if similarity > max_similarity {
                max_similarity = similarity;
            }
            if similarity > scaled_threshold {
                return NoveltyCheck {
                    is_novel: false,
                    max_similarity: similarity,
                    method: SimilarityMethod::Keyword,
                };
            }
        }

        NoveltyCheck {
            is_novel: true,
            max_similarity,
            method: SimilarityMethod::Keyword,
        }
    }

    /// Filter a round's contributions in input order. Each item is compared
    /// only against previously *kept* items in the same call, so the first
    /// of two near-duplicates wins. Callers wanting reproducible outcomes
    /// must pass items in a stable order.
    pub async fn filter_duplicates<T>(
        &self,
        items: Vec<T>,
        text_of: impl Fn(&T) -> &str,
    ) -> FilterOutcome<T> {
        let mut kept: Vec<T> = Vec::with_capacity(items.len());
        let mut dropped = Vec::new();

        for item in items {
            let prior: Vec<&str> = kept.iter().map(&text_of).collect();
            let check = self.check_novelty(text_of(&item), &prior).await;
            if check.is_novel {
                kept.push(item);
            } else {
                debug!(
                    similarity = check.max_similarity,
                    method = %check.method,
                    "contribution dropped as near-duplicate"
                );
                dropped.push(DroppedDuplicate {
                    item,
                    similarity: check.max_similarity,
                    method: check.method,
                });
            }
        }

        FilterOutcome { kept, dropped }
    }
}

/// Lowercased word set minus stopwords and words of length <= 2.
fn keyword_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOPWORDS.contains(w))
        .map(|w| w.to_string())
        .collect()
}

fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
