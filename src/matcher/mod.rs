//! Confidence-tiered fuzzy resolution of a requested name to catalog records.
//!
//! Flow:
//! 1. Strip one trailing noise word ("request", "ticket", ...) from the query
//! 2. Score every candidate against both the original and stripped query
//! 3. Rank by score (stable, so search order breaks ties)
//! 4. Tier the top score against the runner-up
//!
//! Only `exact` and `high_confidence` may drive an automatic update.

pub mod similarity;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Score at or above which a match is exact.
pub const EXACT_THRESHOLD: f64 = 0.99;
/// Lower bound of the high-confidence tier.
pub const HIGH_THRESHOLD: f64 = 0.90;
/// Lower bound of the medium-confidence tier.
pub const MEDIUM_THRESHOLD: f64 = 0.80;

/// Closest matches listed in explanations.
const EXPLAIN_TOP_N: usize = 3;

/// A catalog record returned by search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    /// Current field values, used as the "before" side of a change.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Candidate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Confidence bucket of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Exact,
    HighConfidence,
    MediumConfidence,
    Ambiguous,
    NoMatch,
}

impl MatchTier {
    /// Tier a top score against the runner-up's.
    pub fn from_scores(top: f64, runner_up: Option<f64>) -> Self {
        let runner_up = runner_up.unwrap_or(0.0);
        if top >= EXACT_THRESHOLD {
            Self::Exact
        } else if top >= HIGH_THRESHOLD {
            if runner_up >= HIGH_THRESHOLD {
                Self::Ambiguous
            } else {
                Self::HighConfidence
            }
        } else if top >= MEDIUM_THRESHOLD {
            if runner_up >= MEDIUM_THRESHOLD {
                Self::Ambiguous
            } else {
                Self::MediumConfidence
            }
        } else {
            Self::NoMatch
        }
    }

    /// Whether an update may be applied without a human.
    pub fn should_proceed(&self) -> bool {
        matches!(self, Self::Exact | Self::HighConfidence)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::HighConfidence => "high_confidence",
            Self::MediumConfidence => "medium_confidence",
            Self::Ambiguous => "ambiguous",
            Self::NoMatch => "no_match",
        }
    }
}

impl std::fmt::Display for MatchTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Free-function form of [`MatchTier::should_proceed`].
pub fn should_proceed(tier: MatchTier) -> bool {
    tier.should_proceed()
}

/// A candidate with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f64,
}

/// Result of resolving a requested name.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    /// Top-ranked candidate; `None` when nothing matched.
    pub best: Option<Candidate>,
    pub tier: MatchTier,
    /// Top score, 0.0 when there were no candidates.
    pub score: f64,
    /// All candidates, best first.
    pub ranked: Vec<ScoredCandidate>,
}

impl MatchOutcome {
    fn empty() -> Self {
        Self {
            best: None,
            tier: MatchTier::NoMatch,
            score: 0.0,
            ranked: Vec::new(),
        }
    }

    pub fn should_proceed(&self) -> bool {
        self.tier.should_proceed() && self.best.is_some()
    }

    /// The closest matches as `"Name (0.87)"`, best first.
    pub fn closest(&self) -> String {
        if self.ranked.is_empty() {
            return "none".to_string();
        }
        self.ranked
            .iter()
            .take(EXPLAIN_TOP_N)
            .map(|s| format!("{} ({:.2})", s.candidate.name, s.score))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Human-readable account of the resolution, for escalations.
    pub fn explain(&self, requested: &str) -> String {
        match self.tier {
            MatchTier::NoMatch if self.ranked.is_empty() => {
                format!("No catalog record was found for \"{requested}\".")
            }
            MatchTier::NoMatch => format!(
                "No catalog record closely matches \"{requested}\" (best score {:.2}). Closest matches: {}.",
                self.score,
                self.closest()
            ),
            MatchTier::Ambiguous => format!(
                "\"{requested}\" matches several catalog records equally well. Closest matches: {}.",
                self.closest()
            ),
            tier => format!(
                "\"{requested}\" resolved with {} ({:.2}). Closest matches: {}.",
                tier.label().replace('_', " "),
                self.score,
                self.closest()
            ),
        }
    }
}

/// Fuzzy resolver from a requested name to catalog search results.
#[derive(Debug, Clone)]
pub struct Matcher {
    /// Lower-cased noise words stripped from the end of a query.
    suffixes: Vec<String>,
}

impl Matcher {
    pub fn new<S: AsRef<str>>(suffixes: &[S]) -> Self {
        Self {
            suffixes: suffixes
                .iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Drop one trailing suffix token, if the query has more than that token.
    pub fn normalize(&self, requested: &str) -> String {
        let trimmed = requested.trim();
        let Some((head, last)) = trimmed.rsplit_once(char::is_whitespace) else {
            return trimmed.to_string();
        };
        let last = last
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if self.suffixes.iter().any(|s| *s == last) {
            head.trim_end().to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Resolve `requested` against `candidates`.
    pub fn resolve(&self, requested: &str, candidates: &[Candidate]) -> MatchOutcome {
        if candidates.is_empty() {
            return MatchOutcome::empty();
        }

        let normalized = self.normalize(requested);
        let mut ranked: Vec<ScoredCandidate> = candidates
            .iter()
            .map(|candidate| {
                let original = similarity::weighted_ratio(requested, &candidate.name);
                let stripped = if normalized == requested.trim() {
                    original
                } else {
                    similarity::weighted_ratio(&normalized, &candidate.name)
                };
                ScoredCandidate {
                    candidate: candidate.clone(),
                    score: original.max(stripped),
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let score = ranked[0].score;
        let tier = MatchTier::from_scores(score, ranked.get(1).map(|s| s.score));
        let best = (tier != MatchTier::NoMatch).then(|| ranked[0].candidate.clone());

        debug!(
            requested = %requested,
            normalized = %normalized,
            candidates = ranked.len(),
            score,
            tier = %tier,
            "Resolved catalog target"
        );

        MatchOutcome {
            best,
            tier,
            score,
            ranked,
        }
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MATCH_SUFFIXES)
    }
}
