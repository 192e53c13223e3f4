//! Mass-ingestion circuit breaker.
//!
//! A sudden flood of new items (a mailing-list loop, a bulk forward) must not
//! be auto-processed. When a cycle fetches more new items than the threshold,
//! the whole cycle is halted for human review; nothing is processed partially.

use tracing::warn;

/// Subjects included in a blocked decision.
pub const MAX_SAMPLE_SUBJECTS: usize = 5;

/// Outcome of a guardrail check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailDecision {
    Approved,
    Blocked {
        count: usize,
        threshold: usize,
        /// Up to [`MAX_SAMPLE_SUBJECTS`] subjects for the reviewer.
        sample_subjects: Vec<String>,
    },
}

impl GuardrailDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Batch-size circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct Guardrail {
    threshold: usize,
}

impl Guardrail {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Block when `new_item_count > threshold`.
    pub fn check<S: AsRef<str>>(&self, new_item_count: usize, subjects: &[S]) -> GuardrailDecision {
        check(new_item_count, self.threshold, subjects)
    }
}

/// Block when `new_item_count > threshold`, carrying sample subjects.
pub fn check<S: AsRef<str>>(
    new_item_count: usize,
    threshold: usize,
    subjects: &[S],
) -> GuardrailDecision {
    if new_item_count <= threshold {
        return GuardrailDecision::Approved;
    }

    let sample_subjects: Vec<String> = subjects
        .iter()
        .take(MAX_SAMPLE_SUBJECTS)
        .map(|s| s.as_ref().to_string())
        .collect();

    warn!(
        count = new_item_count,
        threshold,
        "Guardrail tripped: too many new items in one cycle"
    );

    GuardrailDecision::Blocked {
        count: new_item_count,
        threshold,
        sample_subjects,
    }
}
