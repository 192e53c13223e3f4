//! Bounded multi-turn clarification with the original sender.
//!
//! An attempt is consumed only when a reply turns out to be unsatisfactory,
//! never when a question is sent. With a limit of two that allows exactly two
//! questions before the item must be escalated.

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info};

use crate::config::CLARIFICATION_MAX_ATTEMPTS;
use crate::error::ClarificationError;
use crate::pipeline::types::RawMessage;
use crate::store::record::{ClarificationExchange, ItemPatch, ItemStatus, ProcessingItem};
use crate::store::RecordStore;

/// Phrases that mean "stop asking me questions, get a person".
static ESCALATION_PHRASES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        \b(speak|talk|chat)\s+(to|with)\s+(a\s+|an\s+|some\s+)?(human|person|real\s+person|someone|somebody|representative|agent)\b
        | \bescalat(e|ed|ion)\b
        | \bhuman\s+(please|agent|being)\b
        | \b(real|actual)\s+person\b
        | \bstop\s+(asking|emailing)\b",
    )
    .expect("escalation phrase pattern is valid")
});

/// Start of an email client's quote header ("On Mon, Jan 5 ... wrote:").
static QUOTE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*On\s.+wrote:\s*$").expect("quote header pattern is valid")
});

/// Whether the text asks for a human.
pub fn detect_escalation_request(text: &str) -> bool {
    ESCALATION_PHRASES.is_match(&strip_quoted(text))
}

/// The sender's own words: drops `>`-quoted lines and everything after a quote header.
pub fn strip_quoted(body: &str) -> String {
    let fresh = match QUOTE_HEADER.find(body) {
        Some(m) => &body[..m.start()],
        None => body,
    };
    fresh
        .lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Whether another clarification question may be sent for this item.
pub fn can_retry(item: &ProcessingItem) -> bool {
    item.clarification_attempts < CLARIFICATION_MAX_ATTEMPTS
}

/// Pick the reply to an outstanding question from candidate messages.
///
/// A reply qualifies when it comes from the original sender, in the same
/// conversation, strictly after the question was sent. The most recent wins.
pub fn select_reply<'a>(
    item: &ProcessingItem,
    candidates: &'a [RawMessage],
) -> Option<&'a RawMessage> {
    let sent_at = item.clarification_sent_at?;
    candidates
        .iter()
        .filter(|m| m.id != item.item_id)
        .filter(|m| m.sender.trim().eq_ignore_ascii_case(item.sender.trim()))
        .filter(|m| m.conversation_id == item.conversation_id)
        .filter(|m| m.received_at > sent_at)
        .max_by_key(|m| m.received_at)
}

/// Rebuild the request body: original text, the Q&A transcript, then the latest reply.
pub fn merged_body(original: &str, history: &[ClarificationExchange]) -> String {
    let mut body = String::with_capacity(original.len() + 256);
    body.push_str(original.trim_end());

    if history.is_empty() {
        return body;
    }

    body.push_str("\n\n--- Clarification transcript ---\n");
    for (i, exchange) in history.iter().enumerate() {
        body.push_str(&format!("Q{}: {}\n", i + 1, exchange.question.trim()));
        body.push_str(&format!("A{}: {}\n", i + 1, exchange.answer.trim()));
    }

    if let Some(latest) = history.last() {
        body.push_str("\n--- Latest reply ---\n");
        body.push_str(latest.answer.trim());
    }
    body
}

/// Attempts bookkeeping after an unsatisfactory reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStatus {
    pub attempts: u32,
    pub can_retry: bool,
}

/// Tracks clarification state for items, on top of the record store.
pub struct ClarificationController {
    store: Arc<dyn RecordStore>,
}

impl ClarificationController {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    async fn load(&self, item_id: &str) -> Result<ProcessingItem, ClarificationError> {
        self.store
            .find(item_id)
            .await?
            .ok_or_else(|| ClarificationError::ItemMissing {
                id: item_id.to_string(),
            })
    }

    /// Record an outgoing question and park the item until the sender answers.
    ///
    /// Does not consume an attempt.
    pub async fn ask(
        &self,
        item_id: &str,
        question: &str,
    ) -> Result<ProcessingItem, ClarificationError> {
        let item = self.load(item_id).await?;
        if !can_retry(&item) {
            return Err(ClarificationError::AttemptsExhausted {
                id: item_id.to_string(),
                attempts: item.clarification_attempts,
            });
        }

        let patch = ItemPatch {
            last_clarification_question: Some(question.to_string()),
            clarification_sent_at: Some(Utc::now()),
            ..ItemPatch::status(ItemStatus::AwaitingClarification)
        };
        let updated = self.store.update(item_id, patch).await?;
        info!(
            item_id = %item_id,
            attempts = updated.clarification_attempts,
            "Clarification requested"
        );
        Ok(updated)
    }

    /// Find the sender's reply to the outstanding question among `candidates`.
    pub async fn check_for_reply(
        &self,
        item_id: &str,
        candidates: &[RawMessage],
    ) -> Result<Option<RawMessage>, ClarificationError> {
        let item = self.load(item_id).await?;
        if item.status != ItemStatus::AwaitingClarification {
            return Ok(None);
        }
        let reply = select_reply(&item, candidates).cloned();
        if let Some(ref r) = reply {
            debug!(item_id = %item_id, reply_id = %r.id, "Clarification reply found");
        }
        Ok(reply)
    }

    /// Consume one attempt. At the limit the caller must escalate.
    pub async fn record_unsatisfactory(
        &self,
        item_id: &str,
        reason: &str,
    ) -> Result<AttemptStatus, ClarificationError> {
        let item = self.load(item_id).await?;
        if !can_retry(&item) {
            return Err(ClarificationError::AttemptsExhausted {
                id: item_id.to_string(),
                attempts: item.clarification_attempts,
            });
        }

        let patch = ItemPatch {
            clarification_attempts: Some(item.clarification_attempts + 1),
            ..Default::default()
        };
        let updated = self.store.update(item_id, patch).await?;
        let status = AttemptStatus {
            attempts: updated.clarification_attempts,
            can_retry: can_retry(&updated),
        };
        info!(
            item_id = %item_id,
            attempts = status.attempts,
            can_retry = status.can_retry,
            reason = %reason,
            "Clarification reply unsatisfactory"
        );
        Ok(status)
    }

    /// Fold the sender's reply into the request and hand the item back to extraction.
    pub async fn merge_reply(
        &self,
        item_id: &str,
        reply_body: &str,
    ) -> Result<ProcessingItem, ClarificationError> {
        let item = self.load(item_id).await?;

        let mut history = item.clarification_history.clone();
        history.push(ClarificationExchange {
            question: item.last_clarification_question.clone().unwrap_or_default(),
            answer: strip_quoted(reply_body),
            timestamp: Utc::now(),
        });

        let patch = ItemPatch {
            body: Some(merged_body(&item.original_body, &history)),
            clarification_history: Some(history),
            ..ItemPatch::status(ItemStatus::InProgress)
        };
        let updated = self.store.update(item_id, patch).await?;
        info!(
            item_id = %item_id,
            exchanges = updated.clarification_history.len(),
            "Clarification reply merged"
        );
        Ok(updated)
    }
}
