//! External collaborator contracts and the types that cross them.
//!
//! The engine owns none of these capabilities. Classification and extraction
//! are LLM-backed, the catalog is a search index, and the transport is a
//! mailbox; each is reached only through the narrow traits below.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LlmError, SearchError, TransportError};
use crate::store::record::{Category, ExtractedData, FieldChange};

pub use crate::matcher::Candidate;

// ── Inbound message ─────────────────────────────────────────────────

/// A message as fetched from the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Stable transport-native ID.
    pub id: String,
    /// Thread key; replies share it with the message they answer.
    pub conversation_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

// ── Classifier ──────────────────────────────────────────────────────

/// Classifier verdict for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    /// 0-100.
    pub confidence: u8,
    pub reason: String,
}

/// Decides whether a message can be auto-processed.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        subject: &str,
        sender: &str,
        body: &str,
    ) -> Result<Classification, LlmError>;
}

// ── Extractor ───────────────────────────────────────────────────────

/// Pulls the structured change request out of a message.
///
/// Implementations fail soft: an unparseable model response is reported as
/// `completeness_score = 0` with a description, not as an error.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        subject: &str,
        sender: &str,
        body: &str,
    ) -> Result<ExtractedData, LlmError>;
}

// ── Catalog ─────────────────────────────────────────────────────────

/// What the catalog reports after applying a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogChange {
    pub success: bool,
    /// Before/after for every changed field.
    pub changes: Vec<FieldChange>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Searchable collection of target records.
#[async_trait]
pub trait CatalogSearch: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>, SearchError>;

    async fn get(&self, id: &str) -> Result<Option<Candidate>, SearchError>;

    async fn update(
        &self,
        id: &str,
        field_patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<CatalogChange, SearchError>;
}

// ── Transport ───────────────────────────────────────────────────────

/// Mailbox access: pure I/O, no business logic.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Messages from the last `since_days` days, minus `exclude_ids`.
    async fn fetch_new(
        &self,
        since_days: u32,
        exclude_ids: &[String],
    ) -> Result<Vec<RawMessage>, TransportError>;

    /// Reply in-thread to the sender of `item_id`.
    async fn reply(&self, item_id: &str, body: &str) -> Result<(), TransportError>;

    /// Forward `item_id` to humans with a comment.
    async fn forward(
        &self,
        item_id: &str,
        recipients: &[String],
        comment: &str,
    ) -> Result<(), TransportError>;

    /// Send a fresh message.
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError>;
}
