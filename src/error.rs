//! Error types for the change-intake engine.

use std::path::PathBuf;
use std::time::Duration;

use crate::store::record::ItemStatus;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Clarification error: {0}")]
    Clarification(#[from] ClarificationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors, returned by `EngineConfig::from_env` and `validate`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Item {id} already exists")]
    DuplicateId { id: String },

    #[error("Item {id} not found")]
    NotFound { id: String },

    #[error("Item {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: String,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("Invalid patch for item {id}: {reason}")]
    InvalidPatch { id: String, reason: String },

    #[error("Store {} is corrupted: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Message transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport authentication failed: {reason}")]
    Auth { reason: String },

    #[error("Transport call {operation} failed: {reason}")]
    Call { operation: String, reason: String },
}

/// Catalog search errors.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Catalog connection failed: {0}")]
    Connection(String),

    #[error("Catalog {operation} failed: {reason}")]
    Operation { operation: String, reason: String },
}

/// Errors from the classifier/extractor LLM collaborator.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM {stage} request failed: {reason}")]
    RequestFailed { stage: String, reason: String },

    #[error("LLM {stage} rate limited, retry after {retry_after:?}")]
    RateLimited {
        stage: String,
        retry_after: Option<Duration>,
    },

    #[error("Could not parse LLM {stage} response: {reason}")]
    Parse { stage: String, reason: String },
}

/// Clarification protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ClarificationError {
    #[error("Item {id} not found")]
    ItemMissing { id: String },

    #[error("Item {id} has used all {attempts} clarification attempts")]
    AttemptsExhausted { id: String, attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Orchestrator-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Guardrail halted cycle: {count} new items exceeds threshold {threshold}")]
    GuardrailHalted {
        count: usize,
        threshold: usize,
        samples: Vec<String>,
    },

    #[error("Step {step} failed for item {item_id}: {reason}")]
    Step {
        item_id: String,
        step: String,
        reason: String,
    },
}

/// Marks errors the retry layer may retry.
///
/// Auth, parse and catalog operation errors are deterministic for the same
/// input and are never retried.
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Server-suggested wait before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Transient for TransportError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Call { .. })
    }
}

impl Transient for SearchError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::RequestFailed { .. } | Self::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
