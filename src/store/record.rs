//! Processing item model and its status state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a processing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Recorded, classifier not yet consulted.
    Received,
    /// Classifier verdict attached.
    Classified,
    RoutedHelp,
    RoutedDontHelp,
    RoutedEscalate,
    /// Extraction is (re)running.
    InProgress,
    /// A clarification question is out; waiting for the sender.
    AwaitingClarification,
    DataExtracted,
    /// Target resolved and the field-level change is ready to apply.
    UpdatePrepared,
    /// Change applied to the catalog; sender not yet notified.
    IndexUpdated,
    CompletedSuccess,
    CompletedDontHelp,
    /// Handed to a human.
    Escalated,
}

impl ItemStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: ItemStatus) -> bool {
        use ItemStatus::*;

        if target == Escalated {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            (Received, Classified) |
            (Classified, RoutedHelp) | (Classified, RoutedDontHelp) | (Classified, RoutedEscalate) |
            (RoutedHelp, InProgress) |
            (RoutedDontHelp, CompletedDontHelp) |
            (InProgress, AwaitingClarification) | (InProgress, DataExtracted) |
            (AwaitingClarification, InProgress) |
            (DataExtracted, UpdatePrepared) |
            (UpdatePrepared, IndexUpdated) |
            (IndexUpdated, CompletedSuccess)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompletedSuccess | Self::CompletedDontHelp | Self::Escalated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Classified => "classified",
            Self::RoutedHelp => "routed_help",
            Self::RoutedDontHelp => "routed_dont_help",
            Self::RoutedEscalate => "routed_escalate",
            Self::InProgress => "in_progress",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::DataExtracted => "data_extracted",
            Self::UpdatePrepared => "update_prepared",
            Self::IndexUpdated => "index_updated",
            Self::CompletedSuccess => "completed_success",
            Self::CompletedDontHelp => "completed_dont_help",
            Self::Escalated => "escalated",
        }
    }

    /// Every status, in lifecycle order.
    pub const ALL: [ItemStatus; 13] = [
        Self::Received,
        Self::Classified,
        Self::RoutedHelp,
        Self::RoutedDontHelp,
        Self::RoutedEscalate,
        Self::InProgress,
        Self::AwaitingClarification,
        Self::DataExtracted,
        Self::UpdatePrepared,
        Self::IndexUpdated,
        Self::CompletedSuccess,
        Self::CompletedDontHelp,
        Self::Escalated,
    ];
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Help,
    DontHelp,
    Escalate,
}

impl Category {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "help" => Some(Self::Help),
            "dont_help" | "don't_help" | "do_not_help" => Some(Self::DontHelp),
            "escalate" => Some(Self::Escalate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::DontHelp => "dont_help",
            Self::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured data the extractor pulled out of the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    /// Name of the catalog record the sender wants changed.
    pub target_name: Option<String>,
    /// Requested field values, keyed by field name.
    #[serde(default)]
    pub change_fields: BTreeMap<String, serde_json::Value>,
    pub reason_for_change: Option<String>,
    /// 0-100.
    pub completeness_score: u8,
    /// Fields the extractor reported as missing.
    #[serde(default)]
    pub missing_fields: Vec<String>,
    /// Free-text note from the extractor (e.g. why parsing failed).
    #[serde(default)]
    pub description: Option<String>,
}

impl ExtractedData {
    /// Names of required fields that are absent.
    pub fn missing_required(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self
            .target_name
            .as_deref()
            .is_none_or(|name| name.trim().is_empty())
        {
            missing.push("target_name".to_string());
        }
        if self.change_fields.is_empty() {
            missing.push("change_fields".to_string());
        }
        missing
    }

    /// Complete enough to attempt matching.
    pub fn is_complete(&self, completeness_threshold: u8) -> bool {
        self.completeness_score >= completeness_threshold && self.missing_required().is_empty()
    }
}

/// One field-level change, with the value it replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Option<serde_json::Value>,
    pub after: serde_json::Value,
}

/// A change ready to be applied to one catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub target_id: String,
    pub target_name: String,
    pub changes: Vec<FieldChange>,
}

impl UpdatePayload {
    /// The `field -> after` map sent to the catalog.
    pub fn field_patch(&self) -> serde_json::Map<String, serde_json::Value> {
        self.changes
            .iter()
            .map(|c| (c.field.clone(), c.after.clone()))
            .collect()
    }
}

/// Outcome of applying an update to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub success: bool,
    /// Catalog-reported values before and after, per changed field.
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    pub applied_at: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One clarification round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationExchange {
    pub question: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

/// One inbound change request and its full processing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingItem {
    pub item_id: String,
    pub conversation_id: String,
    pub sender: String,
    pub subject: String,
    /// Request text; clarification transcripts are merged into it.
    pub body: String,
    pub original_body: String,
    pub received_at: DateTime<Utc>,

    pub category: Option<Category>,
    /// 0-100.
    pub confidence: Option<u8>,
    pub reason: Option<String>,

    pub extracted_data: Option<ExtractedData>,
    pub update_payload: Option<UpdatePayload>,
    pub update_result: Option<UpdateResult>,
    /// Closest catalog matches, kept for escalation context.
    #[serde(default)]
    pub match_summary: Option<String>,

    pub clarification_attempts: u32,
    #[serde(default)]
    pub clarification_history: Vec<ClarificationExchange>,
    pub last_clarification_question: Option<String>,
    pub clarification_sent_at: Option<DateTime<Utc>>,

    pub status: ItemStatus,
    pub timestamp: DateTime<Utc>,
    pub processing_attempts: u32,
    pub last_error: Option<String>,
    pub escalation_reason: Option<String>,
}

impl ProcessingItem {
    /// A freshly sighted item in `received` status.
    pub fn new(
        item_id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let body = body.into();
        Self {
            item_id: item_id.into(),
            conversation_id: conversation_id.into(),
            sender: sender.into(),
            subject: subject.into(),
            original_body: body.clone(),
            body,
            received_at,
            category: None,
            confidence: None,
            reason: None,
            extracted_data: None,
            update_payload: None,
            update_result: None,
            match_summary: None,
            clarification_attempts: 0,
            clarification_history: Vec::new(),
            last_clarification_question: None,
            clarification_sent_at: None,
            status: ItemStatus::Received,
            timestamp: Utc::now(),
            processing_attempts: 0,
            last_error: None,
            escalation_reason: None,
        }
    }

    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// A clarification reply has been merged but not yet judged.
    pub fn has_unjudged_reply(&self) -> bool {
        self.clarification_history.len() > self.clarification_attempts as usize
    }
}

/// Partial update to a processing item. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub status: Option<ItemStatus>,
    pub category: Option<Category>,
    pub confidence: Option<u8>,
    pub reason: Option<String>,
    pub body: Option<String>,
    pub extracted_data: Option<ExtractedData>,
    pub update_payload: Option<UpdatePayload>,
    pub update_result: Option<UpdateResult>,
    pub match_summary: Option<String>,
    pub clarification_attempts: Option<u32>,
    pub clarification_history: Option<Vec<ClarificationExchange>>,
    pub last_clarification_question: Option<String>,
    pub clarification_sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub escalation_reason: Option<String>,
}

impl ItemPatch {
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn with_escalation_reason(mut self, reason: impl Into<String>) -> Self {
        self.escalation_reason = Some(reason.into());
        self
    }

    /// Apply onto an item. Bookkeeping fields are left to the store.
    pub fn apply_to(self, item: &mut ProcessingItem) {
        if let Some(v) = self.status {
            item.status = v;
        }
        if let Some(v) = self.category {
            item.category = Some(v);
        }
        if let Some(v) = self.confidence {
            item.confidence = Some(v);
        }
        if let Some(v) = self.reason {
            item.reason = Some(v);
        }
        if let Some(v) = self.body {
            item.body = v;
        }
        if let Some(v) = self.extracted_data {
            item.extracted_data = Some(v);
        }
        if let Some(v) = self.update_payload {
            item.update_payload = Some(v);
        }
        if let Some(v) = self.update_result {
            item.update_result = Some(v);
        }
        if let Some(v) = self.match_summary {
            item.match_summary = Some(v);
        }
        if let Some(v) = self.clarification_attempts {
            item.clarification_attempts = v;
        }
        if let Some(v) = self.clarification_history {
            item.clarification_history = v;
        }
        if let Some(v) = self.last_clarification_question {
            item.last_clarification_question = Some(v);
        }
        if let Some(v) = self.clarification_sent_at {
            item.clarification_sent_at = Some(v);
        }
        if let Some(v) = self.last_error {
            item.last_error = Some(v);
        }
        if let Some(v) = self.escalation_reason {
            item.escalation_reason = Some(v);
        }
    }
}
