//! LLM-backed classifier and extractor.
//!
//! Both adapters sit on a single `LlmClient::call(prompt) -> text` contract;
//! the HTTP client behind it (and any streaming) is the caller's concern.

mod parse;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::pipeline::types::{Classification, Classifier, Extractor};
use crate::store::record::ExtractedData;

/// Characters of message body sent to the model.
const MAX_BODY_CHARS: usize = 4000;

/// A text-in, text-out model endpoint.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, prompt: &str) -> Result<String, LlmError>;
}

// ── Prompt construction ─────────────────────────────────────────────

fn message_block(subject: &str, sender: &str, body: &str) -> String {
    let body_preview: String = body.chars().take(MAX_BODY_CHARS).collect();
    format!("From: {sender}\nSubject: {subject}\n\nMessage:\n{body_preview}")
}

fn build_classify_prompt(subject: &str, sender: &str, body: &str) -> String {
    format!(
        "You sort messages sent to a catalog change-request mailbox.\n\n\
         Categories:\n\
         - \"help\": a request to change fields of an existing catalog record.\n\
         - \"dont_help\": anything this mailbox does not handle (questions, spam, new-record requests).\n\
         - \"escalate\": sensitive, urgent, angry, or otherwise needs a person.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"category\": \"...\", \"confidence\": 0-100, \"reason\": \"...\"}}\n\n\
         {}",
        message_block(subject, sender, body)
    )
}

fn build_extract_prompt(subject: &str, sender: &str, body: &str) -> String {
    format!(
        "Extract the catalog change requested in this message.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"target_name\": \"name of the record to change\", \
         \"change_fields\": {{\"field\": \"new value\"}}, \
         \"reason_for_change\": \"...\", \
         \"completeness_score\": 0-100, \
         \"missing_fields\": [\"...\"]}}\n\n\
         Rules:\n\
         - Use null for anything the message does not state\n\
         - completeness_score reflects how safely the change could be applied as written\n\
         - If there is a clarification transcript, the latest answers take precedence\n\n\
         {}",
        message_block(subject, sender, body)
    )
}

// ── Adapters ────────────────────────────────────────────────────────

/// `Classifier` over an `LlmClient`.
pub struct LlmClassifier {
    client: Arc<dyn LlmClient>,
}

impl LlmClassifier {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        subject: &str,
        sender: &str,
        body: &str,
    ) -> Result<Classification, LlmError> {
        let raw = self
            .client
            .call(&build_classify_prompt(subject, sender, body))
            .await?;
        let classification = parse::parse_classification(&raw).map_err(|reason| {
            warn!(reason = %reason, "Unparseable classification");
            LlmError::Parse {
                stage: "classify".into(),
                reason,
            }
        })?;
        debug!(category = ?classification.category, confidence = classification.confidence, "Classification parsed");
        Ok(classification)
    }
}

/// `Extractor` over an `LlmClient`; unparseable output yields zero completeness.
pub struct LlmExtractor {
    client: Arc<dyn LlmClient>,
}

impl LlmExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(
        &self,
        subject: &str,
        sender: &str,
        body: &str,
    ) -> Result<ExtractedData, LlmError> {
        let raw = self
            .client
            .call(&build_extract_prompt(subject, sender, body))
            .await?;
        let data = parse::parse_extraction(&raw);
        if let Some(note) = &data.description {
            warn!(note = %note, "Extraction fell back to zero completeness");
        }
        Ok(data)
    }
}
