//! Outgoing message text.

use crate::store::record::{ExtractedData, ProcessingItem, UpdateResult};

/// Subject and body of a standalone message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    pub subject: String,
    pub body: String,
}

/// Renders every message the engine sends.
pub trait ResponseComposer: Send + Sync {
    /// Polite refusal for out-of-scope requests.
    fn rejection(&self, item: &ProcessingItem) -> String;

    /// Question asking for whatever the extraction is missing.
    fn clarification_question(&self, item: &ProcessingItem, data: &ExtractedData) -> String;

    /// Confirmation listing each changed field.
    fn success(&self, item: &ProcessingItem, result: &UpdateResult) -> String;

    /// Comment attached when forwarding to a human.
    fn escalation_comment(&self, item: &ProcessingItem, reason: &str) -> String;

    /// Alert sent when the guardrail halts a cycle.
    fn guardrail_alert(&self, count: usize, threshold: usize, samples: &[String]) -> ComposedMessage;
}

/// Plain-text templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateComposer;

fn describe_field(field: &str) -> &str {
    match field {
        "target_name" => "the name of the record you want changed",
        "change_fields" => "which fields should change and their new values",
        "reason_for_change" => "the reason for the change",
        other => other,
    }
}

fn render_value(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "(empty)".to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

impl ResponseComposer for TemplateComposer {
    fn rejection(&self, item: &ProcessingItem) -> String {
        format!(
            "Hello,\n\nThanks for your message \"{}\". This mailbox only handles changes to \
             catalog records, so we are not able to help with this request here.\n\n\
             If you believe this is a mistake, reply and ask for a person to review it.",
            item.subject
        )
    }

    fn clarification_question(&self, item: &ProcessingItem, data: &ExtractedData) -> String {
        let mut missing: Vec<String> = data.missing_required();
        for field in &data.missing_fields {
            if !missing.contains(field) {
                missing.push(field.clone());
            }
        }

        let mut body = format!(
            "Hello,\n\nWe are working on your request \"{}\" but need a bit more detail.\n",
            item.subject
        );
        if missing.is_empty() {
            body.push_str("\nCould you describe the change more precisely?\n");
        } else {
            body.push_str("\nPlease reply with:\n");
            for field in &missing {
                body.push_str(&format!("- {}\n", describe_field(field)));
            }
        }
        if let Some(name) = data.target_name.as_deref().filter(|n| !n.trim().is_empty()) {
            body.push_str(&format!("\nSo far we understood the record to be \"{name}\".\n"));
        }
        body
    }

    fn success(&self, item: &ProcessingItem, result: &UpdateResult) -> String {
        let target = item
            .update_payload
            .as_ref()
            .map(|p| p.target_name.as_str())
            .unwrap_or("the requested record");

        let mut body = format!("Hello,\n\nYour change to \"{target}\" has been applied.\n\n");
        for change in &result.changes {
            body.push_str(&format!(
                "- {}: {} -> {}\n",
                change.field,
                render_value(change.before.as_ref()),
                render_value(Some(&change.after))
            ));
        }
        body.push_str(&format!(
            "\nApplied at {}.",
            result.applied_at.format("%Y-%m-%d %H:%M UTC")
        ));
        body
    }

    fn escalation_comment(&self, item: &ProcessingItem, reason: &str) -> String {
        let mut comment = format!("Needs human review: {reason}\n");
        if let (Some(category), Some(confidence)) = (item.category, item.confidence) {
            comment.push_str(&format!("Classification: {category} ({confidence}%)\n"));
        }
        if let Some(summary) = &item.match_summary {
            comment.push_str(&format!("Catalog matches: {summary}\n"));
        }
        if item.clarification_attempts > 0 || !item.clarification_history.is_empty() {
            comment.push_str(&format!(
                "Clarification rounds: {} ({} unsatisfactory)\n",
                item.clarification_history.len(),
                item.clarification_attempts
            ));
        }
        if let Some(error) = &item.last_error {
            comment.push_str(&format!("Last error: {error}\n"));
        }
        comment
    }

    fn guardrail_alert(&self, count: usize, threshold: usize, samples: &[String]) -> ComposedMessage {
        let mut body = format!(
            "Automatic processing was halted: {count} new messages arrived in one cycle, \
             above the limit of {threshold}.\n\nNothing was processed. Sample subjects:\n"
        );
        for subject in samples {
            body.push_str(&format!("- {subject}\n"));
        }
        ComposedMessage {
            subject: format!("[change-intake] Guardrail halted processing ({count} items)"),
            body,
        }
    }
}
