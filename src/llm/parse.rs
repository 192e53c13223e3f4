//! Parsing of classifier and extractor model output.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::pipeline::types::Classification;
use crate::store::record::{Category, ExtractedData};

/// Classifier response structure.
#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    category: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

/// Extractor response structure.
#[derive(Debug, Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    target_name: Option<String>,
    #[serde(default)]
    change_fields: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    reason_for_change: Option<String>,
    #[serde(default)]
    completeness_score: f64,
    #[serde(default)]
    missing_fields: Vec<String>,
}

/// Map a model score onto 0-100. Fractions in (0, 1) are read as probabilities.
pub(crate) fn clamp_score(raw: f64) -> u8 {
    if !raw.is_finite() {
        return 0;
    }
    let scaled = if raw > 0.0 && raw < 1.0 { raw * 100.0 } else { raw };
    scaled.round().clamp(0.0, 100.0) as u8
}

/// Parse the classifier response into a `Classification`.
pub(crate) fn parse_classification(raw: &str) -> Result<Classification, String> {
    let json_str = extract_json_object(raw);
    let response: ClassifyResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let category = Category::parse(&response.category)
        .ok_or_else(|| format!("unknown category: '{}'", response.category))?;

    Ok(Classification {
        category,
        confidence: clamp_score(response.confidence),
        reason: if response.reason.trim().is_empty() {
            "No reason given".into()
        } else {
            response.reason.trim().to_string()
        },
    })
}

/// Parse the extractor response, failing soft to a zero-completeness result.
pub(crate) fn parse_extraction(raw: &str) -> ExtractedData {
    let json_str = extract_json_object(raw);
    let response: ExtractResponse = match serde_json::from_str(&json_str) {
        Ok(r) => r,
        Err(e) => {
            return ExtractedData {
                completeness_score: 0,
                description: Some(format!("Could not parse extraction response: {e}")),
                ..Default::default()
            };
        }
    };

    ExtractedData {
        target_name: response
            .target_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        change_fields: response.change_fields.unwrap_or_default(),
        reason_for_change: response
            .reason_for_change
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        completeness_score: clamp_score(response.completeness_score),
        missing_fields: response.missing_fields,
        description: None,
    }
}

/// Extract a JSON object from model output (handles markdown wrapping).
pub(crate) fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Fenced code block, with or without a language tag
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
