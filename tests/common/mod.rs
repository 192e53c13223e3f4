//! Mock collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use change_intake::config::{EngineConfig, RetryPolicy};
use change_intake::error::{LlmError, SearchError, TransportError};
use change_intake::pipeline::types::{
    Candidate, CatalogChange, CatalogSearch, Classification, Classifier, Extractor,
    MessageTransport, RawMessage,
};
use change_intake::pipeline::{Collaborators, Orchestrator};
use change_intake::store::record::{Category, ExtractedData, FieldChange};
use change_intake::store::{JsonlRecordStore, RecordStore};

// ── Classifier ──────────────────────────────────────────────────────

pub struct MockClassifier {
    pub verdict: Classification,
    pub calls: AtomicU32,
    /// Raised on every call once set, to request shutdown mid-batch.
    pub trip: OnceLock<Arc<AtomicBool>>,
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, _: &str, _: &str, _: &str) -> Result<Classification, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(flag) = self.trip.get() {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(self.verdict.clone())
    }
}

// ── Extractor ───────────────────────────────────────────────────────

/// Plays back scripted extractions; the last one repeats.
pub struct MockExtractor {
    script: Mutex<VecDeque<ExtractedData>>,
    pub calls: AtomicU32,
    /// Bodies seen, in call order.
    pub bodies: Mutex<Vec<String>>,
}

impl MockExtractor {
    pub fn new(script: Vec<ExtractedData>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            bodies: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(&self, _: &str, _: &str, body: &str) -> Result<ExtractedData, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body.to_string());
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        Ok(next.unwrap_or_default())
    }
}

// ── Catalog ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockCatalog {
    pub records: Mutex<Vec<Candidate>>,
    pub updates: Mutex<Vec<(String, Map<String, Value>)>>,
    pub reject_updates: bool,
}

impl MockCatalog {
    pub fn with_records(records: Vec<Candidate>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }
}

#[async_trait]
impl CatalogSearch for MockCatalog {
    async fn search(&self, _: &str, top_k: usize) -> Result<Vec<Candidate>, SearchError> {
        Ok(self.records.lock().unwrap().iter().take(top_k).cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Candidate>, SearchError> {
        Ok(self.records.lock().unwrap().iter().find(|c| c.id == id).cloned())
    }

    async fn update(
        &self,
        id: &str,
        field_patch: &Map<String, Value>,
    ) -> Result<CatalogChange, SearchError> {
        self.updates
            .lock()
            .unwrap()
            .push((id.to_string(), field_patch.clone()));
        if self.reject_updates {
            return Ok(CatalogChange {
                success: false,
                changes: vec![],
                message: Some("record is locked".into()),
            });
        }

        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SearchError::Operation {
                operation: "update".into(),
                reason: format!("no record {id}"),
            })?;
        let changes = field_patch
            .iter()
            .map(|(field, after)| FieldChange {
                field: field.clone(),
                before: record.fields.insert(field.clone(), after.clone()),
                after: after.clone(),
            })
            .collect();
        Ok(CatalogChange {
            success: true,
            changes,
            message: None,
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockTransport {
    pub inbox: Mutex<Vec<RawMessage>>,
    pub replies: Mutex<Vec<(String, String)>>,
    pub forwards: Mutex<Vec<(String, Vec<String>, String)>>,
    pub sent: Mutex<Vec<(String, String, String)>>,
    /// Fail this many `fetch_new` calls before succeeding.
    pub fetch_failures: AtomicU32,
    /// Ignore `exclude_ids`, like a transport that re-delivers everything.
    pub redeliver: bool,
}

impl MockTransport {
    pub fn deliver(&self, message: RawMessage) {
        self.inbox.lock().unwrap().push(message);
    }

    pub fn replies_to(&self, item_id: &str) -> Vec<String> {
        self.replies
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == item_id)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn fetch_new(
        &self,
        _since_days: u32,
        exclude_ids: &[String],
    ) -> Result<Vec<RawMessage>, TransportError> {
        if self.fetch_failures.load(Ordering::SeqCst) > 0 {
            self.fetch_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Call {
                operation: "fetch_new".into(),
                reason: "mailbox timeout".into(),
            });
        }
        Ok(self
            .inbox
            .lock()
            .unwrap()
            .iter()
            .filter(|m| self.redeliver || !exclude_ids.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn reply(&self, item_id: &str, body: &str) -> Result<(), TransportError> {
        self.replies
            .lock()
            .unwrap()
            .push((item_id.to_string(), body.to_string()));
        Ok(())
    }

    async fn forward(
        &self,
        item_id: &str,
        recipients: &[String],
        comment: &str,
    ) -> Result<(), TransportError> {
        self.forwards.lock().unwrap().push((
            item_id.to_string(),
            recipients.to_vec(),
            comment.to_string(),
        ));
        Ok(())
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

pub fn message(id: &str, conversation: &str, subject: &str) -> RawMessage {
    message_at(id, conversation, subject, "Please update the record.", Utc::now())
}

pub fn message_at(
    id: &str,
    conversation: &str,
    subject: &str,
    body: &str,
    received_at: DateTime<Utc>,
) -> RawMessage {
    RawMessage {
        id: id.into(),
        conversation_id: conversation.into(),
        sender: "alice@example.com".into(),
        subject: subject.into(),
        body: body.into(),
        received_at,
    }
}

pub fn complete_extraction(target: &str) -> ExtractedData {
    let mut data = ExtractedData {
        target_name: Some(target.into()),
        reason_for_change: Some("team reorganisation".into()),
        completeness_score: 80,
        ..Default::default()
    };
    data.change_fields.insert("owner".into(), json!("dana@example.com"));
    data
}

pub fn incomplete_extraction() -> ExtractedData {
    ExtractedData {
        completeness_score: 30,
        missing_fields: vec!["target_name".into()],
        ..Default::default()
    }
}

pub fn catalog_record(id: &str, name: &str) -> Candidate {
    Candidate::new(id, name).with_field("owner", json!("carol@example.com"))
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        escalation_recipients: vec!["ops@example.com".into()],
        alert_recipient: Some("oncall@example.com".into()),
        retry: RetryPolicy::immediate(3),
        ..Default::default()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn RecordStore>,
    pub classifier: Arc<MockClassifier>,
    pub extractor: Arc<MockExtractor>,
    pub catalog: Arc<MockCatalog>,
    pub transport: Arc<MockTransport>,
}

pub struct HarnessBuilder {
    pub config: EngineConfig,
    pub store: Option<Arc<dyn RecordStore>>,
    pub verdict: Classification,
    pub extractions: Vec<ExtractedData>,
    pub catalog: MockCatalog,
    pub transport: MockTransport,
}

impl HarnessBuilder {
    pub fn new(category: Category, confidence: u8) -> Self {
        Self {
            config: test_config(),
            store: None,
            verdict: Classification {
                category,
                confidence,
                reason: "test verdict".into(),
            },
            extractions: vec![complete_extraction("Storage Expansion Request")],
            catalog: MockCatalog::with_records(vec![catalog_record(
                "rec-42",
                "Storage Expansion Request",
            )]),
            transport: MockTransport::default(),
        }
    }

    pub fn extractions(mut self, extractions: Vec<ExtractedData>) -> Self {
        self.extractions = extractions;
        self
    }

    pub fn catalog(mut self, catalog: MockCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn transport(mut self, transport: MockTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Harness {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(JsonlRecordStore::in_memory()) as Arc<dyn RecordStore>);
        let classifier = Arc::new(MockClassifier {
            verdict: self.verdict,
            calls: AtomicU32::new(0),
            trip: OnceLock::new(),
        });
        let extractor = Arc::new(MockExtractor::new(self.extractions));
        let catalog = Arc::new(self.catalog);
        let transport = Arc::new(self.transport);

        let orchestrator = Orchestrator::new(
            self.config,
            Arc::clone(&store),
            Collaborators {
                classifier: classifier.clone(),
                extractor: extractor.clone(),
                catalog: catalog.clone(),
                transport: transport.clone(),
            },
        );

        Harness {
            orchestrator,
            store,
            classifier,
            extractor,
            catalog,
            transport,
        }
    }
}
