//! `JsonlRecordStore`: record log with one JSON snapshot per line.
//!
//! Appends and updates both write the item's full snapshot as a new line and
//! fsync before returning; the latest line for an `item_id` wins on load.
//! Once superseded lines outnumber live records (and a floor of
//! [`COMPACT_MIN_DEAD_LINES`]), the log is compacted through a temp file and
//! an atomic rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CLARIFICATION_MAX_ATTEMPTS;
use crate::error::StoreError;
use crate::store::record::{ItemPatch, ProcessingItem};
use crate::store::recovery::{self, LoadReport};
use crate::store::traits::RecordStore;

/// Superseded lines tolerated before compaction is considered.
pub const COMPACT_MIN_DEAD_LINES: usize = 64;

#[derive(Default)]
struct StoreState {
    items: HashMap<String, ProcessingItem>,
    /// First-seen order of item IDs.
    order: Vec<String>,
    /// Lines currently in the log file.
    log_lines: usize,
}

impl StoreState {
    fn from_snapshots(snapshots: Vec<ProcessingItem>) -> Self {
        let mut state = Self {
            log_lines: snapshots.len(),
            ..Default::default()
        };
        for item in snapshots {
            if !state.items.contains_key(&item.item_id) {
                state.order.push(item.item_id.clone());
            }
            state.items.insert(item.item_id.clone(), item);
        }
        state
    }

    fn ordered(&self) -> impl Iterator<Item = &ProcessingItem> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }
}

/// Durable record store backed by an append-oriented JSON-lines file.
pub struct JsonlRecordStore {
    /// `None` keeps everything in memory.
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl JsonlRecordStore {
    /// Open (or create) a store at the given path, repairing a damaged log.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, LoadReport), StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let load_path = path.clone();
        let (snapshots, report) =
            tokio::task::spawn_blocking(move || recovery::load_log(&load_path))
                .await
                .map_err(|e| StoreError::Corrupted {
                    path: path.clone(),
                    reason: format!("load task failed: {e}"),
                })??;

        let state = StoreState::from_snapshots(snapshots);
        info!(
            path = %path.display(),
            items = state.items.len(),
            lines = state.log_lines,
            quarantined = report.lines_quarantined,
            "Record store opened"
        );

        Ok((
            Self {
                path: Some(path),
                state: Mutex::new(state),
            },
            report,
        ))
    }

    /// A store that never touches disk (for tests).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Number of lines in the backing log.
    pub async fn log_lines(&self) -> usize {
        self.state.lock().await.log_lines
    }

    async fn write_snapshot(
        &self,
        state: &mut StoreState,
        item: &ProcessingItem,
    ) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            state.log_lines += 1;
            return Ok(());
        };

        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        state.log_lines += 1;
        Ok(())
    }

    /// Rewrite the log with one line per live item when enough lines are dead.
    async fn maybe_compact(&self, state: &mut StoreState) -> Result<(), StoreError> {
        let live = state.items.len();
        let dead = state.log_lines.saturating_sub(live);
        if dead <= live.max(COMPACT_MIN_DEAD_LINES) {
            return Ok(());
        }
        let Some(path) = &self.path else {
            state.log_lines = live;
            return Ok(());
        };

        let mut buf = Vec::new();
        for item in state.ordered() {
            serde_json::to_writer(&mut buf, item)?;
            buf.push(b'\n');
        }

        let tmp = recovery::temp_path(path);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;

        info!(path = %path.display(), live, dropped = dead, "Record log compacted");
        state.log_lines = live;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn append(&self, item: ProcessingItem) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.items.contains_key(&item.item_id) {
            return Err(StoreError::DuplicateId { id: item.item_id });
        }

        self.write_snapshot(&mut state, &item).await?;
        debug!(item_id = %item.item_id, status = %item.status, "Item appended");
        state.order.push(item.item_id.clone());
        state.items.insert(item.item_id.clone(), item);
        Ok(())
    }

    async fn update(
        &self,
        item_id: &str,
        patch: ItemPatch,
    ) -> Result<ProcessingItem, StoreError> {
        let mut state = self.state.lock().await;
        let current = state
            .items
            .get(item_id)
            .ok_or_else(|| StoreError::NotFound {
                id: item_id.to_string(),
            })?;

        if let Some(target) = patch.status
            && target != current.status
            && !current.status.can_transition_to(target)
        {
            return Err(StoreError::InvalidTransition {
                id: item_id.to_string(),
                from: current.status,
                to: target,
            });
        }
        if let Some(attempts) = patch.clarification_attempts {
            if attempts > CLARIFICATION_MAX_ATTEMPTS {
                return Err(StoreError::InvalidPatch {
                    id: item_id.to_string(),
                    reason: format!(
                        "clarification_attempts {attempts} exceeds {CLARIFICATION_MAX_ATTEMPTS}"
                    ),
                });
            }
            if attempts < current.clarification_attempts {
                return Err(StoreError::InvalidPatch {
                    id: item_id.to_string(),
                    reason: "clarification_attempts cannot decrease".into(),
                });
            }
        }

        let mut updated = current.clone();
        let previous_status = updated.status;
        patch.apply_to(&mut updated);

        let now = Utc::now();
        updated.timestamp = if now > updated.timestamp {
            now
        } else {
            updated.timestamp + chrono::Duration::microseconds(1)
        };
        updated.processing_attempts += 1;

        self.write_snapshot(&mut state, &updated).await?;
        if previous_status != updated.status {
            debug!(
                item_id = %item_id,
                from = %previous_status,
                to = %updated.status,
                "Item status persisted"
            );
        }
        state.items.insert(item_id.to_string(), updated.clone());
        // The snapshot is already durable; a failed compaction is retried on
        // the next write.
        if let Err(e) = self.maybe_compact(&mut state).await {
            warn!(error = %e, "Record log compaction failed");
        }
        Ok(updated)
    }

    async fn find(&self, item_id: &str) -> Result<Option<ProcessingItem>, StoreError> {
        Ok(self.state.lock().await.items.get(item_id).cloned())
    }

    async fn find_by_conversation(&self, conversation_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .items
            .values()
            .any(|item| item.conversation_id == conversation_id))
    }

    async fn find_in_progress(&self) -> Result<Vec<ProcessingItem>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .ordered()
            .filter(|item| !item.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn find_stale(
        &self,
        age_threshold: chrono::Duration,
    ) -> Result<Vec<ProcessingItem>, StoreError> {
        let cutoff = Utc::now() - age_threshold;
        Ok(self
            .state
            .lock()
            .await
            .ordered()
            .filter(|item| !item.status.is_terminal() && item.timestamp < cutoff)
            .cloned()
            .collect())
    }

    async fn known_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.lock().await.order.clone())
    }

    async fn all(&self) -> Result<Vec<ProcessingItem>, StoreError> {
        Ok(self.state.lock().await.ordered().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record::ItemStatus;

    fn item(id: &str, conversation: &str) -> ProcessingItem {
        ProcessingItem::new(
            id,
            conversation,
            "alice@example.com",
            "Update owner",
            "Please change the owner of Billing Portal to Dana",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn append_rejects_duplicate_id() {
        let store = JsonlRecordStore::in_memory();
        store.append(item("m-1", "c-1")).await.unwrap();
        let err = store.append(item("m-1", "c-2")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId { ref id } if id == "m-1"));
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_missing_item_is_not_found() {
        let store = JsonlRecordStore::in_memory();
        let err = store
            .update("ghost", ItemPatch::status(ItemStatus::Classified))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn update_bumps_attempts_and_timestamp() {
        let store = JsonlRecordStore::in_memory();
        let original = item("m-1", "c-1");
        let before = original.timestamp;
        store.append(original).await.unwrap();

        let first = store
            .update("m-1", ItemPatch::status(ItemStatus::Classified))
            .await
            .unwrap();
        let second = store
            .update("m-1", ItemPatch::default().with_error("transient"))
            .await
            .unwrap();

        assert_eq!(first.processing_attempts, 1);
        assert_eq!(second.processing_attempts, 2);
        assert!(first.timestamp > before);
        assert!(second.timestamp > first.timestamp);
        assert_eq!(second.status, ItemStatus::Classified);
    }

    #[tokio::test]
    async fn update_enforces_transitions() {
        let store = JsonlRecordStore::in_memory();
        store.append(item("m-1", "c-1")).await.unwrap();
        let err = store
            .update("m-1", ItemPatch::status(ItemStatus::CompletedSuccess))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // Escalation is allowed from any non-terminal status...
        store
            .update("m-1", ItemPatch::status(ItemStatus::Escalated))
            .await
            .unwrap();
        // ...and nothing leaves a terminal one.
        let repeat = store
            .update("m-1", ItemPatch::status(ItemStatus::Escalated))
            .await;
        assert!(repeat.is_ok(), "same-status patch is a no-op transition");
        let err = store
            .update("m-1", ItemPatch::status(ItemStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn clarification_attempts_are_bounded() {
        let store = JsonlRecordStore::in_memory();
        store.append(item("m-1", "c-1")).await.unwrap();
        let patch = ItemPatch {
            clarification_attempts: Some(3),
            ..Default::default()
        };
        let err = store.update("m-1", patch).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPatch { .. }));
    }

    #[tokio::test]
    async fn conversation_lookup() {
        let store = JsonlRecordStore::in_memory();
        store.append(item("m-1", "thread-a")).await.unwrap();
        assert!(store.find_by_conversation("thread-a").await.unwrap());
        assert!(!store.find_by_conversation("thread-b").await.unwrap());
    }

    #[tokio::test]
    async fn in_progress_and_stale_exclude_terminal() {
        let store = JsonlRecordStore::in_memory();
        let old = Utc::now() - chrono::Duration::hours(30);
        store
            .append(item("old-active", "c-1").with_status(ItemStatus::InProgress).with_timestamp(old))
            .await
            .unwrap();
        store
            .append(item("old-done", "c-2").with_status(ItemStatus::Escalated).with_timestamp(old))
            .await
            .unwrap();
        store
            .append(item("fresh", "c-3").with_status(ItemStatus::AwaitingClarification))
            .await
            .unwrap();

        let active: Vec<_> = store
            .find_in_progress()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.item_id)
            .collect();
        assert_eq!(active, vec!["old-active", "fresh"]);

        let stale = store.find_stale(chrono::Duration::hours(24)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].item_id, "old-active");
    }

    #[tokio::test]
    async fn reopen_restores_latest_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("items.jsonl");
        {
            let (store, _) = JsonlRecordStore::open(&path).await.unwrap();
            store.append(item("m-1", "c-1")).await.unwrap();
            store
                .update("m-1", ItemPatch::status(ItemStatus::Classified))
                .await
                .unwrap();
            assert_eq!(store.log_lines().await, 2);
        }

        let (store, report) = JsonlRecordStore::open(&path).await.unwrap();
        assert_eq!(report.lines_quarantined, 0);
        let restored = store.find("m-1").await.unwrap().unwrap();
        assert_eq!(restored.status, ItemStatus::Classified);
        assert_eq!(restored.processing_attempts, 1);
    }

    #[tokio::test]
    async fn reopen_survives_torn_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("items.jsonl");
        {
            let (store, _) = JsonlRecordStore::open(&path).await.unwrap();
            store.append(item("m-1", "c-1")).await.unwrap();
            store.append(item("m-2", "c-2")).await.unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 20);
        std::fs::write(&path, bytes).unwrap();

        let (store, report) = JsonlRecordStore::open(&path).await.unwrap();
        assert_eq!(report.lines_quarantined, 1);
        assert!(store.find("m-1").await.unwrap().is_some());
        assert!(store.find("m-2").await.unwrap().is_none());
        assert!(recovery::quarantine_path(&path).exists());
    }

    #[tokio::test]
    async fn compaction_keeps_latest_state() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("items.jsonl");
        let (store, _) = JsonlRecordStore::open(&path).await.unwrap();
        store.append(item("m-1", "c-1")).await.unwrap();
        for i in 0..(COMPACT_MIN_DEAD_LINES + 5) {
            store
                .update("m-1", ItemPatch::default().with_error(format!("attempt {i}")))
                .await
                .unwrap();
        }
        assert!(store.log_lines().await < COMPACT_MIN_DEAD_LINES);
        drop(store);

        let (store, _) = JsonlRecordStore::open(&path).await.unwrap();
        let restored = store.find("m-1").await.unwrap().unwrap();
        assert_eq!(
            restored.last_error.as_deref(),
            Some(format!("attempt {}", COMPACT_MIN_DEAD_LINES + 4).as_str())
        );
        assert_eq!(restored.processing_attempts as usize, COMPACT_MIN_DEAD_LINES + 5);
    }

    #[tokio::test]
    async fn failed_compaction_does_not_fail_the_update() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("items.jsonl");
        // A directory at the scratch path makes the rewrite fail
        std::fs::create_dir(recovery::temp_path(&path)).unwrap();
        let (store, _) = JsonlRecordStore::open(&path).await.unwrap();
        store.append(item("m-1", "c-1")).await.unwrap();
        for i in 0..(COMPACT_MIN_DEAD_LINES + 5) {
            store
                .update("m-1", ItemPatch::default().with_error(format!("attempt {i}")))
                .await
                .unwrap();
        }
        assert!(store.log_lines().await > COMPACT_MIN_DEAD_LINES);
        drop(store);

        let (store, _) = JsonlRecordStore::open(&path).await.unwrap();
        let restored = store.find("m-1").await.unwrap().unwrap();
        assert_eq!(restored.processing_attempts as usize, COMPACT_MIN_DEAD_LINES + 5);
    }
}
