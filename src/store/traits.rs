//! `RecordStore` trait: single async interface for item persistence.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::record::{ItemPatch, ProcessingItem};

/// Durable, queryable store of per-item processing records.
///
/// Every mutation is flushed to durable storage before the call returns.
/// Records are never deleted; terminal items stay for audit.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new item. Fails with `DuplicateId` if `item_id` exists.
    async fn append(&self, item: ProcessingItem) -> Result<(), StoreError>;

    /// Apply a partial update and return the updated item.
    ///
    /// Always advances `timestamp` and increments `processing_attempts`.
    /// A status change must satisfy `ItemStatus::can_transition_to`.
    async fn update(&self, item_id: &str, patch: ItemPatch)
    -> Result<ProcessingItem, StoreError>;

    /// Look up an item by ID.
    async fn find(&self, item_id: &str) -> Result<Option<ProcessingItem>, StoreError>;

    /// Whether any item in this conversation has been recorded.
    async fn find_by_conversation(&self, conversation_id: &str) -> Result<bool, StoreError>;

    /// All non-terminal items, oldest first.
    async fn find_in_progress(&self) -> Result<Vec<ProcessingItem>, StoreError>;

    /// Non-terminal items whose `timestamp` is older than `age_threshold`.
    async fn find_stale(
        &self,
        age_threshold: chrono::Duration,
    ) -> Result<Vec<ProcessingItem>, StoreError>;

    /// IDs of every recorded item (used to exclude already-seen messages).
    async fn known_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Every recorded item, in first-seen order.
    async fn all(&self) -> Result<Vec<ProcessingItem>, StoreError>;
}
