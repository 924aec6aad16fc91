//! Storage layer for the Hypnos lifecycle engine
//!
//! Provides the persistence contract for memories, the relationship graph,
//! the think queue and the review log. Every state change that can race with
//! another writer is expressed as a compare-and-set on the status the caller
//! observed; a lost race surfaces as [`HypnosError::ConcurrencyConflict`].
//!
//! [`HypnosError::ConcurrencyConflict`]: crate::error::HypnosError::ConcurrencyConflict

pub mod libsql;
mod rows;
pub mod schema;

use crate::error::Result;
use crate::types::{
    Direction, Memory, MemoryId, MemoryStatus, Relationship, RelationshipType, ReviewLogEntry,
    TaskId, TaskStatus, TemporalLayer, ThinkTask, Transition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Storage backend trait defining all required operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // === Memories ===

    /// Store a new memory
    async fn store_memory(&self, memory: &Memory) -> Result<()>;

    /// Retrieve a memory by ID
    async fn get_memory(&self, id: MemoryId) -> Result<Memory>;

    /// Memories carrying `tag`, most recent first
    async fn find_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<Memory>>;

    /// Flip every active record whose ttl has elapsed to `expired`
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Count memories, optionally filtered by temporal layer and status
    async fn count_memories(
        &self,
        layer: Option<TemporalLayer>,
        status: Option<MemoryStatus>,
    ) -> Result<usize>;

    /// Expired or pending-review records no live pass holds, oldest expiry
    /// first
    ///
    /// A claim taken before `stale_before` counts as abandoned. Records past
    /// the retry bound are included so the caller can archive them.
    async fn find_review_candidates(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>>;

    /// Identifiers of records awaiting review, in review order
    async fn list_pending_review(&self) -> Result<Vec<MemoryId>>;

    /// Claim `memory` for one review pass
    ///
    /// Moves the record to `pending_review` and stamps the claim, provided its
    /// status and retry count still match `memory` and no claim newer than
    /// `stale_before` is held.
    async fn claim_for_review(&self, memory: &Memory, stale_before: DateTime<Utc>) -> Result<bool>;

    /// Drop the claim on a record a pass could not review
    async fn release_review_claim(&self, id: MemoryId) -> Result<()>;

    /// Apply a transition and append its review log entry atomically
    ///
    /// Fails with a concurrency conflict (and writes nothing) when the record
    /// is no longer in `expected`.
    async fn apply_transition(
        &self,
        transition: &Transition,
        expected: MemoryStatus,
        entry: &ReviewLogEntry,
    ) -> Result<()>;

    /// Count a review pass that produced no valid decision
    ///
    /// Returns the new retry count, or `None` when the record left
    /// `pending_review` in the meantime.
    async fn record_failed_review(&self, id: MemoryId) -> Result<Option<u32>>;

    /// Persist `revised` as the successor of `old_id`
    ///
    /// Inserts the new version, marks the old one superseded and records the
    /// `superseded_by` edge in one transaction.
    async fn store_revision(&self, old_id: MemoryId, revised: &Memory, reason: &str) -> Result<()>;

    // === Relationships ===

    /// Insert an edge; returns false when the same typed edge already exists
    async fn add_relationship(&self, relationship: &Relationship) -> Result<bool>;

    /// Edges incident to `id` in `direction`, restricted to `types` when
    /// non-empty, in creation order
    async fn relationships_of(
        &self,
        id: MemoryId,
        types: &[RelationshipType],
        direction: Direction,
    ) -> Result<Vec<Relationship>>;

    // === Think queue ===

    /// Insert a new think task
    async fn enqueue_task(&self, task: &ThinkTask) -> Result<()>;

    /// Retrieve a think task by ID
    async fn get_task(&self, id: TaskId) -> Result<ThinkTask>;

    /// Pending tasks by priority rank, then creation time
    async fn next_pending_tasks(&self, limit: usize) -> Result<Vec<ThinkTask>>;

    /// Tasks in queue order, optionally filtered by status
    async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<ThinkTask>>;

    /// Move a task from `expected` to `new` if nobody got there first
    async fn transition_task(&self, id: TaskId, expected: TaskStatus, new: TaskStatus)
        -> Result<bool>;

    /// Insert the insight memory and complete the task atomically
    ///
    /// When `inspired_by` is set, an `inspired_by` edge from the insight to
    /// that memory is written in the same transaction.
    async fn complete_task(
        &self,
        id: TaskId,
        insight: &Memory,
        inspired_by: Option<MemoryId>,
    ) -> Result<()>;

    /// Release in-progress tasks claimed before `started_before`
    async fn recover_stalled_tasks(&self, started_before: DateTime<Utc>) -> Result<u64>;

    // === Review log ===

    /// Review log entries for a memory, oldest first
    async fn review_history(&self, id: MemoryId) -> Result<Vec<ReviewLogEntry>>;

    /// Aggregate counts for operators
    async fn stats(&self) -> Result<StoreStats>;
}

/// Aggregate counts across the lifecycle tables
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub memories_by_layer: BTreeMap<String, usize>,
    pub memories_by_status: BTreeMap<String, usize>,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub relationships: usize,
    pub review_entries: usize,
}

impl StoreStats {
    /// Total memories in any state
    pub fn total_memories(&self) -> usize {
        self.memories_by_status.values().sum()
    }
}
