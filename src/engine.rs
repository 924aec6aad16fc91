//! Lifecycle engine facade
//!
//! The operations an outer surface (CLI, API, agent runtime) calls. Holds the
//! shared store, the optional oracle and the worker settings, and wires the
//! sleep and think cycles into a [`BackgroundScheduler`].

use crate::error::{HypnosError, Result};
use crate::evolution::consolidation::{ConsolidationJob, ConsolidationReport};
use crate::evolution::graph;
use crate::evolution::think::{self, ThinkOutcome, ThinkScheduler};
use crate::evolution::transitions::plan;
use crate::evolution::{BackgroundScheduler, EvolutionConfig, SchedulerError};
use crate::services::{OracleError, ReasoningOracle};
use crate::storage::{StorageBackend, StoreStats};
use crate::types::{
    Decision, Direction, Memory, MemoryDraft, MemoryId, MemoryStatus, Priority, Relationship,
    RelationshipType, ReviewLogEntry, TaskId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Reviewer tag for decisions recorded without a named operator
pub const DEFAULT_MANUAL_REVIEWER: &str = "manual";

/// Entry point for every lifecycle operation
pub struct LifecycleEngine {
    storage: Arc<dyn StorageBackend>,
    oracle: Option<Arc<dyn ReasoningOracle>>,
    config: EvolutionConfig,
}

impl LifecycleEngine {
    /// Create an engine; without an oracle only storage-side operations work
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        oracle: Option<Arc<dyn ReasoningOracle>>,
        config: EvolutionConfig,
    ) -> Self {
        Self {
            storage,
            oracle,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }

    fn oracle(&self) -> Result<Arc<dyn ReasoningOracle>> {
        self.oracle.clone().ok_or_else(|| {
            OracleError::NotConfigured("no reasoning oracle configured".to_string()).into()
        })
    }

    fn consolidation_job(&self) -> Result<ConsolidationJob> {
        Ok(ConsolidationJob::new(
            self.storage.clone(),
            self.oracle()?,
            self.config.sleep.clone(),
            self.config.oracle_timeout,
        ))
    }

    fn think_scheduler(&self) -> Result<ThinkScheduler> {
        Ok(ThinkScheduler::new(
            self.storage.clone(),
            self.oracle()?,
            self.config.oracle_timeout,
        ))
    }

    /// Build the background scheduler for both cycles
    ///
    /// With no oracle configured the scheduler carries no jobs; this is
    /// logged once here and not on every tick.
    pub fn scheduler(&self) -> std::result::Result<BackgroundScheduler, SchedulerError> {
        let mut scheduler = BackgroundScheduler::new(self.config.clone());

        if !self.config.enabled {
            info!("Background cycles disabled by configuration");
            return Ok(scheduler);
        }

        match (self.consolidation_job(), self.think_scheduler()) {
            (Ok(consolidation), Ok(think)) => {
                scheduler.register_job(Arc::new(consolidation))?;
                scheduler.register_job(Arc::new(think))?;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Sleep and think cycles disabled: {}", e);
            }
        }

        Ok(scheduler)
    }

    // === Consolidation ===

    /// Run one sleep cycle now
    pub async fn run_consolidation_cycle(
        &self,
        batch_size: usize,
        dry_run: bool,
    ) -> Result<ConsolidationReport> {
        if batch_size == 0 {
            return Err(HypnosError::InvalidOperation(
                "batch size must be positive".to_string(),
            ));
        }
        self.consolidation_job()?.run_cycle(batch_size, dry_run).await
    }

    /// Memories awaiting review, oldest expiry first
    pub async fn list_pending_review(&self) -> Result<Vec<MemoryId>> {
        self.storage.list_pending_review().await
    }

    /// Apply a decision without consulting the oracle
    ///
    /// Goes through the same transition rules and review log as the sleep
    /// cycle. The write is conditional on the status read here, so a
    /// concurrent automated decision surfaces as a concurrency conflict, as
    /// does a decision the record already reflects.
    pub async fn record_manual_decision(
        &self,
        id: MemoryId,
        decision: Decision,
        reason: &str,
        reviewer: &str,
    ) -> Result<ReviewLogEntry> {
        let memory = self.storage.get_memory(id).await?;
        if memory.status.is_terminal() {
            return Err(HypnosError::InvalidOperation(format!(
                "memory {} is deleted and cannot be reviewed",
                id
            )));
        }

        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.sleep.extend_window)
            .map_err(|e| HypnosError::Config(e.to_string()))?;
        let transition = plan(&memory, decision, now, window);
        if transition.to_layer == memory.temporal_layer && transition.to_status == memory.status {
            return Err(HypnosError::ConcurrencyConflict {
                id: id.to_string(),
                expected: format!(
                    "a state other than {} in the {} layer",
                    memory.status, memory.temporal_layer
                ),
            });
        }

        let reviewer = if reviewer.trim().is_empty() {
            DEFAULT_MANUAL_REVIEWER
        } else {
            reviewer
        };
        let entry = transition.log_entry(reason, reviewer, now);

        self.storage
            .apply_transition(&transition, memory.status, &entry)
            .await?;

        info!(
            "Manual decision {} on {} by {} ({} -> {})",
            decision, id, reviewer, transition.from_layer, transition.to_layer
        );
        Ok(entry)
    }

    /// Audit trail for one memory, oldest first
    pub async fn review_history(&self, id: MemoryId) -> Result<Vec<ReviewLogEntry>> {
        self.storage.review_history(id).await
    }

    // === Think cycle ===

    /// Process up to `max_tasks` queued thoughts now
    pub async fn run_think_tick(&self, max_tasks: usize) -> Result<Vec<ThinkOutcome>> {
        if max_tasks == 0 {
            return Err(HypnosError::InvalidOperation(
                "max tasks must be positive".to_string(),
            ));
        }
        self.think_scheduler()?.run_tick(max_tasks).await
    }

    pub async fn enqueue_thought(
        &self,
        topic: &str,
        priority: Priority,
        context: &str,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId> {
        think::enqueue(self.storage.as_ref(), topic, priority, context, due_at, None).await
    }

    /// Queue a thought prompted by an existing memory
    pub async fn enqueue_thought_about(
        &self,
        source: MemoryId,
        topic: &str,
        priority: Priority,
        context: &str,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId> {
        think::enqueue(self.storage.as_ref(), topic, priority, context, due_at, Some(source)).await
    }

    pub async fn postpone_thought(&self, id: TaskId) -> Result<()> {
        think::postpone(self.storage.as_ref(), id).await
    }

    pub async fn reset_thought(&self, id: TaskId) -> Result<()> {
        think::reset(self.storage.as_ref(), id).await
    }

    // === Memories and graph ===

    /// Deposit a new memory
    pub async fn remember(&self, draft: MemoryDraft) -> Result<Memory> {
        if draft.layers.iter().flatten().all(|l| l.trim().is_empty()) {
            return Err(HypnosError::InvalidOperation(
                "memory has no content".to_string(),
            ));
        }
        if draft.status != MemoryStatus::Active {
            return Err(HypnosError::InvalidOperation(format!(
                "new memories start active, not {}",
                draft.status
            )));
        }

        let memory = Memory::from_draft(draft, Utc::now());
        self.storage.store_memory(&memory).await?;
        info!(
            "Stored memory {} ({}, {})",
            memory.id, memory.temporal_layer, memory.domain
        );
        Ok(memory)
    }

    /// Replace a memory's content with a new version
    pub async fn revise_memory(&self, id: MemoryId, content: &str, reason: &str) -> Result<Memory> {
        graph::revise(self.storage.as_ref(), id, content, reason).await
    }

    /// Record a typed edge; returns false when it already existed
    pub async fn add_relationship(
        &self,
        from: MemoryId,
        to: MemoryId,
        relationship_type: RelationshipType,
        reason: &str,
    ) -> Result<bool> {
        if from == to {
            return Err(HypnosError::InvalidOperation(
                "a memory cannot relate to itself".to_string(),
            ));
        }
        self.storage.get_memory(from).await?;
        self.storage.get_memory(to).await?;

        self.storage
            .add_relationship(&Relationship {
                from_id: from,
                to_id: to,
                relationship_type,
                reason: reason.to_string(),
                created_at: Utc::now(),
            })
            .await
    }

    /// Memories reachable from `id`, root first, breadth-first
    pub async fn get_evolution_chain(
        &self,
        id: MemoryId,
        types: &[RelationshipType],
        direction: Direction,
    ) -> Result<Vec<MemoryId>> {
        graph::evolution_chain(self.storage.as_ref(), id, types, direction).await
    }

    /// Every version of a memory, oldest first
    pub async fn lineage(&self, id: MemoryId) -> Result<Vec<Memory>> {
        graph::lineage(self.storage.as_ref(), id).await
    }

    pub async fn current_version(&self, id: MemoryId) -> Result<Memory> {
        graph::current_version(self.storage.as_ref(), id).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.storage.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::oracle::MockReasoningOracle;
    use crate::storage::libsql::{ConnectionMode, LibsqlStorage};
    use crate::types::TemporalLayer;
    use tempfile::TempDir;

    async fn engine(oracle: Option<MockReasoningOracle>) -> (TempDir, LifecycleEngine) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.db");
        let storage = LibsqlStorage::new_with_validation(
            ConnectionMode::Local(path.to_string_lossy().to_string()),
            true,
        )
        .await
        .unwrap();
        let oracle = oracle.map(|o| Arc::new(o) as Arc<dyn ReasoningOracle>);
        (
            dir,
            LifecycleEngine::new(Arc::new(storage), oracle, EvolutionConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_manual_decision_logs_and_transitions() {
        let (_dir, engine) = engine(None).await;
        let memory = engine
            .remember(MemoryDraft::working("manual review", chrono::Duration::hours(1)))
            .await
            .unwrap();

        let entry = engine
            .record_manual_decision(memory.id, Decision::Promote, "keeper", "alice")
            .await
            .unwrap();
        assert_eq!(entry.reviewer, "alice");

        let reloaded = engine.storage().get_memory(memory.id).await.unwrap();
        assert_eq!(reloaded.temporal_layer, TemporalLayer::Long);
        assert!(reloaded.expires_at.is_none());
        assert_eq!(engine.review_history(memory.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_manual_decision_is_rejected() {
        let (_dir, engine) = engine(None).await;
        let memory = engine
            .remember(MemoryDraft::working("decide me once", chrono::Duration::hours(1)))
            .await
            .unwrap();

        for decision in [Decision::Archive, Decision::Promote] {
            engine
                .record_manual_decision(memory.id, decision, "first", "alice")
                .await
                .unwrap();
            let err = engine
                .record_manual_decision(memory.id, decision, "again", "alice")
                .await
                .unwrap_err();
            assert!(err.is_conflict());
        }

        // Archive -> Promote is a real move, repeats are not
        assert_eq!(engine.review_history(memory.id).await.unwrap().len(), 2);
        let reloaded = engine.storage().get_memory(memory.id).await.unwrap();
        assert_eq!(reloaded.temporal_layer, TemporalLayer::Long);
        assert_eq!(reloaded.status, MemoryStatus::Active);
    }

    #[tokio::test]
    async fn test_manual_decision_rejects_deleted() {
        let (_dir, engine) = engine(None).await;
        let memory = engine
            .remember(MemoryDraft::from_content("gone soon"))
            .await
            .unwrap();
        engine
            .record_manual_decision(memory.id, Decision::Forget, "noise", "")
            .await
            .unwrap();

        let err = engine
            .record_manual_decision(memory.id, Decision::Promote, "undo", "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, HypnosError::InvalidOperation(_)));
        assert_eq!(engine.review_history(memory.id).await.unwrap().len(), 1);
        assert_eq!(
            engine.review_history(memory.id).await.unwrap()[0].reviewer,
            DEFAULT_MANUAL_REVIEWER
        );
    }

    #[tokio::test]
    async fn test_oracle_operations_need_oracle() {
        let (_dir, engine) = engine(None).await;
        let err = engine.run_consolidation_cycle(20, false).await.unwrap_err();
        assert!(matches!(err, HypnosError::Oracle(OracleError::NotConfigured(_))));
        assert!(engine.run_think_tick(3).await.is_err());

        // Queue operations still work
        let id = engine
            .enqueue_thought("offline", Priority::Low, "", None)
            .await
            .unwrap();
        engine.postpone_thought(id).await.unwrap();
        engine.reset_thought(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_without_oracle_has_no_jobs() {
        let (_dir, engine) = engine(None).await;
        let scheduler = engine.scheduler().unwrap();
        assert!(scheduler.job_names().is_empty());

        let (_dir2, engine) = engine_with_mock().await;
        let scheduler = engine.scheduler().unwrap();
        assert_eq!(scheduler.job_names().len(), 2);
    }

    async fn engine_with_mock() -> (TempDir, LifecycleEngine) {
        engine(Some(MockReasoningOracle::new())).await
    }

    #[tokio::test]
    async fn test_relationship_validation() {
        let (_dir, engine) = engine(None).await;
        let a = tokio_test::assert_ok!(engine.remember(MemoryDraft::from_content("a")).await);
        let b = tokio_test::assert_ok!(engine.remember(MemoryDraft::from_content("b")).await);

        assert!(engine
            .add_relationship(a.id, b.id, RelationshipType::EvolvedTo, "grew")
            .await
            .unwrap());
        assert!(!engine
            .add_relationship(a.id, b.id, RelationshipType::EvolvedTo, "again")
            .await
            .unwrap());
        assert!(engine
            .add_relationship(a.id, a.id, RelationshipType::RelatedTo, "self")
            .await
            .is_err());
        assert!(engine
            .add_relationship(a.id, MemoryId::new(), RelationshipType::RelatedTo, "ghost")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_remember_rejects_empty() {
        let (_dir, engine) = engine(None).await;
        tokio_test::assert_err!(engine.remember(MemoryDraft::from_content("   ")).await);
    }
}
