// Sleep Cycle Consolidation
//
// Reviews expired memories in batches:
// 1. Sweep elapsed ttls to `expired` (idempotent, clock driven)
// 2. Claim up to `batch_size` candidates by moving them to `pending_review`
//    and stamping a claim no other pass may take until it goes stale
// 3. Archive claimed records already past the retry bound, then ask the
//    oracle for a decision on the rest, outside any store transaction
// 4. Apply each valid decision with a compare-and-set on `pending_review`,
//    appending a review log entry in the same transaction
// 5. Count a failed review for records without a valid decision; records
//    that exhaust their retries are archived with a fallback log entry

use super::config::{JobConfig, SleepConfig};
use super::scheduler::{EvolutionJob, JobError, JobReport};
use super::transitions::{fallback_reason, plan};
use crate::error::Result;
use crate::services::{parse_review_response, OracleError, ReasoningOracle, ReviewItem, ReviewVerdict};
use crate::storage::StorageBackend;
use crate::types::{Decision, Memory, MemoryId, MemoryStatus, TemporalLayer};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Outcome of one consolidation cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    /// Records the clock sweep moved to `expired`
    pub expired_swept: u64,
    /// Records submitted to the oracle
    pub reviewed: usize,
    pub promoted: usize,
    pub extended: usize,
    pub archived: usize,
    pub forgotten: usize,
    /// Records left in `pending_review` for a later cycle
    pub still_pending: usize,
    /// Records archived because they ran out of retries
    pub fallback_archived: usize,
    /// Writes lost to a concurrent writer
    pub conflicts: usize,
    /// Record-level storage failures
    pub errors: usize,
    pub dry_run: bool,
}

impl ConsolidationReport {
    fn tally(&mut self, decision: Decision) {
        match decision {
            Decision::Promote => self.promoted += 1,
            Decision::Extend => self.extended += 1,
            Decision::Archive => self.archived += 1,
            Decision::Forget => self.forgotten += 1,
        }
    }

    /// Records whose state changed this cycle
    pub fn applied(&self) -> usize {
        self.promoted + self.extended + self.archived + self.forgotten + self.fallback_archived
    }
}

/// Consolidation job - the sleep cycle
pub struct ConsolidationJob {
    storage: Arc<dyn StorageBackend>,
    oracle: Arc<dyn ReasoningOracle>,
    settings: SleepConfig,
    oracle_timeout: Duration,
}

impl ConsolidationJob {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        oracle: Arc<dyn ReasoningOracle>,
        settings: SleepConfig,
        oracle_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            oracle,
            settings,
            oracle_timeout,
        }
    }

    fn extend_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.extend_window)
            .unwrap_or_else(|_| chrono::Duration::days(7))
    }

    /// Claims older than this belong to a pass that died mid-review
    fn stale_claims_before(&self) -> chrono::DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.oracle_timeout * 2)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        Utc::now() - lease
    }

    /// Run one review cycle over at most `batch_size` records
    ///
    /// A dry run asks the oracle and tallies what it would apply, writing
    /// nothing beyond the expiry sweep. Oracle timeouts and outages abort the
    /// cycle with an error; claimed records stay `pending_review` and are
    /// picked up again next time.
    pub async fn run_cycle(&self, batch_size: usize, dry_run: bool) -> Result<ConsolidationReport> {
        let mut report = ConsolidationReport {
            dry_run,
            ..Default::default()
        };

        report.expired_swept = self.storage.expire_due(Utc::now()).await?;

        let candidates = self
            .storage
            .find_review_candidates(self.stale_claims_before(), batch_size)
            .await?;

        if candidates.is_empty() {
            tracing::info!("Sleep cycle: nothing awaiting review");
            return Ok(report);
        }

        let claimed = if dry_run {
            candidates
        } else {
            self.claim(candidates, &mut report).await?
        };

        let (exhausted, claimed): (Vec<Memory>, Vec<Memory>) = claimed
            .into_iter()
            .partition(|m| m.retry_count >= self.settings.max_retries);

        for memory in &exhausted {
            if dry_run {
                report.fallback_archived += 1;
            } else {
                self.fallback_archive(memory, memory.retry_count, &mut report)
                    .await;
            }
        }

        if claimed.is_empty() {
            return Ok(report);
        }

        report.reviewed = claimed.len();
        tracing::info!(
            "Sleep cycle: reviewing {} memories{}",
            claimed.len(),
            if dry_run { " (dry run)" } else { "" }
        );

        let verdicts = match self.ask_oracle(&claimed).await {
            Ok(verdicts) => verdicts,
            Err(e) => {
                if !dry_run {
                    self.release(&claimed).await;
                }
                return Err(e);
            }
        };

        let mut undecided = 0;
        for memory in &claimed {
            let decision = verdicts.get(&memory.id).and_then(|v| v.verdict.decision());
            match decision {
                Some(decision) if dry_run => report.tally(decision),
                Some(decision) => {
                    let reason = verdicts
                        .get(&memory.id)
                        .map(|v| v.reason.clone())
                        .unwrap_or_default();
                    self.apply(memory, decision, reason, &mut report).await;
                }
                None => {
                    undecided += 1;
                    if dry_run {
                        report.still_pending += 1;
                    } else {
                        self.retry_later(memory, &mut report).await;
                    }
                }
            }
        }

        if undecided > 0 {
            tracing::warn!(
                "Sleep cycle: oracle gave no valid decision for {} of {} memories",
                undecided,
                claimed.len()
            );
        }

        tracing::info!(
            "Sleep cycle complete: {} promoted, {} extended, {} archived, {} forgotten, {} pending, {} fallback, {} conflicts",
            report.promoted,
            report.extended,
            report.archived,
            report.forgotten,
            report.still_pending,
            report.fallback_archived,
            report.conflicts
        );

        Ok(report)
    }

    /// Whether a periodic tick should run a cycle
    pub async fn needs_cycle(&self) -> Result<bool> {
        self.storage.expire_due(Utc::now()).await?;

        let working = self
            .storage
            .count_memories(Some(TemporalLayer::Working), Some(MemoryStatus::Active))
            .await?;
        let expired = self
            .storage
            .count_memories(None, Some(MemoryStatus::Expired))
            .await?;
        // Left over from an aborted cycle; always retried on the next tick
        let pending = self
            .storage
            .count_memories(None, Some(MemoryStatus::PendingReview))
            .await?;

        let triggered = working > self.settings.working_threshold
            || expired > self.settings.expired_threshold
            || pending > 0;
        if triggered {
            tracing::info!(
                "Sleep cycle triggered (working: {}, expired: {}, pending: {})",
                working,
                expired,
                pending
            );
        } else {
            tracing::debug!(
                "Sleep cycle not needed (working: {}, expired: {})",
                working,
                expired
            );
        }
        Ok(triggered)
    }

    async fn claim(
        &self,
        candidates: Vec<Memory>,
        report: &mut ConsolidationReport,
    ) -> Result<Vec<Memory>> {
        let stale_before = self.stale_claims_before();
        let mut claimed = Vec::with_capacity(candidates.len());
        for mut memory in candidates {
            if self.storage.claim_for_review(&memory, stale_before).await? {
                memory.status = MemoryStatus::PendingReview;
                claimed.push(memory);
            } else {
                tracing::info!("Memory {} changed before it could be claimed", memory.id);
                report.conflicts += 1;
            }
        }
        Ok(claimed)
    }

    /// Give claims back after an aborted oracle call
    async fn release(&self, memories: &[Memory]) {
        for memory in memories {
            if let Err(e) = self.storage.release_review_claim(memory.id).await {
                tracing::warn!("Failed to release review claim on {}: {}", memory.id, e);
            }
        }
    }

    async fn ask_oracle(&self, memories: &[Memory]) -> Result<HashMap<MemoryId, ReviewVerdict>> {
        let items: Vec<ReviewItem> = memories
            .iter()
            .map(|m| ReviewItem {
                id: m.id,
                content: m.content(),
                tags: m.tags.clone(),
                domain: m.domain,
            })
            .collect();

        let response = match timeout(self.oracle_timeout, self.oracle.review_batch(&items)).await {
            Err(_) => return Err(OracleError::Timeout(self.oracle_timeout).into()),
            Ok(Err(OracleError::Malformed(msg))) => {
                tracing::warn!("Oracle returned an unusable response: {}", msg);
                return Ok(HashMap::new());
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(text)) => text,
        };

        match parse_review_response(&response) {
            Ok(verdicts) => Ok(verdicts),
            Err(e) => {
                tracing::warn!("{}", e);
                Ok(HashMap::new())
            }
        }
    }

    async fn apply(
        &self,
        memory: &Memory,
        decision: Decision,
        reason: String,
        report: &mut ConsolidationReport,
    ) {
        let now = Utc::now();
        let transition = plan(memory, decision, now, self.extend_window());
        let entry = transition.log_entry(reason, self.settings.reviewer.as_str(), now);

        match self
            .storage
            .apply_transition(&transition, MemoryStatus::PendingReview, &entry)
            .await
        {
            Ok(()) => report.tally(decision),
            Err(e) if e.is_conflict() => {
                tracing::info!("Skipping {} for {}: already decided elsewhere", decision, memory.id);
                report.conflicts += 1;
            }
            Err(e) => {
                tracing::warn!("Failed to apply {} to {}: {}", decision, memory.id, e);
                report.errors += 1;
            }
        }
    }

    async fn retry_later(&self, memory: &Memory, report: &mut ConsolidationReport) {
        let retries = match self.storage.record_failed_review(memory.id).await {
            Ok(Some(retries)) => retries,
            Ok(None) => {
                tracing::info!("Memory {} left review before its retry was counted", memory.id);
                report.conflicts += 1;
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to count retry for {}: {}", memory.id, e);
                report.errors += 1;
                return;
            }
        };

        if retries < self.settings.max_retries {
            report.still_pending += 1;
            return;
        }

        self.fallback_archive(memory, retries, report).await;
    }

    async fn fallback_archive(&self, memory: &Memory, retries: u32, report: &mut ConsolidationReport) {
        let now = Utc::now();
        let transition = plan(memory, Decision::Archive, now, self.extend_window());
        let entry = transition.log_entry(fallback_reason(retries), self.settings.reviewer.as_str(), now);

        match self
            .storage
            .apply_transition(&transition, MemoryStatus::PendingReview, &entry)
            .await
        {
            Ok(()) => {
                tracing::warn!(
                    "Archived {} after {} reviews without a valid decision",
                    memory.id,
                    retries
                );
                report.fallback_archived += 1;
            }
            Err(e) if e.is_conflict() => report.conflicts += 1,
            Err(e) => {
                tracing::warn!("Fallback archive of {} failed: {}", memory.id, e);
                report.errors += 1;
            }
        }
    }
}

#[async_trait]
impl EvolutionJob for ConsolidationJob {
    fn name(&self) -> &str {
        "consolidation"
    }

    async fn run(&self, config: &JobConfig) -> std::result::Result<JobReport, JobError> {
        let start = Instant::now();
        let report = self.run_cycle(config.batch_size, false).await?;

        Ok(JobReport {
            memories_processed: report.reviewed,
            changes_made: report.applied(),
            duration: start.elapsed(),
            errors: report.errors,
            error_message: None,
        })
    }

    async fn should_run(&self) -> std::result::Result<bool, JobError> {
        self.needs_cycle().await.map_err(JobError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HypnosError;
    use crate::services::oracle::MockReasoningOracle;
    use crate::storage::libsql::{ConnectionMode, LibsqlStorage};
    use crate::types::MemoryDraft;
    use tempfile::TempDir;

    async fn storage() -> (TempDir, Arc<LibsqlStorage>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sleep.db");
        let storage = LibsqlStorage::new_with_validation(
            ConnectionMode::Local(path.to_string_lossy().to_string()),
            true,
        )
        .await
        .unwrap();
        (dir, Arc::new(storage))
    }

    async fn expired_memory(storage: &LibsqlStorage, content: &str) -> Memory {
        let draft = MemoryDraft::working(content, chrono::Duration::minutes(-5));
        let memory = Memory::from_draft(draft, Utc::now());
        storage.store_memory(&memory).await.unwrap();
        memory
    }

    fn job(storage: Arc<LibsqlStorage>, oracle: MockReasoningOracle) -> ConsolidationJob {
        ConsolidationJob::new(
            storage,
            Arc::new(oracle),
            SleepConfig::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_oracle_outage_leaves_records_pending() {
        let (_dir, storage) = storage().await;
        let memory = expired_memory(&storage, "note").await;

        let mut oracle = MockReasoningOracle::new();
        oracle
            .expect_review_batch()
            .times(1)
            .returning(|_| Err(OracleError::Unavailable("503".into())));

        let err = job(storage.clone(), oracle)
            .run_cycle(20, false)
            .await
            .unwrap_err();
        assert!(matches!(err, HypnosError::Oracle(OracleError::Unavailable(_))));

        let reloaded = storage.get_memory(memory.id).await.unwrap();
        assert_eq!(reloaded.status, MemoryStatus::PendingReview);
        assert_eq!(reloaded.retry_count, 0);
        assert!(storage.review_history(memory.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (_dir, storage) = storage().await;
        let memory = expired_memory(&storage, "dry").await;
        let id = memory.id;

        let mut oracle = MockReasoningOracle::new();
        oracle
            .expect_review_batch()
            .returning(move |_| Ok(format!(r#"{{"{}": "promote"}}"#, id)));

        let report = job(storage.clone(), oracle).run_cycle(20, true).await.unwrap();
        assert_eq!(report.promoted, 1);
        assert!(report.dry_run);

        let reloaded = storage.get_memory(id).await.unwrap();
        assert_eq!(reloaded.status, MemoryStatus::Expired);
        assert_eq!(reloaded.temporal_layer, TemporalLayer::Working);
        assert!(storage.review_history(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_store_skips_oracle() {
        let (_dir, storage) = storage().await;
        let mut oracle = MockReasoningOracle::new();
        oracle.expect_review_batch().times(0);

        let report = job(storage, oracle).run_cycle(20, false).await.unwrap();
        assert_eq!(report.reviewed, 0);
    }

    #[tokio::test]
    async fn test_exhausted_records_skip_the_oracle() {
        let (_dir, storage) = storage().await;
        let mut memory = Memory::from_draft(
            MemoryDraft::working("stranded", chrono::Duration::minutes(-5)),
            Utc::now(),
        );
        memory.status = MemoryStatus::PendingReview;
        memory.retry_count = SleepConfig::default().max_retries;
        storage.store_memory(&memory).await.unwrap();

        let mut oracle = MockReasoningOracle::new();
        oracle.expect_review_batch().times(0);

        let report = job(storage.clone(), oracle).run_cycle(20, false).await.unwrap();
        assert_eq!(report.fallback_archived, 1);
        assert_eq!(
            storage.get_memory(memory.id).await.unwrap().status,
            MemoryStatus::Archived
        );
    }

    #[tokio::test]
    async fn test_outage_releases_claims() {
        let (_dir, storage) = storage().await;
        let memory = expired_memory(&storage, "retry me").await;

        let mut oracle = MockReasoningOracle::new();
        oracle
            .expect_review_batch()
            .returning(|_| Err(OracleError::Unavailable("503".into())));
        let job = job(storage.clone(), oracle);

        assert!(job.run_cycle(20, false).await.is_err());
        let candidates = storage
            .find_review_candidates(Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, memory.id);
    }

    #[tokio::test]
    async fn test_should_run_thresholds() {
        let (_dir, storage) = storage().await;
        let mut settings = SleepConfig::default();
        settings.expired_threshold = 1;

        let job = ConsolidationJob::new(
            storage.clone(),
            Arc::new(MockReasoningOracle::new()),
            settings,
            Duration::from_secs(5),
        );
        assert!(!job.needs_cycle().await.unwrap());

        expired_memory(&storage, "one").await;
        expired_memory(&storage, "two").await;
        assert!(job.needs_cycle().await.unwrap());
    }
}
