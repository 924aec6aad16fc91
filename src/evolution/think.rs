// Think Cycle
//
// Drains the think queue by priority. Each selected task is claimed
// (`pending` -> `in_progress`), reflected on by the oracle outside any store
// transaction and then either completed together with its insight memory or
// released back to `pending` for a later tick.

use super::config::JobConfig;
use super::scheduler::{EvolutionJob, JobError, JobReport};
use crate::error::{HypnosError, Result};
use crate::services::{OracleError, ReasoningOracle};
use crate::storage::StorageBackend;
use crate::types::{
    Domain, Memory, MemoryDraft, MemoryId, MemoryStatus, Priority, TaskId, TaskStatus,
    TemporalLayer, ThinkTask,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Tag every insight carries to mark its provenance
pub const REFLECTION_TAG: &str = "reflection";

/// Source type recorded on insight memories
pub const THINK_SOURCE: &str = "think_cycle";

/// Insights longer than this keep the full text in the complete layer
const DETAIL_LIMIT: usize = 2000;

/// What happened to one task during a tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ThinkOutcome {
    Completed { task_id: TaskId, insight_id: MemoryId },
    /// Released back to `pending`; eligible again next tick
    Failed { task_id: TaskId, error: String },
    /// Another run claimed or released the task first
    Skipped { task_id: TaskId },
}

impl ThinkOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            ThinkOutcome::Completed { task_id, .. }
            | ThinkOutcome::Failed { task_id, .. }
            | ThinkOutcome::Skipped { task_id } => *task_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ThinkOutcome::Completed { .. })
    }
}

/// Think scheduler over the shared store and oracle
pub struct ThinkScheduler {
    storage: Arc<dyn StorageBackend>,
    oracle: Arc<dyn ReasoningOracle>,
    oracle_timeout: Duration,
}

impl ThinkScheduler {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        oracle: Arc<dyn ReasoningOracle>,
        oracle_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            oracle,
            oracle_timeout,
        }
    }

    /// A claim older than this belongs to a run that died mid-task
    fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.oracle_timeout * 2)
            .unwrap_or_else(|_| chrono::Duration::minutes(10))
    }

    /// Process up to `max_tasks` pending tasks in queue order
    ///
    /// Each task succeeds or fails on its own; an oracle failure releases
    /// that task and the tick moves on to the next one.
    pub async fn run_tick(&self, max_tasks: usize) -> Result<Vec<ThinkOutcome>> {
        let recovered = self
            .storage
            .recover_stalled_tasks(Utc::now() - self.stale_after())
            .await?;
        if recovered > 0 {
            tracing::warn!("Released {} stalled think tasks", recovered);
        }

        let tasks = self.storage.next_pending_tasks(max_tasks).await?;
        if tasks.is_empty() {
            tracing::debug!("Think queue empty");
            return Ok(Vec::new());
        }

        tracing::info!("Think cycle: processing {} tasks", tasks.len());

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(self.process(task).await?);
        }

        let completed = outcomes.iter().filter(|o| o.is_completed()).count();
        tracing::info!(
            "Think cycle complete: {}/{} tasks produced insights",
            completed,
            outcomes.len()
        );
        Ok(outcomes)
    }

    async fn process(&self, task: ThinkTask) -> Result<ThinkOutcome> {
        let task_id = task.id;
        if !self
            .storage
            .transition_task(task_id, TaskStatus::Pending, TaskStatus::InProgress)
            .await?
        {
            tracing::info!("Think task {} was claimed elsewhere", task_id);
            return Ok(ThinkOutcome::Skipped { task_id });
        }

        tracing::debug!("Reflecting on: {}", task.topic);

        let reflection = match timeout(
            self.oracle_timeout,
            self.oracle.reflect(&task.topic, &task.context),
        )
        .await
        {
            Err(_) => Err(OracleError::Timeout(self.oracle_timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(text)) if text.trim().is_empty() => {
                Err(OracleError::Malformed("empty reflection".to_string()))
            }
            Ok(Ok(text)) => Ok(text),
        };

        let text = match reflection {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Think task {} failed: {}", task_id, e);
                self.release(task_id).await?;
                return Ok(ThinkOutcome::Failed {
                    task_id,
                    error: e.to_string(),
                });
            }
        };

        let insight = insight_memory(&task, &text, Utc::now());
        let insight_id = insight.id;

        match self
            .storage
            .complete_task(task_id, &insight, source_memory(&task))
            .await
        {
            Ok(()) => {
                tracing::info!("Think task {} produced insight {}", task_id, insight_id);
                Ok(ThinkOutcome::Completed {
                    task_id,
                    insight_id,
                })
            }
            Err(e) if e.is_conflict() => {
                tracing::info!("Think task {} was released before it completed", task_id);
                Ok(ThinkOutcome::Skipped { task_id })
            }
            Err(e) => {
                tracing::warn!("Failed to store insight for {}: {}", task_id, e);
                self.release(task_id).await?;
                Ok(ThinkOutcome::Failed {
                    task_id,
                    error: e.to_string(),
                })
            }
        }
    }

    async fn release(&self, task_id: TaskId) -> Result<()> {
        if !self
            .storage
            .transition_task(task_id, TaskStatus::InProgress, TaskStatus::Pending)
            .await?
        {
            tracing::debug!("Think task {} already released", task_id);
        }
        Ok(())
    }
}

/// Queue a topic for reflection
///
/// `source` links the eventual insight back to the memory that prompted
/// it with an `inspired_by` edge.
pub async fn enqueue(
    storage: &dyn StorageBackend,
    topic: &str,
    priority: Priority,
    context: &str,
    due_at: Option<DateTime<Utc>>,
    source: Option<MemoryId>,
) -> Result<TaskId> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(HypnosError::InvalidOperation(
            "think task topic must not be empty".to_string(),
        ));
    }

    let mut metadata = json!({});
    if let Some(source) = source {
        storage.get_memory(source).await?;
        metadata["source_memory_id"] = json!(source.to_string());
    }

    let task = ThinkTask {
        id: TaskId::new(),
        topic: topic.to_string(),
        priority,
        context: context.to_string(),
        status: TaskStatus::Pending,
        created_at: Utc::now(),
        due_at,
        started_at: None,
        completed_at: None,
        insights_memory_id: None,
        metadata,
    };
    storage.enqueue_task(&task).await?;

    tracing::info!("Queued think task {} ({}): {}", task.id, priority, topic);
    Ok(task.id)
}

/// Hold a pending task back from scheduling until it is reset
pub async fn postpone(storage: &dyn StorageBackend, id: TaskId) -> Result<()> {
    let task = storage.get_task(id).await?;
    if task.status != TaskStatus::Pending {
        return Err(HypnosError::InvalidOperation(format!(
            "only pending tasks can be postponed; {} is {}",
            id, task.status
        )));
    }
    if !storage
        .transition_task(id, TaskStatus::Pending, TaskStatus::Postponed)
        .await?
    {
        return Err(HypnosError::ConcurrencyConflict {
            id: id.to_string(),
            expected: TaskStatus::Pending.to_string(),
        });
    }
    Ok(())
}

/// Return a postponed task to the queue
pub async fn reset(storage: &dyn StorageBackend, id: TaskId) -> Result<()> {
    let task = storage.get_task(id).await?;
    if task.status != TaskStatus::Postponed {
        return Err(HypnosError::InvalidOperation(format!(
            "only postponed tasks can be reset; {} is {}",
            id, task.status
        )));
    }
    if !storage
        .transition_task(id, TaskStatus::Postponed, TaskStatus::Pending)
        .await?
    {
        return Err(HypnosError::ConcurrencyConflict {
            id: id.to_string(),
            expected: TaskStatus::Postponed.to_string(),
        });
    }
    Ok(())
}

fn source_memory(task: &ThinkTask) -> Option<MemoryId> {
    task.metadata
        .get("source_memory_id")
        .and_then(|v| v.as_str())
        .and_then(|s| MemoryId::from_string(s).ok())
}

/// Build the long-term memory that records a reflection
pub fn insight_memory(task: &ThinkTask, reflection: &str, now: DateTime<Utc>) -> Memory {
    let content = format!("Thought: {}\n\nInsights:\n{}", task.topic, reflection.trim());

    let mut draft = MemoryDraft::from_content(&content)
        .with_layer(TemporalLayer::Long)
        .with_domain(Domain::Agent)
        .with_tags(["think-cycle", REFLECTION_TAG, task.topic.as_str()])
        .with_importance(0.7)
        .with_source(THINK_SOURCE);
    if content.chars().count() > DETAIL_LIMIT {
        draft.layers[4] = Some(content);
    }
    draft.status = MemoryStatus::Active;
    draft.expires_at = None;

    Memory::from_draft(draft, now)
}

#[async_trait]
impl EvolutionJob for ThinkScheduler {
    fn name(&self) -> &str {
        "think"
    }

    async fn run(&self, config: &JobConfig) -> std::result::Result<JobReport, JobError> {
        let start = Instant::now();
        let outcomes = self.run_tick(config.batch_size).await?;

        let completed = outcomes.iter().filter(|o| o.is_completed()).count();
        let failed: Vec<&str> = outcomes
            .iter()
            .filter_map(|o| match o {
                ThinkOutcome::Failed { error, .. } => Some(error.as_str()),
                _ => None,
            })
            .collect();

        Ok(JobReport {
            memories_processed: outcomes.len(),
            changes_made: completed,
            duration: start.elapsed(),
            errors: failed.len(),
            error_message: failed.first().map(|e| e.to_string()),
        })
    }

    async fn should_run(&self) -> std::result::Result<bool, JobError> {
        let pending = self.storage.list_tasks(Some(TaskStatus::Pending), 1).await?;
        Ok(!pending.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::oracle::MockReasoningOracle;
    use crate::storage::libsql::{ConnectionMode, LibsqlStorage};
    use crate::types::{Direction, RelationshipType};
    use tempfile::TempDir;

    async fn storage() -> (TempDir, Arc<LibsqlStorage>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("think.db");
        let storage = LibsqlStorage::new_with_validation(
            ConnectionMode::Local(path.to_string_lossy().to_string()),
            true,
        )
        .await
        .unwrap();
        (dir, Arc::new(storage))
    }

    fn scheduler(storage: Arc<LibsqlStorage>, oracle: MockReasoningOracle) -> ThinkScheduler {
        ThinkScheduler::new(storage, Arc::new(oracle), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_completed_task_links_insight() {
        let (_dir, storage) = storage().await;
        let mut oracle = MockReasoningOracle::new();
        oracle
            .expect_reflect()
            .returning(|topic, _| Ok(format!("I learned something about {}", topic)));
        let think = scheduler(storage.clone(), oracle);

        let id = enqueue(storage.as_ref(), "rust lifetimes", Priority::High, "", None, None)
            .await
            .unwrap();
        let outcomes = think.run_tick(3).await.unwrap();
        assert_eq!(outcomes.len(), 1);

        let insight_id = match &outcomes[0] {
            ThinkOutcome::Completed { insight_id, .. } => *insight_id,
            other => panic!("unexpected outcome {:?}", other),
        };

        let task = storage.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert_eq!(task.insights_memory_id, Some(insight_id));
        assert!(task.completed_at.is_some());

        let insight = storage.get_memory(insight_id).await.unwrap();
        assert_eq!(insight.temporal_layer, TemporalLayer::Long);
        assert_eq!(insight.domain, Domain::Agent);
        assert!(insight.tags.contains(&REFLECTION_TAG.to_string()));
        assert!(insight.content().contains("rust lifetimes"));
    }

    #[tokio::test]
    async fn test_oracle_failure_releases_task() {
        let (_dir, storage) = storage().await;
        let mut oracle = MockReasoningOracle::new();
        oracle
            .expect_reflect()
            .returning(|_, _| Err(OracleError::Unavailable("down".into())));
        let think = scheduler(storage.clone(), oracle);

        let id = enqueue(storage.as_ref(), "topic", Priority::Medium, "", None, None)
            .await
            .unwrap();
        let outcomes = think.run_tick(3).await.unwrap();
        assert!(matches!(outcomes[0], ThinkOutcome::Failed { .. }));

        let task = storage.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
        assert_eq!(storage.next_pending_tasks(3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let (_dir, storage) = storage().await;
        let mut oracle = MockReasoningOracle::new();
        oracle.expect_reflect().returning(|topic, _| {
            if topic == "bad" {
                Ok("   ".to_string())
            } else {
                Ok("fine".to_string())
            }
        });
        let think = scheduler(storage.clone(), oracle);

        enqueue(storage.as_ref(), "bad", Priority::Urgent, "", None, None).await.unwrap();
        enqueue(storage.as_ref(), "good", Priority::Low, "", None, None).await.unwrap();

        let outcomes = think.run_tick(3).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], ThinkOutcome::Failed { .. }));
        assert!(outcomes[1].is_completed());
    }

    #[tokio::test]
    async fn test_source_memory_gets_inspired_by_edge() {
        let (_dir, storage) = storage().await;
        let source = Memory::from_draft(MemoryDraft::from_content("seed idea"), Utc::now());
        storage.store_memory(&source).await.unwrap();

        let mut oracle = MockReasoningOracle::new();
        oracle.expect_reflect().returning(|_, _| Ok("grown idea".into()));
        let think = scheduler(storage.clone(), oracle);

        enqueue(storage.as_ref(), "seed", Priority::Medium, "", None, Some(source.id))
            .await
            .unwrap();
        let outcomes = think.run_tick(1).await.unwrap();
        assert!(outcomes[0].is_completed());

        let edges = storage
            .relationships_of(source.id, &[RelationshipType::InspiredBy], Direction::Backward)
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_topic() {
        let (_dir, storage) = storage().await;
        let err = enqueue(storage.as_ref(), "  ", Priority::Low, "", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HypnosError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_postpone_and_reset() {
        let (_dir, storage) = storage().await;
        let mut oracle = MockReasoningOracle::new();
        oracle.expect_reflect().times(0);
        let think = scheduler(storage.clone(), oracle);

        let id = enqueue(storage.as_ref(), "later", Priority::High, "", None, None).await.unwrap();
        postpone(storage.as_ref(), id).await.unwrap();
        assert!(think.run_tick(3).await.unwrap().is_empty());
        assert!(postpone(storage.as_ref(), id).await.is_err());

        reset(storage.as_ref(), id).await.unwrap();
        assert_eq!(storage.get_task(id).await.unwrap().status, TaskStatus::Pending);
        assert!(reset(storage.as_ref(), id).await.is_err());
    }

    #[test]
    fn test_long_insight_keeps_full_text() {
        let task = ThinkTask {
            id: TaskId::new(),
            topic: "long".into(),
            priority: Priority::Low,
            context: String::new(),
            status: TaskStatus::InProgress,
            created_at: Utc::now(),
            due_at: None,
            started_at: None,
            completed_at: None,
            insights_memory_id: None,
            metadata: json!({}),
        };
        let text = "word ".repeat(1000);
        let memory = insight_memory(&task, &text, Utc::now());
        assert!(memory.layers[4].is_some());
        assert_eq!(memory.source_type.as_deref(), Some(THINK_SOURCE));
        assert!(memory.expires_at.is_none());
    }
}
