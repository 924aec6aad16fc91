// Background Job Scheduler
//
// Runs each registered job on its own interval. A job never overlaps with
// itself: a tick (periodic or manual) that finds the previous run still in
// flight is skipped and logged. Runs are spawned tasks with panics caught,
// so a failing job never takes the scheduler down.

use super::config::{EvolutionConfig, JobConfig};
use crate::error::HypnosError;
use crate::services::OracleError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Completed runs kept per job for `get_job_history`
const HISTORY_LIMIT: usize = 32;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job execution failed: {0}")]
    ExecutionError(String),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Storage error: {0}")]
    Storage(HypnosError),

    #[error("Job is already running")]
    AlreadyRunning,

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Job configuration invalid: {0}")]
    ConfigError(String),
}

impl From<HypnosError> for JobError {
    fn from(err: HypnosError) -> Self {
        match err {
            HypnosError::Oracle(e) => JobError::Oracle(e),
            other => JobError::Storage(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job error: {0}")]
    JobError(#[from] JobError),
}

/// Report generated after job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// Number of records processed
    pub memories_processed: usize,

    /// Number of changes made
    pub changes_made: usize,

    /// Duration of job execution
    #[serde(with = "serde_duration_millis")]
    pub duration: Duration,

    /// Number of record-level errors encountered
    pub errors: usize,

    /// Optional error message if job failed
    pub error_message: Option<String>,
}

// Custom serde module for Duration (serialize/deserialize as milliseconds)
mod serde_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Trait for background jobs
#[async_trait]
pub trait EvolutionJob: Send + Sync {
    /// Job name (for logging and tracking)
    fn name(&self) -> &str;

    /// Run the job with given configuration
    async fn run(&self, config: &JobConfig) -> Result<JobReport, JobError>;

    /// Check if a periodic tick has work to do; manual triggers skip this
    async fn should_run(&self) -> Result<bool, JobError>;
}

/// Job execution record for tracking history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub report: Option<JobReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Success,
    Failed,
    /// Tick had nothing to do
    Idle,
}

/// Per-job runtime state
struct JobSlot {
    job: Arc<dyn EvolutionJob>,
    config: JobConfig,
    busy: AtomicBool,
    consecutive_failures: AtomicU32,
    history: Mutex<VecDeque<JobRun>>,
}

/// Releases the busy flag even when the run panics
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl JobSlot {
    fn name(&self) -> &str {
        self.job.name()
    }

    /// Execute one run under the overlap guard
    ///
    /// Returns `Ok(None)` when a periodic tick found nothing to do.
    async fn execute(&self, manual: bool, degraded_after: u32) -> Result<Option<JobReport>, JobError> {
        let _guard = match BusyGuard::acquire(&self.busy) {
            Some(guard) => guard,
            None => {
                tracing::info!("Skipping {} tick: previous run still in flight", self.name());
                return Err(JobError::AlreadyRunning);
            }
        };

        if !manual {
            match self.job.should_run().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("Job {} has nothing to do", self.name());
                    self.record(Utc::now(), JobStatus::Idle, None);
                    return Ok(None);
                }
                Err(e) => {
                    tracing::error!("Failed to check if job {} should run: {}", self.name(), e);
                    self.note_failure(degraded_after);
                    return Err(e);
                }
            }
        }

        let started_at = Utc::now();
        let start = Instant::now();
        tracing::info!("Running job {}", self.name());

        let outcome = AssertUnwindSafe(self.job.run(&self.config))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(JobError::Panicked(panic_message(&*panic))));

        match outcome {
            Ok(report) => {
                tracing::info!(
                    "Job {} completed: {} processed, {} changes in {:?}",
                    self.name(),
                    report.memories_processed,
                    report.changes_made,
                    report.duration
                );
                let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
                if previous >= degraded_after {
                    tracing::info!("Job {} recovered after {} failed runs", self.name(), previous);
                }
                self.record(started_at, JobStatus::Success, Some(report.clone()));
                Ok(Some(report))
            }
            Err(e) => {
                tracing::error!("Job {} failed: {}", self.name(), e);
                self.note_failure(degraded_after);
                self.record(
                    started_at,
                    JobStatus::Failed,
                    Some(JobReport {
                        memories_processed: 0,
                        changes_made: 0,
                        duration: start.elapsed(),
                        errors: 1,
                        error_message: Some(e.to_string()),
                    }),
                );
                Err(e)
            }
        }
    }

    fn note_failure(&self, degraded_after: u32) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == degraded_after {
            tracing::warn!(
                "Job {} entered degraded mode after {} consecutive failures; will keep retrying",
                self.name(),
                failures
            );
        }
    }

    fn record(&self, started_at: DateTime<Utc>, status: JobStatus, report: Option<JobReport>) {
        let run = JobRun {
            id: uuid::Uuid::new_v4().to_string(),
            job_name: self.name().to_string(),
            started_at,
            completed_at: Some(Utc::now()),
            status,
            report,
        };
        if let Ok(mut history) = self.history.lock() {
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(run);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Background job scheduler
pub struct BackgroundScheduler {
    config: EvolutionConfig,
    jobs: Vec<Arc<JobSlot>>,
    running: AtomicBool,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundScheduler {
    /// Create a new scheduler with configuration
    pub fn new(config: EvolutionConfig) -> Self {
        Self {
            config,
            jobs: Vec::new(),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a job with the scheduler
    ///
    /// Jobs named `consolidation` and `think` take their interval and batch
    /// size from the matching config section; disabled jobs are dropped.
    pub fn register_job(&mut self, job: Arc<dyn EvolutionJob>) -> Result<(), SchedulerError> {
        let config = self.get_job_config(job.name())?;
        if !config.enabled {
            tracing::info!("Job {} is disabled; not registering", job.name());
            return Ok(());
        }
        self.jobs.push(Arc::new(JobSlot {
            job,
            config,
            busy: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            history: Mutex::new(VecDeque::new()),
        }));
        Ok(())
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|slot| slot.name().to_string()).collect()
    }

    /// Start one periodic loop per registered job and wait for cancellation
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        if !self.config.enabled || self.jobs.is_empty() {
            tracing::warn!("No background jobs registered; scheduler idle until shutdown");
            self.cancel.cancelled().await;
            return Ok(());
        }

        tracing::info!("Starting background scheduler with jobs: {:?}", self.job_names());

        let loops: Vec<JoinHandle<()>> = self
            .jobs
            .iter()
            .map(|slot| {
                tokio::spawn(job_loop(
                    slot.clone(),
                    self.cancel.clone(),
                    self.in_flight.clone(),
                    self.config.degraded_after,
                ))
            })
            .collect();

        futures::future::join_all(loops).await;
        tracing::info!("Stopped background scheduler loops");
        Ok(())
    }

    /// Cancel the loops, then give in-flight runs `shutdown_grace` to finish
    ///
    /// Runs still going after the grace period are aborted; every job leaves
    /// its records at a point the next run resumes from.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = match self.in_flight.lock() {
            Ok(mut in_flight) => in_flight.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if handles.is_empty() {
            return;
        }

        let aborts: Vec<AbortHandle> = handles.iter().map(|h| h.abort_handle()).collect();
        tracing::info!(
            "Waiting up to {:?} for {} in-flight runs",
            self.config.shutdown_grace,
            handles.len()
        );

        if timeout(self.config.shutdown_grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("Grace period elapsed; aborting in-flight runs");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    /// Run a job now, bypassing `should_run` but not the overlap guard
    pub async fn trigger(&self, job_name: &str) -> Result<JobReport, SchedulerError> {
        let slot = self
            .jobs
            .iter()
            .find(|slot| slot.name() == job_name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(job_name.to_string()))?;

        let report = slot.execute(true, self.config.degraded_after).await?;
        report.ok_or_else(|| {
            SchedulerError::JobError(JobError::ExecutionError(
                "Job completed but no report generated".to_string(),
            ))
        })
    }

    /// Consecutive failed runs of a job
    pub fn consecutive_failures(&self, job_name: &str) -> Option<u32> {
        self.jobs
            .iter()
            .find(|slot| slot.name() == job_name)
            .map(|slot| slot.consecutive_failures.load(Ordering::SeqCst))
    }

    /// Get job configuration by job name
    fn get_job_config(&self, job_name: &str) -> Result<JobConfig, SchedulerError> {
        match job_name {
            "consolidation" => Ok(self.config.consolidation.clone()),
            "think" => Ok(self.config.think.clone()),
            _ => Err(SchedulerError::JobError(JobError::ConfigError(format!(
                "Unknown job name: {}",
                job_name
            )))),
        }
    }

    /// Get history of recent job runs, newest first
    pub fn get_job_history(&self, job_name: Option<&str>, limit: usize) -> Vec<JobRun> {
        let mut runs: Vec<JobRun> = self
            .jobs
            .iter()
            .filter(|slot| job_name.map(|n| n == slot.name()).unwrap_or(true))
            .filter_map(|slot| slot.history.lock().ok().map(|h| h.iter().cloned().collect::<Vec<_>>()))
            .flatten()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        runs
    }
}

async fn job_loop(
    slot: Arc<JobSlot>,
    cancel: CancellationToken,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
    degraded_after: u32,
) {
    let mut ticker = interval(slot.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if slot.busy.load(Ordering::SeqCst) {
            tracing::info!("Skipping {} tick: previous run still in flight", slot.name());
            continue;
        }

        let run_slot = slot.clone();
        let handle = tokio::spawn(async move {
            // Failures are logged and counted inside execute
            let _ = run_slot.execute(false, degraded_after).await;
        });

        if let Ok(mut handles) = in_flight.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    tracing::debug!("Loop for {} stopped", slot.name());
}
