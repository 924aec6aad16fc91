// Evolution Module - Background memory lifecycle jobs
//
// This module implements the autonomous jobs that move memories through
// their temporal lifecycle without user intervention.
//
// Components:
// - scheduler: Periodic job loops with overlap guards and cancellation
// - transitions: Decision to (layer, status, ttl) rules
// - consolidation: The sleep cycle that reviews expired memories
// - think: The think cycle that drains the reflection queue
// - graph: Relationship traversal and memory revision

pub mod config;
pub mod consolidation;
pub mod graph;
pub mod scheduler;
pub mod think;
pub mod transitions;

pub use config::{ConfigError, EvolutionConfig, JobConfig, SleepConfig};
pub use consolidation::{ConsolidationJob, ConsolidationReport};
pub use scheduler::{
    BackgroundScheduler, EvolutionJob, JobError, JobReport, JobRun, JobStatus, SchedulerError,
};
pub use think::{ThinkOutcome, ThinkScheduler};
