//! Hypnos - Layered agent memory with sleep-cycle consolidation
//!
//! Short-lived agent observations land in a working or short-term layer and
//! expire. A periodic *sleep cycle* asks a reasoning oracle what to do with
//! each expired memory (promote, extend, archive or forget), and a *think
//! cycle* drains a priority queue of reflection topics into new long-term
//! memories. Memory revisions form an append-only version graph.
//!
//! # Architecture
//!
//! - **Types**: Memories, think tasks, relationships and review log entries
//! - **Storage**: libSQL backend with compare-and-set lifecycle writes
//! - **Services**: Reasoning oracle contract and the Claude-backed client
//! - **Evolution**: Transition rules, sleep and think cycles, graph walks and
//!   the background scheduler
//! - **Engine**: Facade exposing every lifecycle operation
//!
//! # Example
//!
//! ```ignore
//! use hypnos_core::{ConnectionMode, EvolutionConfig, LibsqlStorage, LifecycleEngine, LlmService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = LibsqlStorage::new(ConnectionMode::Local("hypnos.db".into())).await?;
//!     let oracle = LlmService::with_default()?;
//!     let engine = LifecycleEngine::new(
//!         Arc::new(storage),
//!         Some(Arc::new(oracle)),
//!         EvolutionConfig::default(),
//!     );
//!
//!     let report = engine.run_consolidation_cycle(20, false).await?;
//!     println!("promoted {}", report.promoted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod evolution;
pub mod services;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use config::HypnosConfig;
pub use engine::LifecycleEngine;
pub use error::{HypnosError, Result};
pub use evolution::{
    BackgroundScheduler, ConsolidationReport, EvolutionConfig, ThinkOutcome,
};
pub use services::{LlmConfig, LlmService, OracleError, ReasoningOracle};
pub use storage::libsql::{ConnectionMode, LibsqlStorage};
pub use storage::{StorageBackend, StoreStats};
pub use types::{
    Decision, Direction, Domain, Memory, MemoryDraft, MemoryId, MemoryStatus, Priority,
    Relationship, RelationshipType, ReviewLogEntry, TaskId, TaskStatus, TemporalLayer, ThinkTask,
};
