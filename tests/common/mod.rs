//! Common test utilities and helpers

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use hypnos_core::services::ReviewItem;
use hypnos_core::{
    ConnectionMode, EvolutionConfig, LibsqlStorage, LifecycleEngine, Memory, MemoryDraft,
    MemoryId, OracleError, ReasoningOracle, StorageBackend,
};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Create a LibSQL storage backed by a file in a fresh temp dir
///
/// libSQL's `:memory:` mode gives each connection its own database, so tests
/// use a real file. Keep the returned `TempDir` alive for the test's duration.
pub async fn create_test_storage() -> (TempDir, Arc<LibsqlStorage>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("hypnos_test.db");
    let storage = LibsqlStorage::new_with_validation(
        ConnectionMode::Local(path.to_string_lossy().to_string()),
        true, // create_if_missing - required for test databases
    )
    .await
    .expect("Failed to create test storage");
    (dir, Arc::new(storage))
}

/// Engine over `storage` with `oracle` and default worker settings
pub fn create_engine(storage: Arc<LibsqlStorage>, oracle: Arc<ScriptedOracle>) -> LifecycleEngine {
    create_engine_with(storage, oracle, EvolutionConfig::default())
}

pub fn create_engine_with(
    storage: Arc<LibsqlStorage>,
    oracle: Arc<ScriptedOracle>,
    config: EvolutionConfig,
) -> LifecycleEngine {
    LifecycleEngine::new(storage, Some(oracle), config)
}

/// Store a working-layer memory whose ttl elapsed a few minutes ago
pub async fn store_expired(storage: &LibsqlStorage, content: &str) -> Memory {
    store_expired_at(storage, content, Duration::minutes(-5)).await
}

/// Store a working-layer memory expiring `offset` from now
pub async fn store_expired_at(storage: &LibsqlStorage, content: &str, offset: Duration) -> Memory {
    let memory = Memory::from_draft(MemoryDraft::working(content, offset), Utc::now());
    storage
        .store_memory(&memory)
        .await
        .expect("Failed to store memory");
    memory
}

/// Store a record left in `pending_review` by an earlier pass
pub async fn store_pending(storage: &LibsqlStorage, content: &str, retries: u32) -> Memory {
    let mut memory = Memory::from_draft(
        MemoryDraft::working(content, Duration::minutes(-30)),
        Utc::now(),
    );
    memory.status = hypnos_core::MemoryStatus::PendingReview;
    memory.retry_count = retries;
    storage
        .store_memory(&memory)
        .await
        .expect("Failed to store memory");
    memory
}

/// Store a long-term memory with no ttl
pub async fn store_long(storage: &LibsqlStorage, content: &str) -> Memory {
    let memory = Memory::from_draft(
        MemoryDraft::from_content(content).with_layer(hypnos_core::TemporalLayer::Long),
        Utc::now(),
    );
    storage
        .store_memory(&memory)
        .await
        .expect("Failed to store memory");
    memory
}

/// Deterministic oracle for integration tests
///
/// Review responses are built from per-id scripted decisions; ids without a
/// script are omitted from the response unless a default is set. Reflection
/// echoes the topic unless the topic is marked as failing.
#[derive(Default)]
pub struct ScriptedOracle {
    decisions: Mutex<HashMap<MemoryId, String>>,
    default_decision: Mutex<Option<String>>,
    failing_topics: Mutex<HashSet<String>>,
    reflected: Mutex<Vec<String>>,
    unavailable: AtomicBool,
    delay_ms: AtomicUsize,
    pub review_calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn decide(&self, id: MemoryId, decision: &str) {
        self.decisions
            .lock()
            .unwrap()
            .insert(id, decision.to_string());
    }

    pub fn decide_all(&self, decision: &str) {
        *self.default_decision.lock().unwrap() = Some(decision.to_string());
    }

    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().unwrap().insert(topic.to_string());
    }

    pub fn heal_topic(&self, topic: &str) {
        self.failing_topics.lock().unwrap().remove(topic);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Topics reflected on, in call order
    pub fn reflected_topics(&self) -> Vec<String> {
        self.reflected.lock().unwrap().clone()
    }

    async fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(ms as u64)).await;
        }
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    async fn review_batch(&self, items: &[ReviewItem]) -> Result<String, OracleError> {
        self.review_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("scripted outage".to_string()));
        }

        let decisions = self.decisions.lock().unwrap().clone();
        let default = self.default_decision.lock().unwrap().clone();

        let mut response = Map::new();
        for item in items {
            if let Some(decision) = decisions.get(&item.id).cloned().or_else(|| default.clone()) {
                response.insert(
                    item.id.to_string(),
                    json!({ "decision": decision, "reason": format!("scripted {}", decision) }),
                );
            }
        }
        Ok(Value::Object(response).to_string())
    }

    async fn reflect(&self, topic: &str, _context: &str) -> Result<String, OracleError> {
        self.pause().await;
        self.reflected.lock().unwrap().push(topic.to_string());
        if self.failing_topics.lock().unwrap().contains(topic) {
            return Err(OracleError::Unavailable(format!("scripted failure for {}", topic)));
        }
        Ok(format!("After reflecting on {}, the pattern is clear.", topic))
    }
}
