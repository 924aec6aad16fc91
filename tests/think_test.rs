//! Think cycle integration tests

mod common;

use common::{create_engine, create_engine_with, create_test_storage, store_long, ScriptedOracle};
use hypnos_core::{
    Direction, Domain, EvolutionConfig, MemoryStatus, Priority, RelationshipType, StorageBackend,
    TaskStatus, TemporalLayer, ThinkOutcome,
};

#[tokio::test]
async fn test_queue_order_by_priority_then_age() {
    let (_dir, storage) = create_test_storage().await;
    let oracle = ScriptedOracle::new();
    let engine = create_engine(storage.clone(), oracle.clone());

    let low = engine.enqueue_thought("low", Priority::Low, "", None).await.unwrap();
    let high = engine.enqueue_thought("high", Priority::High, "", None).await.unwrap();
    let urgent = engine.enqueue_thought("urgent", Priority::Urgent, "", None).await.unwrap();
    let medium = engine.enqueue_thought("medium", Priority::Medium, "", None).await.unwrap();

    let outcomes = engine.run_think_tick(3).await.unwrap();
    let processed: Vec<_> = outcomes.iter().map(|o| o.task_id()).collect();
    assert_eq!(processed, vec![urgent, high, medium]);
    assert_eq!(oracle.reflected_topics(), vec!["urgent", "high", "medium"]);

    assert_eq!(
        storage.get_task(low).await.unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn test_equal_priority_runs_oldest_first() {
    let (_dir, storage) = create_test_storage().await;
    let oracle = ScriptedOracle::new();
    let engine = create_engine(storage.clone(), oracle.clone());

    let first = engine.enqueue_thought("first", Priority::High, "", None).await.unwrap();
    let second = engine.enqueue_thought("second", Priority::High, "", None).await.unwrap();

    let outcomes = engine.run_think_tick(1).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].task_id(), first);

    let outcomes = engine.run_think_tick(1).await.unwrap();
    assert_eq!(outcomes[0].task_id(), second);
}

#[tokio::test]
async fn test_failed_task_returns_to_queue() {
    let (_dir, storage) = create_test_storage().await;
    let oracle = ScriptedOracle::new();
    oracle.fail_topic("flaky");
    let engine = create_engine(storage.clone(), oracle.clone());

    let id = engine
        .enqueue_thought("flaky", Priority::High, "some context", None)
        .await
        .unwrap();

    let outcomes = engine.run_think_tick(3).await.unwrap();
    assert!(matches!(outcomes[0], ThinkOutcome::Failed { .. }));

    let task = storage.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.insights_memory_id.is_none());

    // Eligible on the next tick
    oracle.heal_topic("flaky");
    let outcomes = engine.run_think_tick(3).await.unwrap();
    assert!(outcomes[0].is_completed());
    assert_eq!(
        storage.get_task(id).await.unwrap().status,
        TaskStatus::Complete
    );
}

#[tokio::test]
async fn test_insight_is_long_term_self_memory() {
    let (_dir, storage) = create_test_storage().await;
    let oracle = ScriptedOracle::new();
    let engine = create_engine(storage.clone(), oracle.clone());

    let id = engine
        .enqueue_thought("why do builds fail on fridays", Priority::Medium, "", None)
        .await
        .unwrap();
    engine.run_think_tick(3).await.unwrap();

    let task = storage.get_task(id).await.unwrap();
    let insight_id = task.insights_memory_id.unwrap();
    let insight = storage.get_memory(insight_id).await.unwrap();

    assert_eq!(insight.temporal_layer, TemporalLayer::Long);
    assert_eq!(insight.status, MemoryStatus::Active);
    assert_eq!(insight.domain, Domain::Agent);
    assert!(insight.expires_at.is_none());
    assert!(insight.tags.iter().any(|t| t == "reflection"));

    let tagged = storage.find_by_tag("reflection", 10).await.unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].id, insight_id);
}

#[tokio::test]
async fn test_thought_about_memory_links_insight() {
    let (_dir, storage) = create_test_storage().await;
    let oracle = ScriptedOracle::new();
    let engine = create_engine(storage.clone(), oracle.clone());

    let source = store_long(&storage, "deploys on friday often break").await;
    engine
        .enqueue_thought_about(source.id, "friday deploys", Priority::High, "", None)
        .await
        .unwrap();

    let outcomes = engine.run_think_tick(3).await.unwrap();
    let insight_id = match outcomes[0] {
        ThinkOutcome::Completed { insight_id, .. } => insight_id,
        ref other => panic!("expected completion, got {:?}", other),
    };

    let chain = engine
        .get_evolution_chain(insight_id, &[RelationshipType::InspiredBy], Direction::Forward)
        .await
        .unwrap();
    assert_eq!(chain, vec![insight_id, source.id]);
}

#[tokio::test]
async fn test_postponed_tasks_wait_for_reset() {
    let (_dir, storage) = create_test_storage().await;
    let oracle = ScriptedOracle::new();
    let engine = create_engine(storage.clone(), oracle.clone());

    let id = engine
        .enqueue_thought("not now", Priority::Urgent, "", None)
        .await
        .unwrap();
    engine.postpone_thought(id).await.unwrap();

    assert!(engine.run_think_tick(3).await.unwrap().is_empty());
    assert!(oracle.reflected_topics().is_empty());

    engine.reset_thought(id).await.unwrap();
    let outcomes = engine.run_think_tick(3).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_completed());

    // Completed tasks cannot be postponed
    assert!(engine.postpone_thought(id).await.is_err());
}

#[tokio::test]
async fn test_timed_out_reflection_releases_task() {
    let (_dir, storage) = create_test_storage().await;
    let oracle = ScriptedOracle::new();
    oracle.set_delay(std::time::Duration::from_millis(500));

    let mut config = EvolutionConfig::default();
    config.oracle_timeout = std::time::Duration::from_millis(50);
    let engine = create_engine_with(storage.clone(), oracle.clone(), config);

    let id = engine
        .enqueue_thought("slow thought", Priority::Low, "", None)
        .await
        .unwrap();
    let outcomes = engine.run_think_tick(1).await.unwrap();
    assert!(matches!(outcomes[0], ThinkOutcome::Failed { .. }));
    assert_eq!(
        storage.get_task(id).await.unwrap().status,
        TaskStatus::Pending
    );
}
