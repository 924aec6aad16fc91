//! Relationship graph and revision integration tests

mod common;

use common::{create_engine, create_test_storage, store_long, ScriptedOracle};
use hypnos_core::{Direction, HypnosError, MemoryId, RelationshipType, StorageBackend};

#[tokio::test]
async fn test_chain_survives_cycle() {
    let (_dir, storage) = create_test_storage().await;
    let engine = create_engine(storage.clone(), ScriptedOracle::new());

    let m1 = store_long(&storage, "tabs are best").await;
    let m2 = store_long(&storage, "tabs or spaces, whatever the project uses").await;
    let m3 = store_long(&storage, "formatters settle it").await;

    engine
        .add_relationship(m1.id, m2.id, RelationshipType::EvolvedTo, "softened")
        .await
        .unwrap();
    engine
        .add_relationship(m2.id, m3.id, RelationshipType::EvolvedTo, "automated")
        .await
        .unwrap();
    engine
        .add_relationship(m3.id, m1.id, RelationshipType::RelatedTo, "same topic")
        .await
        .unwrap();

    let chain = engine
        .get_evolution_chain(m1.id, &[RelationshipType::EvolvedTo], Direction::Forward)
        .await
        .unwrap();
    assert_eq!(chain, vec![m1.id, m2.id, m3.id]);

    // Following every type forward walks the cycle and still stops
    let everything = engine
        .get_evolution_chain(m1.id, &[], Direction::Forward)
        .await
        .unwrap();
    assert_eq!(everything, vec![m1.id, m2.id, m3.id]);

    let ancestors = engine
        .get_evolution_chain(m3.id, &[RelationshipType::EvolvedTo], Direction::Backward)
        .await
        .unwrap();
    assert_eq!(ancestors, vec![m3.id, m2.id, m1.id]);
}

#[tokio::test]
async fn test_duplicate_edge_stored_once() {
    let (_dir, storage) = create_test_storage().await;
    let engine = create_engine(storage.clone(), ScriptedOracle::new());

    let a = store_long(&storage, "a").await;
    let b = store_long(&storage, "b").await;

    assert!(engine
        .add_relationship(a.id, b.id, RelationshipType::EvolvedTo, "first")
        .await
        .unwrap());
    assert!(!engine
        .add_relationship(a.id, b.id, RelationshipType::EvolvedTo, "second")
        .await
        .unwrap());

    let edges = storage
        .relationships_of(a.id, &[RelationshipType::EvolvedTo], Direction::Forward)
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].reason, "first");

    // A different type between the same pair is a distinct edge
    assert!(engine
        .add_relationship(a.id, b.id, RelationshipType::Reinforces, "also")
        .await
        .unwrap());
    assert_eq!(storage.stats().await.unwrap().relationships, 2);
}

#[tokio::test]
async fn test_version_chain_is_monotonic() {
    let (_dir, storage) = create_test_storage().await;
    let engine = create_engine(storage.clone(), ScriptedOracle::new());

    let v1 = store_long(&storage, "the api returns xml").await;
    let v2 = engine
        .revise_memory(v1.id, "the api returns json", "migration shipped")
        .await
        .unwrap();
    let v3 = engine
        .revise_memory(v2.id, "the api returns json or msgpack", "content negotiation")
        .await
        .unwrap();

    let lineage = engine.lineage(v1.id).await.unwrap();
    assert_eq!(lineage.len(), 3);
    for pair in lineage.windows(2) {
        assert!(pair[0].version < pair[1].version);
    }
    assert_eq!(lineage.iter().filter(|m| m.is_current).count(), 1);
    assert_eq!(lineage.last().unwrap().id, v3.id);

    let old = storage.get_memory(v1.id).await.unwrap();
    assert!(!old.is_current);
    assert_eq!(old.superseded_by, Some(v2.id));
    assert!(old.related_ids.contains(&v2.id));

    let forward = engine
        .get_evolution_chain(v1.id, &[RelationshipType::SupersededBy], Direction::Forward)
        .await
        .unwrap();
    assert_eq!(forward, vec![v1.id, v2.id, v3.id]);

    assert_eq!(engine.current_version(v1.id).await.unwrap().id, v3.id);
}

#[tokio::test]
async fn test_revising_superseded_version_fails() {
    let (_dir, storage) = create_test_storage().await;
    let engine = create_engine(storage.clone(), ScriptedOracle::new());

    let v1 = store_long(&storage, "draft").await;
    engine.revise_memory(v1.id, "final", "edit").await.unwrap();

    let err = engine
        .revise_memory(v1.id, "competing edit", "late")
        .await
        .unwrap_err();
    assert!(matches!(err, HypnosError::InvalidOperation(_)));
    assert_eq!(engine.lineage(v1.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_chain_from_unknown_memory() {
    let (_dir, storage) = create_test_storage().await;
    let engine = create_engine(storage, ScriptedOracle::new());

    let err = engine
        .get_evolution_chain(MemoryId::new(), &[], Direction::Both)
        .await
        .unwrap_err();
    assert!(matches!(err, HypnosError::MemoryNotFound(_)));
}
