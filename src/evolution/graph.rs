// Belief Evolution Graph
//
// Traversal and revision over the relationship table. The graph may contain
// cycles (a `contradicts` or `related_to` edge can point back at an
// ancestor), so every walk keeps an explicit visited set.

use crate::error::{HypnosError, Result};
use crate::storage::StorageBackend;
use crate::types::{auto_layer, Direction, Memory, MemoryId, MemoryStatus, RelationshipType};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};

/// Upper bound on nodes a single traversal will visit
const MAX_CHAIN_NODES: usize = 10_000;

/// Breadth-first walk from `root` over edges of `types` in `direction`
///
/// Returns each reachable memory once, root first, in the order first
/// discovered. An empty `types` follows every relationship type.
pub async fn evolution_chain(
    storage: &dyn StorageBackend,
    root: MemoryId,
    types: &[RelationshipType],
    direction: Direction,
) -> Result<Vec<MemoryId>> {
    walk(storage, root, types, direction, MAX_CHAIN_NODES).await
}

async fn walk(
    storage: &dyn StorageBackend,
    root: MemoryId,
    types: &[RelationshipType],
    direction: Direction,
    max_nodes: usize,
) -> Result<Vec<MemoryId>> {
    storage.get_memory(root).await?;

    let mut visited = HashSet::from([root]);
    let mut order = vec![root];
    let mut queue = VecDeque::from([root]);

    while let Some(node) = queue.pop_front() {
        for edge in storage.relationships_of(node, types, direction).await? {
            let next = if edge.from_id == node { edge.to_id } else { edge.from_id };
            if visited.contains(&next) {
                continue;
            }
            if order.len() >= max_nodes {
                tracing::warn!("Chain from {} truncated at {} nodes", root, max_nodes);
                return Ok(order);
            }
            visited.insert(next);
            order.push(next);
            queue.push_back(next);
        }
    }

    Ok(order)
}

/// Follow `superseded_by` forward to the record that is current
pub async fn current_version(storage: &dyn StorageBackend, id: MemoryId) -> Result<Memory> {
    let mut memory = storage.get_memory(id).await?;
    let mut seen = HashSet::from([memory.id]);

    while let Some(next) = memory.superseded_by {
        if !seen.insert(next) {
            return Err(HypnosError::Other(format!(
                "supersession cycle detected at {}",
                next
            )));
        }
        memory = storage.get_memory(next).await?;
    }

    Ok(memory)
}

/// Every version connected to `id` through `superseded_by`, oldest first
pub async fn lineage(storage: &dyn StorageBackend, id: MemoryId) -> Result<Vec<Memory>> {
    let ids = evolution_chain(
        storage,
        id,
        &[RelationshipType::SupersededBy],
        Direction::Both,
    )
    .await?;

    let mut versions = Vec::with_capacity(ids.len());
    for id in ids {
        versions.push(storage.get_memory(id).await?);
    }
    versions.sort_by_key(|m| (m.version, m.created_at));
    Ok(versions)
}

/// Replace the content of a current memory with a new version
///
/// The old row is never edited in place: a successor carrying `content`
/// is inserted, the old one is marked superseded, and a `superseded_by`
/// edge joins them.
pub async fn revise(
    storage: &dyn StorageBackend,
    id: MemoryId,
    content: &str,
    reason: &str,
) -> Result<Memory> {
    if content.trim().is_empty() {
        return Err(HypnosError::InvalidOperation(
            "revised content must not be empty".to_string(),
        ));
    }

    let old = storage.get_memory(id).await?;
    if old.status == MemoryStatus::Deleted {
        return Err(HypnosError::InvalidOperation(format!(
            "memory {} is deleted",
            id
        )));
    }
    if !old.is_current {
        return Err(HypnosError::InvalidOperation(format!(
            "memory {} was superseded by {}; revise the current version",
            id,
            old.superseded_by
                .map(|s| s.to_string())
                .unwrap_or_else(|| "an unknown record".to_string())
        )));
    }

    let revised = successor(&old, content);
    storage.store_revision(old.id, &revised, reason).await?;

    tracing::info!(
        "Revised {} -> {} (version {})",
        old.id,
        revised.id,
        revised.version
    );
    Ok(revised)
}

/// New version of `old` carrying `content`
fn successor(old: &Memory, content: &str) -> Memory {
    let now = Utc::now();
    let status = if old.status == MemoryStatus::Archived {
        MemoryStatus::Archived
    } else {
        MemoryStatus::Active
    };

    Memory {
        id: MemoryId::new(),
        created_at: now,
        updated_at: now,
        layers: auto_layer(content),
        embeddings: [None, None],
        tags: old.tags.clone(),
        domain: old.domain,
        source_type: old.source_type.clone(),
        importance: old.importance,
        access_count: 0,
        last_accessed_at: None,
        temporal_layer: old.temporal_layer,
        status,
        expires_at: old.expires_at,
        retry_count: 0,
        version: old.version + 1,
        is_current: true,
        superseded_by: None,
        related_ids: vec![old.id],
    }
}
