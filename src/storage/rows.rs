//! Row conversion between libsql and the domain types
//!
//! Timestamps are stored as fixed-width RFC 3339 text (microseconds, `Z`
//! suffix) so that SQL string comparison orders them chronologically.

use crate::error::{HypnosError, Result};
use crate::types::{
    Memory, MemoryId, Relationship, ReviewLogEntry, TaskId, ThinkTask, LAYER_COUNT,
};
use chrono::{DateTime, SecondsFormat, Utc};

/// Column list matching [`row_to_memory`]
pub(crate) const MEMORY_COLUMNS: &str = "id, layer_1, layer_2, layer_3, layer_4, layer_5, \
    layer_1_embedding, layer_2_embedding, tags, importance, access_count, last_accessed_at, \
    created_at, updated_at, domain, temporal_layer, status, expires_at, retry_count, version, \
    is_current, superseded_by, source_type, related_ids";

/// Column list matching [`row_to_task`]
pub(crate) const TASK_COLUMNS: &str = "id, topic, priority, context, status, created_at, \
    due_at, started_at, completed_at, insights_memory_id, metadata";

/// Column list matching [`row_to_relationship`]
pub(crate) const RELATIONSHIP_COLUMNS: &str =
    "from_id, to_id, relationship_type, reason, created_at";

/// Column list matching [`row_to_review_entry`]
pub(crate) const REVIEW_COLUMNS: &str =
    "memory_id, decision, old_layer, new_layer, reason, reviewer, reviewed_at";

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| HypnosError::Other(format!("Invalid timestamp '{}': {}", s, e)))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_embedding(s: Option<String>) -> Result<Option<Vec<f32>>> {
    match s {
        Some(json) if !json.is_empty() => Ok(Some(serde_json::from_str(&json)?)),
        _ => Ok(None),
    }
}

pub(crate) fn embedding_json(embedding: &Option<Vec<f32>>) -> Result<Option<String>> {
    Ok(match embedding {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    })
}

pub(crate) fn row_to_memory(row: &libsql::Row) -> Result<Memory> {
    let id = MemoryId::from_string(&row.get::<String>(0)?)?;

    let mut layers: [Option<String>; LAYER_COUNT] = Default::default();
    for (i, layer) in layers.iter_mut().enumerate() {
        *layer = row.get::<Option<String>>(1 + i as i32)?;
    }

    let embeddings = [
        parse_embedding(row.get::<Option<String>>(6)?)?,
        parse_embedding(row.get::<Option<String>>(7)?)?,
    ];

    let tags: Vec<String> = serde_json::from_str(&row.get::<String>(8)?)?;
    let importance: f64 = row.get(9)?;
    let access_count: i64 = row.get(10)?;
    let last_accessed_at = parse_opt_ts(row.get(11)?)?;
    let created_at = parse_ts(&row.get::<String>(12)?)?;
    let updated_at = parse_ts(&row.get::<String>(13)?)?;
    let domain = row.get::<String>(14)?.parse()?;
    let temporal_layer = row.get::<String>(15)?.parse()?;
    let status = row.get::<String>(16)?.parse()?;
    let expires_at = parse_opt_ts(row.get(17)?)?;
    let retry_count: i64 = row.get(18)?;
    let version: i64 = row.get(19)?;
    let is_current: i64 = row.get(20)?;
    let superseded_by = row
        .get::<Option<String>>(21)?
        .map(|s| MemoryId::from_string(&s))
        .transpose()?;
    let source_type: Option<String> = row.get(22)?;
    let related_ids: Vec<MemoryId> = serde_json::from_str(&row.get::<String>(23)?)?;

    Ok(Memory {
        id,
        created_at,
        updated_at,
        layers,
        embeddings,
        tags,
        domain,
        source_type,
        importance: importance as f32,
        access_count: access_count.max(0) as u32,
        last_accessed_at,
        temporal_layer,
        status,
        expires_at,
        retry_count: retry_count.max(0) as u32,
        version: version.max(1) as u32,
        is_current: is_current != 0,
        superseded_by,
        related_ids,
    })
}

pub(crate) fn row_to_task(row: &libsql::Row) -> Result<ThinkTask> {
    let id = TaskId::from_string(&row.get::<String>(0)?)?;
    let metadata: String = row.get(10)?;

    Ok(ThinkTask {
        id,
        topic: row.get(1)?,
        priority: row.get::<String>(2)?.parse()?,
        context: row.get(3)?,
        status: row.get::<String>(4)?.parse()?,
        created_at: parse_ts(&row.get::<String>(5)?)?,
        due_at: parse_opt_ts(row.get(6)?)?,
        started_at: parse_opt_ts(row.get(7)?)?,
        completed_at: parse_opt_ts(row.get(8)?)?,
        insights_memory_id: row
            .get::<Option<String>>(9)?
            .map(|s| MemoryId::from_string(&s))
            .transpose()?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

pub(crate) fn row_to_relationship(row: &libsql::Row) -> Result<Relationship> {
    Ok(Relationship {
        from_id: MemoryId::from_string(&row.get::<String>(0)?)?,
        to_id: MemoryId::from_string(&row.get::<String>(1)?)?,
        relationship_type: row.get::<String>(2)?.parse()?,
        reason: row.get(3)?,
        created_at: parse_ts(&row.get::<String>(4)?)?,
    })
}

pub(crate) fn row_to_review_entry(row: &libsql::Row) -> Result<ReviewLogEntry> {
    Ok(ReviewLogEntry {
        memory_id: MemoryId::from_string(&row.get::<String>(0)?)?,
        decision: row.get::<String>(1)?.parse()?,
        old_layer: row.get::<String>(2)?.parse()?,
        new_layer: row.get::<String>(3)?.parse()?,
        reason: row.get(4)?,
        reviewer: row.get(5)?,
        reviewed_at: parse_ts(&row.get::<String>(6)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let base = Utc::now();
        let earlier = ts(&base);
        let later = ts(&(base + Duration::microseconds(1)));
        assert!(earlier < later);
        assert_eq!(earlier.len(), later.len());
        assert!(earlier.ends_with('Z'));
    }

    #[test]
    fn test_timestamp_round_trip_keeps_micros() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(&now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_invalid_timestamp_is_error() {
        assert!(parse_ts("yesterday").is_err());
    }
}
