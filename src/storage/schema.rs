//! Embedded schema migrations
//!
//! Migrations are compiled into the binary so an installed worker never
//! depends on a source checkout. Each entry is applied once and recorded in
//! `_migrations_applied`.

/// Ordered (name, sql) migration list
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("001_lifecycle_schema.sql", LIFECYCLE_SCHEMA),
    ("002_lifecycle_indexes.sql", LIFECYCLE_INDEXES),
    ("003_review_log_append_only.sql", REVIEW_LOG_TRIGGERS),
    ("004_review_claims.sql", REVIEW_CLAIMS),
];

const LIFECYCLE_SCHEMA: &str = r#"
-- Memory records: content depth (layer_1..layer_5) is independent of the
-- temporal layer, which governs lifespan and review eligibility.
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY NOT NULL,
    layer_1 TEXT,
    layer_2 TEXT,
    layer_3 TEXT,
    layer_4 TEXT,
    layer_5 TEXT,
    layer_1_embedding TEXT,
    layer_2_embedding TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    importance REAL NOT NULL DEFAULT 0.5 CHECK(importance BETWEEN 0.0 AND 1.0),
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    domain TEXT NOT NULL CHECK(domain IN (
        'self', 'user', 'projects', 'world', 'system', 'general'
    )),
    temporal_layer TEXT NOT NULL CHECK(temporal_layer IN (
        'working', 'short', 'long', 'archive'
    )),
    status TEXT NOT NULL CHECK(status IN (
        'active', 'expired', 'pending_review', 'archived', 'deleted'
    )),
    expires_at TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1 CHECK(version >= 1),
    is_current INTEGER NOT NULL DEFAULT 1,
    superseded_by TEXT REFERENCES memories(id),
    source_type TEXT,
    related_ids TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS memory_relationships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_id TEXT NOT NULL REFERENCES memories(id),
    to_id TEXT NOT NULL REFERENCES memories(id),
    relationship_type TEXT NOT NULL CHECK(relationship_type IN (
        'superseded_by', 'evolved_to', 'originated_from', 'contradicts',
        'reinforces', 'inspired_by', 'related_to'
    )),
    reason TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    UNIQUE(from_id, to_id, relationship_type)
);

CREATE TABLE IF NOT EXISTS think_tasks (
    id TEXT PRIMARY KEY NOT NULL,
    topic TEXT NOT NULL,
    priority TEXT NOT NULL CHECK(priority IN ('low', 'medium', 'high', 'urgent')),
    priority_rank INTEGER NOT NULL,
    context TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL CHECK(status IN (
        'pending', 'in_progress', 'complete', 'postponed'
    )),
    created_at TEXT NOT NULL,
    due_at TEXT,
    started_at TEXT,
    completed_at TEXT,
    insights_memory_id TEXT REFERENCES memories(id),
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS review_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id TEXT NOT NULL REFERENCES memories(id),
    decision TEXT NOT NULL CHECK(decision IN ('promote', 'extend', 'archive', 'forget')),
    old_layer TEXT NOT NULL,
    new_layer TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    reviewer TEXT NOT NULL DEFAULT 'sleep_cycle',
    reviewed_at TEXT NOT NULL
);
"#;

const LIFECYCLE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_memories_status_expiry ON memories(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_memories_layer_status ON memories(temporal_layer, status);
CREATE INDEX IF NOT EXISTS idx_memories_superseded_by ON memories(superseded_by);
CREATE INDEX IF NOT EXISTS idx_relationships_from ON memory_relationships(from_id, relationship_type);
CREATE INDEX IF NOT EXISTS idx_relationships_to ON memory_relationships(to_id, relationship_type);
CREATE INDEX IF NOT EXISTS idx_think_tasks_queue ON think_tasks(status, priority_rank DESC, created_at ASC);
CREATE INDEX IF NOT EXISTS idx_review_log_memory ON review_log(memory_id, reviewed_at);
"#;

const REVIEW_LOG_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS review_log_no_update
BEFORE UPDATE ON review_log
BEGIN
    SELECT RAISE(ABORT, 'review_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS review_log_no_delete
BEFORE DELETE ON review_log
BEGIN
    SELECT RAISE(ABORT, 'review_log is append-only');
END;
"#;

// Set while a consolidation pass holds the record; cleared when the pass
// applies a decision, counts a retry or gives the record back.
const REVIEW_CLAIMS: &str = r#"
ALTER TABLE memories ADD COLUMN claimed_at TEXT;
"#;
