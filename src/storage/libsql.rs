//! LibSQL storage backend implementation
//!
//! Provides persistent storage using libSQL (local file or remote). Each
//! operation opens its own connection, so the backend is safe to share
//! between the sleep worker, the think worker and operator commands.

use crate::error::{HypnosError, Result};
use crate::storage::rows::{
    embedding_json, parse_ts, row_to_memory, row_to_relationship, row_to_review_entry,
    row_to_task, ts, MEMORY_COLUMNS, RELATIONSHIP_COLUMNS, REVIEW_COLUMNS, TASK_COLUMNS,
};
use crate::storage::schema::MIGRATIONS;
use crate::storage::{StorageBackend, StoreStats};
use crate::types::{
    Direction, Memory, MemoryId, MemoryStatus, Relationship, RelationshipType, ReviewLogEntry,
    TaskId, TaskStatus, TemporalLayer, ThinkTask, Transition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Builder, Connection, Database, Transaction, TransactionBehavior, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Milliseconds a connection waits on a locked database before failing
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Parse SQL into individual statements, handling multi-line constructs like triggers
fn parse_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0; // BEGIN/END nesting depth

    for line in sql.lines() {
        let trimmed = line.trim();

        if current.is_empty() && (trimmed.is_empty() || trimmed.starts_with("--")) {
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let upper = trimmed.to_uppercase();
        if upper.starts_with("BEGIN") || upper.contains(" BEGIN") {
            depth += 1;
        }
        if upper.starts_with("END") {
            depth = (depth - 1).max(0);
        }

        if trimmed.ends_with(';') && depth == 0 {
            statements.push(current.clone());
            current.clear();
        }
    }

    if !current.trim().is_empty() {
        statements.push(current);
    }

    statements
}

/// LibSQL storage backend
pub struct LibsqlStorage {
    db: Database,
    local: bool,
}

/// Database connection mode
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    /// Local file-based database
    Local(String),
    /// Remote database (Turso Cloud)
    Remote { url: String, token: String },
}

impl LibsqlStorage {
    /// Validate database file before opening
    ///
    /// # Returns
    /// * `Ok(true)` if database exists and is valid
    /// * `Ok(false)` if database doesn't exist and must_exist=false
    /// * `Err(HypnosError)` with actionable message if validation fails
    fn validate_database_file(db_path: &str, must_exist: bool) -> Result<bool> {
        use std::io::Read;
        use std::path::Path;

        let path = Path::new(db_path);

        if !path.exists() {
            if must_exist {
                return Err(HypnosError::Database(format!(
                    "Database file not found at '{}'. Please run 'hypnos init' first or check your storage.path configuration.",
                    db_path
                )));
            }
            return Ok(false);
        }

        // SQLite files start with "SQLite format 3\0"; an empty file is a
        // database that was created but never written.
        let mut header = [0u8; 16];
        let read = std::fs::File::open(path)
            .and_then(|mut f| f.read(&mut header))
            .map_err(|e| {
                HypnosError::Database(format!(
                    "Cannot read database file at '{}': {}. Please check file permissions.",
                    db_path, e
                ))
            })?;

        if read == 0 {
            return Ok(true);
        }

        if read < 16 || &header != b"SQLite format 3\0" {
            return Err(HypnosError::Database(format!(
                "Database file at '{}' is corrupted or not a valid SQLite database. Please delete it and run 'hypnos init' to reinitialize.",
                db_path
            )));
        }

        debug!("Database file validation passed: {}", db_path);
        Ok(true)
    }

    /// Create a new LibSQL storage backend with validation
    ///
    /// # Arguments
    /// * `mode` - Connection mode (local or remote)
    /// * `create_if_missing` - If true, create the database (and its parent
    ///   directory) when absent. If false, error on a missing database.
    pub async fn new_with_validation(mode: ConnectionMode, create_if_missing: bool) -> Result<Self> {
        info!(
            "Connecting to LibSQL database: {:?} (create_if_missing: {})",
            mode, create_if_missing
        );

        let db = match mode {
            ConnectionMode::Local(ref path) => {
                let exists = Self::validate_database_file(path, !create_if_missing)?;
                if create_if_missing && !exists {
                    if let Some(parent) = std::path::Path::new(path).parent() {
                        if !parent.as_os_str().is_empty() {
                            std::fs::create_dir_all(parent).map_err(|e| {
                                HypnosError::Database(format!(
                                    "Failed to create database directory {}: {}",
                                    parent.display(),
                                    e
                                ))
                            })?;
                        }
                    }
                }

                Builder::new_local(path).build().await.map_err(|e| {
                    HypnosError::Database(format!("Failed to create local database: {}", e))
                })?
            }
            ConnectionMode::Remote { ref url, ref token } => {
                Builder::new_remote(url.clone(), token.clone())
                    .build()
                    .await
                    .map_err(|e| {
                        HypnosError::Database(format!("Failed to create remote database: {}", e))
                    })?
            }
        };

        info!("LibSQL database connection established");

        let storage = Self {
            db,
            local: matches!(mode, ConnectionMode::Local(_)),
        };

        if storage.local {
            let conn = storage.get_conn()?;
            pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        }

        storage.verify_database_health().await?;
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Open an existing database (secure by default: it must already exist)
    pub async fn new(mode: ConnectionMode) -> Result<Self> {
        Self::new_with_validation(mode, false).await
    }

    /// Create from string path
    ///
    /// - "libsql://..." → Remote (requires TURSO_AUTH_TOKEN in environment)
    /// - Other → Local file path
    pub async fn from_path(database_url: &str, create_if_missing: bool) -> Result<Self> {
        let mode = if database_url.starts_with("libsql://") {
            let token = std::env::var("TURSO_AUTH_TOKEN")
                .map_err(|_| HypnosError::Config("TURSO_AUTH_TOKEN not found".into()))?;
            ConnectionMode::Remote {
                url: database_url.to_string(),
                token,
            }
        } else {
            ConnectionMode::Local(database_url.to_string())
        };

        Self::new_with_validation(mode, create_if_missing).await
    }

    /// Verify database health before operations
    async fn verify_database_health(&self) -> Result<()> {
        let conn = self.conn().await?;

        conn.query("SELECT 1", ()).await.map_err(|e| {
            HypnosError::Database(format!(
                "Database corruption detected or invalid database file: {}",
                e
            ))
        })?;

        let write_test = r#"
            CREATE TABLE IF NOT EXISTS _health_check (id INTEGER PRIMARY KEY);
            DROP TABLE IF EXISTS _health_check;
        "#;

        if let Err(e) = conn.execute_batch(write_test).await {
            let error_msg = e.to_string().to_lowercase();
            if error_msg.contains("readonly") || error_msg.contains("permission") {
                return Err(HypnosError::Database(format!(
                    "Database is read-only or lacks write permissions: {}",
                    e
                )));
            }
            return Err(HypnosError::Database(format!(
                "Database write test failed: {}",
                e
            )));
        }

        debug!("Database health check passed");
        Ok(())
    }

    /// Run the embedded migrations that have not been applied yet
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");

        let conn = self.conn().await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations_applied (
                migration_name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            (),
        )
        .await
        .map_err(|e| HypnosError::Migration(format!("Failed to create migrations table: {}", e)))?;

        for (name, sql) in MIGRATIONS {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?",
                    params![*name],
                )
                .await?;

            let already_applied = match rows.next().await? {
                Some(row) => row.get::<i64>(0)?,
                None => 0,
            };

            if already_applied > 0 {
                debug!("Skipping already applied migration: {}", name);
                continue;
            }

            let statements = parse_sql_statements(sql);
            debug!("Parsed {} statements from {}", statements.len(), name);

            let tx = conn.transaction().await?;
            for (i, statement) in statements.iter().enumerate() {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                tx.execute(statement, ()).await.map_err(|e| {
                    HypnosError::Migration(format!(
                        "Failed to execute statement #{} in {}: {}\nStatement: {}",
                        i + 1,
                        name,
                        e,
                        &statement[..statement.len().min(300)]
                    ))
                })?;
            }
            tx.execute(
                "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?, ?)",
                params![*name, ts(&Utc::now())],
            )
            .await
            .map_err(|e| HypnosError::Migration(format!("Failed to record migration: {}", e)))?;
            tx.commit().await?;

            info!("Executed migration: {}", name);
        }

        info!("Database migrations completed");
        Ok(())
    }

    /// Get a raw connection from the database
    fn get_conn(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| HypnosError::Database(format!("Failed to get connection: {}", e)))
    }

    /// Get a connection configured for concurrent local use
    async fn conn(&self) -> Result<Connection> {
        let conn = self.get_conn()?;
        if self.local {
            pragma(&conn, &format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT_MS)).await?;
            pragma(&conn, "PRAGMA foreign_keys = ON").await?;
        }
        Ok(conn)
    }

    /// Open an immediate (write-locking) transaction
    async fn write_tx(&self, conn: &Connection) -> Result<Transaction> {
        Ok(conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?)
    }

    /// Check if database is healthy and operational
    pub async fn check_database_health(&self) -> Result<()> {
        let conn = self.conn().await.map_err(|e| {
            HypnosError::Database(format!(
                "Health check failed: cannot establish connection: {}",
                e
            ))
        })?;

        match conn.query("SELECT 1", ()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let error_msg = e.to_string();
                if error_msg.contains("readonly") || error_msg.contains("permission") {
                    Err(HypnosError::Database(
                        "Database is read-only or permission denied. Check file permissions."
                            .to_string(),
                    ))
                } else if error_msg.contains("corrupt") || error_msg.contains("malformed") {
                    Err(HypnosError::Database(
                        "Database appears to be corrupted. Consider restoring from backup."
                            .to_string(),
                    ))
                } else {
                    Err(HypnosError::Database(format!(
                        "Health check failed: {}",
                        error_msg
                    )))
                }
            }
        }
    }

    async fn count(&self, sql: &str, values: Vec<Value>) -> Result<usize> {
        let conn = self.conn().await?;
        let mut rows = conn.query(sql, libsql::params_from_iter(values)).await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(count.max(0) as usize)
    }

    async fn grouped_counts(&self, sql: &str) -> Result<BTreeMap<String, usize>> {
        let conn = self.conn().await?;
        let mut rows = conn.query(sql, ()).await?;
        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next().await? {
            let key: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.insert(key, count.max(0) as usize);
        }
        Ok(counts)
    }
}

/// Execute a pragma, stepping once so it takes effect
async fn pragma(conn: &Connection, sql: &str) -> Result<()> {
    let mut rows = conn.query(sql, ()).await?;
    let _ = rows.next().await?;
    Ok(())
}

async fn insert_memory(conn: &Connection, memory: &Memory) -> Result<()> {
    let sql = format!(
        "INSERT INTO memories ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        MEMORY_COLUMNS
    );

    let [l1, l2, l3, l4, l5] = memory.layers.clone();
    conn.execute(
        &sql,
        params![
            memory.id.to_string(),
            l1,
            l2,
            l3,
            l4,
            l5,
            embedding_json(&memory.embeddings[0])?,
            embedding_json(&memory.embeddings[1])?,
            serde_json::to_string(&memory.tags)?,
            memory.importance.clamp(0.0, 1.0) as f64,
            memory.access_count as i64,
            memory.last_accessed_at.as_ref().map(ts),
            ts(&memory.created_at),
            ts(&memory.updated_at),
            memory.domain.as_str(),
            memory.temporal_layer.as_str(),
            memory.status.as_str(),
            memory.expires_at.as_ref().map(ts),
            memory.retry_count as i64,
            memory.version as i64,
            if memory.is_current { 1i64 } else { 0i64 },
            memory.superseded_by.map(|id| id.to_string()),
            memory.source_type.clone(),
            serde_json::to_string(&memory.related_ids)?,
        ],
    )
    .await?;
    Ok(())
}

async fn insert_relationship(conn: &Connection, rel: &Relationship) -> Result<bool> {
    let affected = conn
        .execute(
            "INSERT OR IGNORE INTO memory_relationships (from_id, to_id, relationship_type, reason, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                rel.from_id.to_string(),
                rel.to_id.to_string(),
                rel.relationship_type.as_str(),
                rel.reason.clone(),
                ts(&rel.created_at),
            ],
        )
        .await?;
    Ok(affected > 0)
}

/// Roll back and report the lost compare-and-set
async fn conflict<T>(tx: Transaction, id: impl ToString, expected: impl ToString) -> Result<T> {
    tx.rollback().await?;
    Err(HypnosError::ConcurrencyConflict {
        id: id.to_string(),
        expected: expected.to_string(),
    })
}

#[async_trait]
impl StorageBackend for LibsqlStorage {
    async fn store_memory(&self, memory: &Memory) -> Result<()> {
        debug!("Storing memory: {}", memory.id);
        let conn = self.conn().await?;
        insert_memory(&conn, memory).await
    }

    async fn get_memory(&self, id: MemoryId) -> Result<Memory> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM memories WHERE id = ?", MEMORY_COLUMNS),
                params![id.to_string()],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| HypnosError::MemoryNotFound(id.to_string()))?;
        row_to_memory(&row)
    }

    async fn find_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<Memory>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM memories
                     WHERE status != 'deleted'
                       AND EXISTS (SELECT 1 FROM json_each(memories.tags) WHERE json_each.value = ?)
                     ORDER BY created_at DESC
                     LIMIT ?",
                    MEMORY_COLUMNS
                ),
                params![tag, limit as i64],
            )
            .await?;

        let mut memories = Vec::new();
        while let Some(row) = rows.next().await? {
            memories.push(row_to_memory(&row)?);
        }
        Ok(memories)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn().await?;
        let now = ts(&now);
        let affected = conn
            .execute(
                "UPDATE memories SET status = 'expired', updated_at = ?
                 WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?",
                params![now.clone(), now],
            )
            .await?;
        if affected > 0 {
            debug!("Expired {} memories past their ttl", affected);
        }
        Ok(affected)
    }

    async fn count_memories(
        &self,
        layer: Option<TemporalLayer>,
        status: Option<MemoryStatus>,
    ) -> Result<usize> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();
        if let Some(layer) = layer {
            conditions.push("temporal_layer = ?");
            values.push(Value::Text(layer.as_str().to_string()));
        }
        if let Some(status) = status {
            conditions.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }

        let mut sql = "SELECT COUNT(*) FROM memories".to_string();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        self.count(&sql, values).await
    }

    async fn find_review_candidates(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM memories
                     WHERE status IN ('expired', 'pending_review')
                       AND (claimed_at IS NULL OR claimed_at < ?)
                     ORDER BY expires_at IS NULL, expires_at ASC, created_at ASC
                     LIMIT ?",
                    MEMORY_COLUMNS
                ),
                params![ts(&stale_before), limit as i64],
            )
            .await?;

        let mut memories = Vec::new();
        while let Some(row) = rows.next().await? {
            memories.push(row_to_memory(&row)?);
        }
        Ok(memories)
    }

    async fn list_pending_review(&self) -> Result<Vec<MemoryId>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id FROM memories WHERE status = 'pending_review'
                 ORDER BY expires_at IS NULL, expires_at ASC, created_at ASC",
                (),
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(MemoryId::from_string(&row.get::<String>(0)?)?);
        }
        Ok(ids)
    }

    async fn claim_for_review(&self, memory: &Memory, stale_before: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn().await?;
        let now = ts(&Utc::now());
        let affected = conn
            .execute(
                "UPDATE memories SET status = 'pending_review', claimed_at = ?, updated_at = ?
                 WHERE id = ? AND status = ? AND retry_count = ?
                   AND (claimed_at IS NULL OR claimed_at < ?)",
                params![
                    now.clone(),
                    now,
                    memory.id.to_string(),
                    memory.status.as_str(),
                    memory.retry_count as i64,
                    ts(&stale_before),
                ],
            )
            .await?;
        Ok(affected > 0)
    }

    async fn release_review_claim(&self, id: MemoryId) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE memories SET claimed_at = NULL WHERE id = ? AND status = 'pending_review'",
            params![id.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn apply_transition(
        &self,
        transition: &Transition,
        expected: MemoryStatus,
        entry: &ReviewLogEntry,
    ) -> Result<()> {
        let conn = self.conn().await?;
        let tx = self.write_tx(&conn).await?;

        let affected = tx
            .execute(
                "UPDATE memories
                 SET temporal_layer = ?, status = ?, expires_at = ?, retry_count = 0,
                     claimed_at = NULL, updated_at = ?
                 WHERE id = ? AND status = ?",
                params![
                    transition.to_layer.as_str(),
                    transition.to_status.as_str(),
                    transition.expires_at.as_ref().map(ts),
                    ts(&entry.reviewed_at),
                    transition.memory_id.to_string(),
                    expected.as_str(),
                ],
            )
            .await?;

        if affected == 0 {
            return conflict(tx, transition.memory_id, expected).await;
        }

        tx.execute(
            &format!(
                "INSERT INTO review_log ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                REVIEW_COLUMNS
            ),
            params![
                entry.memory_id.to_string(),
                entry.decision.as_str(),
                entry.old_layer.as_str(),
                entry.new_layer.as_str(),
                entry.reason.clone(),
                entry.reviewer.clone(),
                ts(&entry.reviewed_at),
            ],
        )
        .await?;

        tx.commit().await?;
        debug!(
            "Applied {} to {} ({} -> {})",
            transition.decision, transition.memory_id, transition.from_layer, transition.to_layer
        );
        Ok(())
    }

    async fn record_failed_review(&self, id: MemoryId) -> Result<Option<u32>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "UPDATE memories SET retry_count = retry_count + 1, claimed_at = NULL, updated_at = ?
                 WHERE id = ? AND status = 'pending_review'
                 RETURNING retry_count",
                params![ts(&Utc::now()), id.to_string()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?.max(0) as u32)),
            None => Ok(None),
        }
    }

    async fn store_revision(&self, old_id: MemoryId, revised: &Memory, reason: &str) -> Result<()> {
        let conn = self.conn().await?;
        let tx = self.write_tx(&conn).await?;

        insert_memory(&tx, revised).await?;

        let affected = tx
            .execute(
                "UPDATE memories
                 SET is_current = 0, superseded_by = ?, updated_at = ?,
                     related_ids = json_insert(related_ids, '$[#]', ?)
                 WHERE id = ? AND is_current = 1 AND status != 'deleted'",
                params![
                    revised.id.to_string(),
                    ts(&revised.created_at),
                    revised.id.to_string(),
                    old_id.to_string(),
                ],
            )
            .await?;

        if affected == 0 {
            return conflict(tx, old_id, "current version").await;
        }

        insert_relationship(
            &tx,
            &Relationship {
                from_id: old_id,
                to_id: revised.id,
                relationship_type: RelationshipType::SupersededBy,
                reason: reason.to_string(),
                created_at: revised.created_at,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn add_relationship(&self, relationship: &Relationship) -> Result<bool> {
        let conn = self.conn().await?;
        insert_relationship(&conn, relationship).await
    }

    async fn relationships_of(
        &self,
        id: MemoryId,
        types: &[RelationshipType],
        direction: Direction,
    ) -> Result<Vec<Relationship>> {
        let id = id.to_string();
        let (clause, mut values) = match direction {
            Direction::Forward => ("from_id = ?", vec![Value::Text(id)]),
            Direction::Backward => ("to_id = ?", vec![Value::Text(id)]),
            Direction::Both => (
                "(from_id = ? OR to_id = ?)",
                vec![Value::Text(id.clone()), Value::Text(id)],
            ),
        };

        let mut sql = format!(
            "SELECT {} FROM memory_relationships WHERE {}",
            RELATIONSHIP_COLUMNS, clause
        );
        if !types.is_empty() {
            let placeholders = vec!["?"; types.len()].join(", ");
            sql.push_str(&format!(" AND relationship_type IN ({})", placeholders));
            values.extend(types.iter().map(|t| Value::Text(t.as_str().to_string())));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let conn = self.conn().await?;
        let mut rows = conn.query(&sql, libsql::params_from_iter(values)).await?;
        let mut relationships = Vec::new();
        while let Some(row) = rows.next().await? {
            relationships.push(row_to_relationship(&row)?);
        }
        Ok(relationships)
    }

    async fn enqueue_task(&self, task: &ThinkTask) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            &format!(
                "INSERT INTO think_tasks ({}, priority_rank) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                TASK_COLUMNS
            ),
            params![
                task.id.to_string(),
                task.topic.clone(),
                task.priority.as_str(),
                task.context.clone(),
                task.status.as_str(),
                ts(&task.created_at),
                task.due_at.as_ref().map(ts),
                task.started_at.as_ref().map(ts),
                task.completed_at.as_ref().map(ts),
                task.insights_memory_id.map(|id| id.to_string()),
                serde_json::to_string(&task.metadata)?,
                task.priority.rank(),
            ],
        )
        .await?;
        debug!("Enqueued think task {} ({})", task.id, task.priority);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<ThinkTask> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM think_tasks WHERE id = ?", TASK_COLUMNS),
                params![id.to_string()],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| HypnosError::TaskNotFound(id.to_string()))?;
        row_to_task(&row)
    }

    async fn next_pending_tasks(&self, limit: usize) -> Result<Vec<ThinkTask>> {
        self.list_tasks(Some(TaskStatus::Pending), limit).await
    }

    async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<ThinkTask>> {
        let mut values = Vec::new();
        let mut sql = format!("SELECT {} FROM think_tasks", TASK_COLUMNS);
        if let Some(status) = status {
            sql.push_str(" WHERE status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY priority_rank DESC, created_at ASC, rowid ASC LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let conn = self.conn().await?;
        let mut rows = conn.query(&sql, libsql::params_from_iter(values)).await?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn transition_task(
        &self,
        id: TaskId,
        expected: TaskStatus,
        new: TaskStatus,
    ) -> Result<bool> {
        let set_clause = match new {
            TaskStatus::InProgress => "status = ?, started_at = ?",
            TaskStatus::Pending | TaskStatus::Postponed => "status = ?, started_at = NULL",
            TaskStatus::Complete => {
                return Err(HypnosError::InvalidOperation(
                    "think tasks complete only together with their insight".to_string(),
                ))
            }
        };

        let mut values = vec![Value::Text(new.as_str().to_string())];
        if new == TaskStatus::InProgress {
            values.push(Value::Text(ts(&Utc::now())));
        }
        values.push(Value::Text(id.to_string()));
        values.push(Value::Text(expected.as_str().to_string()));

        let conn = self.conn().await?;
        let affected = conn
            .execute(
                &format!(
                    "UPDATE think_tasks SET {} WHERE id = ? AND status = ?",
                    set_clause
                ),
                libsql::params_from_iter(values),
            )
            .await?;
        Ok(affected > 0)
    }

    async fn complete_task(
        &self,
        id: TaskId,
        insight: &Memory,
        inspired_by: Option<MemoryId>,
    ) -> Result<()> {
        let conn = self.conn().await?;
        let tx = self.write_tx(&conn).await?;

        insert_memory(&tx, insight).await?;

        let affected = tx
            .execute(
                "UPDATE think_tasks
                 SET status = 'complete', completed_at = ?, insights_memory_id = ?
                 WHERE id = ? AND status = 'in_progress'",
                params![
                    ts(&insight.created_at),
                    insight.id.to_string(),
                    id.to_string(),
                ],
            )
            .await?;

        if affected == 0 {
            return conflict(tx, id, TaskStatus::InProgress).await;
        }

        if let Some(source) = inspired_by {
            insert_relationship(
                &tx,
                &Relationship {
                    from_id: insight.id,
                    to_id: source,
                    relationship_type: RelationshipType::InspiredBy,
                    reason: "think cycle reflection".to_string(),
                    created_at: insight.created_at,
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn recover_stalled_tasks(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn().await?;
        let affected = conn
            .execute(
                "UPDATE think_tasks SET status = 'pending', started_at = NULL
                 WHERE status = 'in_progress' AND (started_at IS NULL OR started_at < ?)",
                params![ts(&started_before)],
            )
            .await?;
        if affected > 0 {
            warn!("Released {} stalled think tasks back to pending", affected);
        }
        Ok(affected)
    }

    async fn review_history(&self, id: MemoryId) -> Result<Vec<ReviewLogEntry>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM review_log WHERE memory_id = ? ORDER BY reviewed_at ASC, id ASC",
                    REVIEW_COLUMNS
                ),
                params![id.to_string()],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_review_entry(&row)?);
        }
        Ok(entries)
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            memories_by_layer: self
                .grouped_counts("SELECT temporal_layer, COUNT(*) FROM memories GROUP BY temporal_layer")
                .await?,
            memories_by_status: self
                .grouped_counts("SELECT status, COUNT(*) FROM memories GROUP BY status")
                .await?,
            tasks_by_status: self
                .grouped_counts("SELECT status, COUNT(*) FROM think_tasks GROUP BY status")
                .await?,
            relationships: self
                .count("SELECT COUNT(*) FROM memory_relationships", Vec::new())
                .await?,
            review_entries: self
                .count("SELECT COUNT(*) FROM review_log", Vec::new())
                .await?,
        })
    }
}

impl LibsqlStorage {
    /// Timestamp of the most recent review log entry, if any
    pub async fn last_reviewed_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query("SELECT MAX(reviewed_at) FROM review_log", ())
            .await?;
        match rows.next().await? {
            Some(row) => row.get::<Option<String>>(0)?.as_deref().map(parse_ts).transpose(),
            None => Ok(None),
        }
    }
}
