// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL mirror store.
//!
//! Persisted layout:
//! ```sql
//! tasks               (id PK, content, description, project_id, priority, labels JSON,
//!                      due JSON, is_completed, completed_at, created_at, content_hash,
//!                      raw JSON, synced_at)
//! projects            (id PK, name, color, parent_id, is_favorite, raw JSON)
//! labels              (id PK, name, color, raw JSON)
//! field_metadata      (task_id, field, value JSON, classified_at, PK(task_id, field))
//! provider_sync_state (task_id PK, payload JSON, content_hash, observed_at, changed_at)
//! sync_checkpoint     (id PK = 1, token, updated_at)
//! settings            (setting_key PK, setting_value)
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! JSON is stored as TEXT/LONGTEXT because the `Any` driver has no JSON type
//! mapping, and MySQL LONGTEXT comes back as bytes, so text columns are read
//! as `String` first and `Vec<u8>` second. Booleans are stored as integers.
//!
//! ## Forward-only metadata
//!
//! `save_field_metadata` enforces the timestamp rule in SQL, not in the
//! caller: a conditional `UPDATE ... WHERE classified_at < ?`, then an
//! insert-if-absent, then the conditional update once more for the case where
//! a concurrent writer inserted the row in between. A write that touches no
//! row in all three steps is stale.

use std::time::Duration;
use std::sync::Once;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool, Row};
use tracing::{debug, info, warn};

use super::query::TaskQuery;
use super::sql_translator::{SqlParam, SqlTranslator};
use super::traits::{ApplyResult, MirrorStore, StorageError};
use crate::metadata::{FieldEntry, FieldMetadata, FieldName, MetadataWrite};
use crate::model::{Due, Label, Project, ProviderSyncState, Snapshot, SyncCheckpoint, SyncMode, SyncToken, Task};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const TASK_COLUMNS: &str = "t.id, t.content, t.description, t.project_id, t.priority, t.labels, t.due, \
     t.is_completed, t.completed_at, t.created_at, t.content_hash, t.raw";

/// Rows per multi-row INSERT (13 binds per task row)
const CHUNK_SIZE: usize = 100;

const CHECKPOINT_ROW: i64 = 1;
const MODE_KEY: &str = "sync_mode";

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a text column, tolerating MySQL LONGTEXT arriving as bytes.
fn text(row: &AnyRow, col: &str) -> Option<String> {
    row.try_get::<String, _>(col).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(col)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn json_col(row: &AnyRow, col: &str) -> Result<Value, StorageError> {
    match text(row, col) {
        Some(s) if !s.is_empty() => {
            serde_json::from_str(&s).map_err(|e| StorageError::Serialization(format!("{}: {}", col, e)))
        }
        _ => Ok(Value::Null),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn task_from_row(row: &AnyRow) -> Result<Task, StorageError> {
    let id = text(row, "id").ok_or_else(|| StorageError::Serialization("task row without id".into()))?;
    let labels: Vec<String> = match json_col(row, "labels")? {
        Value::Null => Vec::new(),
        v => serde_json::from_value(v).map_err(|e| StorageError::Serialization(e.to_string()))?,
    };
    let due: Option<Due> = match json_col(row, "due")? {
        Value::Null => None,
        v => Some(serde_json::from_value(v).map_err(|e| StorageError::Serialization(e.to_string()))?),
    };
    let priority: i64 = row.try_get("priority").unwrap_or(1);
    let is_completed: i64 = row.try_get("is_completed").unwrap_or(0);

    Ok(Task {
        id,
        content: text(row, "content").unwrap_or_default(),
        description: text(row, "description").unwrap_or_default(),
        project_id: text(row, "project_id"),
        priority: priority.clamp(0, u8::MAX as i64) as u8,
        labels,
        due,
        is_completed: is_completed != 0,
        completed_at: text(row, "completed_at"),
        created_at: text(row, "created_at"),
        content_hash: text(row, "content_hash").unwrap_or_default(),
        raw: json_col(row, "raw")?,
        comments: Vec::new(),
    })
}

fn project_from_row(row: &AnyRow) -> Result<Project, StorageError> {
    let is_favorite: i64 = row.try_get("is_favorite").unwrap_or(0);
    Ok(Project {
        id: text(row, "id").ok_or_else(|| StorageError::Serialization("project row without id".into()))?,
        name: text(row, "name").unwrap_or_default(),
        color: text(row, "color"),
        parent_id: text(row, "parent_id"),
        is_favorite: is_favorite != 0,
        raw: json_col(row, "raw")?,
    })
}

fn label_from_row(row: &AnyRow) -> Result<Label, StorageError> {
    Ok(Label {
        id: text(row, "id").ok_or_else(|| StorageError::Serialization("label row without id".into()))?,
        name: text(row, "name").unwrap_or_default(),
        color: text(row, "color"),
        raw: json_col(row, "raw")?,
    })
}

#[derive(Clone)]
struct PreparedTask {
    id: String,
    content: String,
    description: String,
    project_id: Option<String>,
    priority: i64,
    labels: String,
    due: Option<String>,
    is_completed: i64,
    completed_at: Option<String>,
    created_at: Option<String>,
    content_hash: String,
    raw: Option<String>,
}

impl PreparedTask {
    fn new(task: &Task) -> Result<Self, StorageError> {
        Ok(Self {
            id: task.id.clone(),
            content: task.content.clone(),
            description: task.description.clone(),
            project_id: task.project_id.clone(),
            priority: task.priority as i64,
            labels: to_json(&task.labels)?,
            due: task.due.as_ref().map(to_json).transpose()?,
            is_completed: task.is_completed as i64,
            completed_at: task.completed_at.clone(),
            created_at: task.created_at.clone(),
            content_hash: task.content_hash.clone(),
            raw: if task.raw.is_null() { None } else { Some(to_json(&task.raw)?) },
        })
    }
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the schema.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_max_connections(connection_string, 10).await
    }

    pub async fn with_max_connections(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        info!(sqlite = is_sqlite, "Mirror store ready");
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    fn schema(&self) -> Vec<&'static str> {
        if self.is_sqlite {
            vec![
                r#"CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    project_id TEXT,
                    priority INTEGER NOT NULL DEFAULT 1,
                    labels TEXT NOT NULL DEFAULT '[]',
                    due TEXT,
                    is_completed INTEGER NOT NULL DEFAULT 0,
                    completed_at TEXT,
                    created_at TEXT,
                    content_hash TEXT NOT NULL DEFAULT '',
                    raw TEXT,
                    synced_at INTEGER NOT NULL DEFAULT 0
                )"#,
                "CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks (project_id)",
                "CREATE INDEX IF NOT EXISTS idx_tasks_completed ON tasks (is_completed)",
                r#"CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    color TEXT,
                    parent_id TEXT,
                    is_favorite INTEGER NOT NULL DEFAULT 0,
                    raw TEXT
                )"#,
                r#"CREATE TABLE IF NOT EXISTS labels (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    color TEXT,
                    raw TEXT
                )"#,
                r#"CREATE TABLE IF NOT EXISTS field_metadata (
                    task_id TEXT NOT NULL,
                    field TEXT NOT NULL,
                    value TEXT NOT NULL,
                    classified_at INTEGER NOT NULL,
                    PRIMARY KEY (task_id, field)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS provider_sync_state (
                    task_id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    observed_at INTEGER NOT NULL,
                    changed_at INTEGER NOT NULL
                )"#,
                r#"CREATE TABLE IF NOT EXISTS sync_checkpoint (
                    id INTEGER PRIMARY KEY,
                    token TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )"#,
                r#"CREATE TABLE IF NOT EXISTS settings (
                    setting_key TEXT PRIMARY KEY,
                    setting_value TEXT NOT NULL
                )"#,
            ]
        } else {
            vec![
                r#"CREATE TABLE IF NOT EXISTS tasks (
                    id VARCHAR(255) PRIMARY KEY,
                    content TEXT NOT NULL,
                    description TEXT NOT NULL,
                    project_id VARCHAR(255),
                    priority BIGINT NOT NULL DEFAULT 1,
                    labels TEXT NOT NULL,
                    due TEXT,
                    is_completed BIGINT NOT NULL DEFAULT 0,
                    completed_at VARCHAR(64),
                    created_at VARCHAR(64),
                    content_hash VARCHAR(64) NOT NULL DEFAULT '',
                    raw LONGTEXT,
                    synced_at BIGINT NOT NULL DEFAULT 0,
                    INDEX idx_tasks_project (project_id),
                    INDEX idx_tasks_completed (is_completed)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS projects (
                    id VARCHAR(255) PRIMARY KEY,
                    name TEXT NOT NULL,
                    color VARCHAR(64),
                    parent_id VARCHAR(255),
                    is_favorite BIGINT NOT NULL DEFAULT 0,
                    raw LONGTEXT
                )"#,
                r#"CREATE TABLE IF NOT EXISTS labels (
                    id VARCHAR(255) PRIMARY KEY,
                    name TEXT NOT NULL,
                    color VARCHAR(64),
                    raw LONGTEXT
                )"#,
                r#"CREATE TABLE IF NOT EXISTS field_metadata (
                    task_id VARCHAR(255) NOT NULL,
                    field VARCHAR(64) NOT NULL,
                    value TEXT NOT NULL,
                    classified_at BIGINT NOT NULL,
                    PRIMARY KEY (task_id, field)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS provider_sync_state (
                    task_id VARCHAR(255) PRIMARY KEY,
                    payload LONGTEXT NOT NULL,
                    content_hash VARCHAR(64) NOT NULL,
                    observed_at BIGINT NOT NULL,
                    changed_at BIGINT NOT NULL
                )"#,
                r#"CREATE TABLE IF NOT EXISTS sync_checkpoint (
                    id BIGINT PRIMARY KEY,
                    token TEXT NOT NULL,
                    updated_at BIGINT NOT NULL
                )"#,
                r#"CREATE TABLE IF NOT EXISTS settings (
                    setting_key VARCHAR(64) PRIMARY KEY,
                    setting_value TEXT NOT NULL
                )"#,
            ]
        }
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for sql in self.schema() {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    /// `ON CONFLICT` / `ON DUPLICATE KEY` tail for an upsert.
    fn upsert_tail(&self, key: &str, columns: &[&str]) -> String {
        if self.is_sqlite {
            let sets: Vec<String> = columns.iter().map(|c| format!("{c} = excluded.{c}")).collect();
            format!("ON CONFLICT({}) DO UPDATE SET {}", key, sets.join(", "))
        } else {
            let sets: Vec<String> = columns.iter().map(|c| format!("{c} = VALUES({c})")).collect();
            format!("ON DUPLICATE KEY UPDATE {}", sets.join(", "))
        }
    }

    fn insert_ignore(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT OR IGNORE"
        } else {
            "INSERT IGNORE"
        }
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Any>, StorageError> {
        self.pool.acquire().await.map_err(backend)
    }

    async fn upsert_tasks(&self, conn: &mut AnyConnection, tasks: &[Task], synced_at: i64) -> Result<usize, StorageError> {
        let prepared: Vec<PreparedTask> = tasks.iter().map(PreparedTask::new).collect::<Result<_, _>>()?;
        let tail = self.upsert_tail(
            "id",
            &[
                "content", "description", "project_id", "priority", "labels", "due",
                "is_completed", "completed_at", "created_at", "content_hash", "raw", "synced_at",
            ],
        );

        for chunk in prepared.chunks(CHUNK_SIZE) {
            let placeholders: Vec<&str> = (0..chunk.len())
                .map(|_| "(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
                .collect();
            let sql = format!(
                "INSERT INTO tasks (id, content, description, project_id, priority, labels, due, \
                 is_completed, completed_at, created_at, content_hash, raw, synced_at) VALUES {} {}",
                placeholders.join(", "),
                tail
            );
            let mut query = sqlx::query(&sql);
            for row in chunk {
                query = query
                    .bind(&row.id)
                    .bind(&row.content)
                    .bind(&row.description)
                    .bind(&row.project_id)
                    .bind(row.priority)
                    .bind(&row.labels)
                    .bind(&row.due)
                    .bind(row.is_completed)
                    .bind(&row.completed_at)
                    .bind(&row.created_at)
                    .bind(&row.content_hash)
                    .bind(&row.raw)
                    .bind(synced_at);
            }
            query.execute(&mut *conn).await.map_err(backend)?;
        }
        Ok(prepared.len())
    }

    async fn upsert_provider_state(&self, conn: &mut AnyConnection, task: &Task, observed_at: i64) -> Result<(), StorageError> {
        // changed_at must be assigned before content_hash: MySQL evaluates
        // ON DUPLICATE KEY assignments left to right.
        let sql = if self.is_sqlite {
            "INSERT INTO provider_sync_state (task_id, payload, content_hash, observed_at, changed_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(task_id) DO UPDATE SET \
                changed_at = CASE WHEN provider_sync_state.content_hash = excluded.content_hash \
                             THEN provider_sync_state.changed_at ELSE excluded.changed_at END, \
                payload = excluded.payload, \
                content_hash = excluded.content_hash, \
                observed_at = excluded.observed_at"
        } else {
            "INSERT INTO provider_sync_state (task_id, payload, content_hash, observed_at, changed_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                changed_at = IF(content_hash = VALUES(content_hash), changed_at, VALUES(changed_at)), \
                payload = VALUES(payload), \
                content_hash = VALUES(content_hash), \
                observed_at = VALUES(observed_at)"
        };
        sqlx::query(sql)
            .bind(&task.id)
            .bind(to_json(&task.provider_payload())?)
            .bind(&task.content_hash)
            .bind(observed_at)
            .bind(observed_at)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn upsert_project(&self, conn: &mut AnyConnection, project: &Project) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO projects (id, name, color, parent_id, is_favorite, raw) VALUES (?, ?, ?, ?, ?, ?) {}",
            self.upsert_tail("id", &["name", "color", "parent_id", "is_favorite", "raw"])
        );
        let raw = if project.raw.is_null() { None } else { Some(to_json(&project.raw)?) };
        sqlx::query(&sql)
            .bind(&project.id)
            .bind(&project.name)
            .bind(&project.color)
            .bind(&project.parent_id)
            .bind(project.is_favorite as i64)
            .bind(raw)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn upsert_label(&self, conn: &mut AnyConnection, label: &Label) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO labels (id, name, color, raw) VALUES (?, ?, ?, ?) {}",
            self.upsert_tail("id", &["name", "color", "raw"])
        );
        let raw = if label.raw.is_null() { None } else { Some(to_json(&label.raw)?) };
        sqlx::query(&sql)
            .bind(&label.id)
            .bind(&label.name)
            .bind(&label.color)
            .bind(raw)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_task_rows(conn: &mut AnyConnection, id: &str) -> Result<bool, StorageError> {
        sqlx::query("DELETE FROM field_metadata WHERE task_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
        sqlx::query("DELETE FROM provider_sync_state WHERE task_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_id(&self, table: &str, id: &str) -> Result<bool, StorageError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", table);
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_checkpoint(&self, conn: &mut AnyConnection, token: &SyncToken, updated_at: i64) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO sync_checkpoint (id, token, updated_at) VALUES (?, ?, ?) {}",
            self.upsert_tail("id", &["token", "updated_at"])
        );
        sqlx::query(&sql)
            .bind(CHECKPOINT_ROW)
            .bind(token.as_str())
            .bind(updated_at)
            .execute(&mut *conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn conditional_metadata_update(
        conn: &mut AnyConnection,
        task_id: &str,
        field: &str,
        value: &str,
        classified_at: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE field_metadata SET value = ?, classified_at = ? \
             WHERE task_id = ? AND field = ? AND classified_at < ?",
        )
        .bind(value)
        .bind(classified_at)
        .bind(task_id)
        .bind(field)
        .bind(classified_at)
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MirrorStore for SqlStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StorageError> {
        let sql = format!("SELECT {} FROM tasks t WHERE t.id = ?", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        let mut conn = self.acquire().await?;
        self.upsert_tasks(&mut conn, std::slice::from_ref(task), crate::model::now_millis()).await?;
        Ok(())
    }

    async fn save_tasks(&self, tasks: &[Task]) -> Result<usize, StorageError> {
        if tasks.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let written = self.upsert_tasks(&mut tx, tasks, crate::model::now_millis()).await?;
        tx.commit().await.map_err(backend)?;
        Ok(written)
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let deleted = Self::delete_task_rows(&mut tx, id).await?;
        tx.commit().await.map_err(backend)?;
        Ok(deleted)
    }

    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StorageError> {
        let translated = SqlTranslator::translate(query, self.is_sqlite);
        let sql = format!(
            "SELECT {} FROM tasks t WHERE {} ORDER BY t.id",
            TASK_COLUMNS, translated.clause
        );
        let mut q = sqlx::query(&sql);
        for param in &translated.params {
            q = match param {
                SqlParam::Text(s) => q.bind(s.clone()),
                SqlParam::Int(i) => q.bind(*i),
                SqlParam::Float(f) => q.bind(*f),
            };
        }
        let rows = q.fetch_all(&self.pool).await.map_err(backend)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn task_ids(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT id FROM tasks ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.iter().filter_map(|r| text(r, "id")).collect())
    }

    async fn import_task(&self, task: &Task, observed_at: i64) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        self.upsert_tasks(&mut tx, std::slice::from_ref(task), observed_at).await?;
        self.upsert_provider_state(&mut tx, task, observed_at).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn replace_task(&self, old_id: &str, task: &Task, observed_at: i64) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let exists = sqlx::query("SELECT 1 AS present FROM tasks WHERE id = ?")
            .bind(old_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        if exists.is_none() {
            return Err(StorageError::NotFound);
        }

        sqlx::query("DELETE FROM field_metadata WHERE task_id = ?")
            .bind(&task.id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query("UPDATE field_metadata SET task_id = ? WHERE task_id = ?")
            .bind(&task.id)
            .bind(old_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query("DELETE FROM provider_sync_state WHERE task_id = ?")
            .bind(old_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(old_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        self.upsert_tasks(&mut tx, std::slice::from_ref(task), observed_at).await?;
        self.upsert_provider_state(&mut tx, task, observed_at).await?;

        tx.commit().await.map_err(backend)?;
        debug!(old_id, new_id = %task.id, "Task re-keyed");
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, StorageError> {
        let row = sqlx::query("SELECT id, name, color, parent_id, is_favorite, raw FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn save_project(&self, project: &Project) -> Result<(), StorageError> {
        let mut conn = self.acquire().await?;
        self.upsert_project(&mut conn, project).await
    }

    async fn delete_project(&self, id: &str) -> Result<bool, StorageError> {
        self.delete_by_id("projects", id).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StorageError> {
        let rows = sqlx::query("SELECT id, name, color, parent_id, is_favorite, raw FROM projects ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(project_from_row).collect()
    }

    async fn get_label(&self, id: &str) -> Result<Option<Label>, StorageError> {
        let row = sqlx::query("SELECT id, name, color, raw FROM labels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(label_from_row).transpose()
    }

    async fn save_label(&self, label: &Label) -> Result<(), StorageError> {
        let mut conn = self.acquire().await?;
        self.upsert_label(&mut conn, label).await
    }

    async fn delete_label(&self, id: &str) -> Result<bool, StorageError> {
        self.delete_by_id("labels", id).await
    }

    async fn list_labels(&self) -> Result<Vec<Label>, StorageError> {
        let rows = sqlx::query("SELECT id, name, color, raw FROM labels ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(label_from_row).collect()
    }

    async fn save_field_metadata(
        &self,
        task_id: &str,
        field: FieldName,
        value: &Value,
        classified_at: i64,
    ) -> Result<MetadataWrite, StorageError> {
        let encoded = to_json(value)?;
        let field_name = field.as_str();
        let mut tx = self.pool.begin().await.map_err(backend)?;

        if Self::conditional_metadata_update(&mut tx, task_id, field_name, &encoded, classified_at).await? {
            tx.commit().await.map_err(backend)?;
            return Ok(MetadataWrite::Applied);
        }

        let sql = format!(
            "{} INTO field_metadata (task_id, field, value, classified_at) VALUES (?, ?, ?, ?)",
            self.insert_ignore()
        );
        let inserted = sqlx::query(&sql)
            .bind(task_id)
            .bind(field_name)
            .bind(&encoded)
            .bind(classified_at)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        if inserted.rows_affected() > 0 {
            tx.commit().await.map_err(backend)?;
            return Ok(MetadataWrite::Applied);
        }

        // Lost an insert race; the row exists now, so the conditional update decides
        if Self::conditional_metadata_update(&mut tx, task_id, field_name, &encoded, classified_at).await? {
            tx.commit().await.map_err(backend)?;
            return Ok(MetadataWrite::Applied);
        }

        let row = sqlx::query("SELECT classified_at FROM field_metadata WHERE task_id = ? AND field = ?")
            .bind(task_id)
            .bind(field_name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        let stored_at: i64 = row
            .map(|r| r.try_get("classified_at").unwrap_or(classified_at))
            .unwrap_or(classified_at);
        Ok(MetadataWrite::Stale { stored_at })
    }

    async fn get_field_metadata(&self, task_id: &str) -> Result<Option<FieldMetadata>, StorageError> {
        let rows = sqlx::query("SELECT field, value, classified_at FROM field_metadata WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut meta = FieldMetadata::new(task_id);
        for row in &rows {
            let name = text(row, "field").unwrap_or_default();
            let field = match name.parse::<FieldName>() {
                Ok(f) => f,
                Err(e) => {
                    warn!(task_id, error = %e, "Skipping unknown metadata field");
                    continue;
                }
            };
            let value = json_col(row, "value")?;
            let classified_at: i64 = row.try_get("classified_at").map_err(backend)?;
            meta.fields.insert(field, FieldEntry { value, classified_at });
        }
        Ok(Some(meta))
    }

    async fn get_last_synced_state(&self, task_id: &str) -> Result<Option<ProviderSyncState>, StorageError> {
        let row = sqlx::query(
            "SELECT task_id, payload, content_hash, observed_at, changed_at FROM provider_sync_state WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => Ok(Some(ProviderSyncState {
                task_id: task_id.to_string(),
                payload: json_col(&row, "payload")?,
                content_hash: text(&row, "content_hash").unwrap_or_default(),
                observed_at: row.try_get("observed_at").map_err(backend)?,
                changed_at: row.try_get("changed_at").map_err(backend)?,
            })),
            None => Ok(None),
        }
    }

    async fn save_last_synced_state(&self, task: &Task, observed_at: i64) -> Result<ProviderSyncState, StorageError> {
        {
            let mut conn = self.acquire().await?;
            self.upsert_provider_state(&mut conn, task, observed_at).await?;
        }
        self.get_last_synced_state(&task.id)
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn get_checkpoint(&self) -> Result<Option<SyncCheckpoint>, StorageError> {
        let row = sqlx::query("SELECT token, updated_at FROM sync_checkpoint WHERE id = ?")
            .bind(CHECKPOINT_ROW)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => Ok(Some(SyncCheckpoint {
                token: SyncToken::new(text(&row, "token").unwrap_or_default()),
                updated_at: row.try_get("updated_at").map_err(backend)?,
            })),
            None => Ok(None),
        }
    }

    async fn set_checkpoint(&self, token: &SyncToken, updated_at: i64) -> Result<(), StorageError> {
        let mut conn = self.acquire().await?;
        self.write_checkpoint(&mut conn, token, updated_at).await
    }

    async fn get_sync_mode(&self) -> Result<Option<SyncMode>, StorageError> {
        let row = sqlx::query("SELECT setting_value FROM settings WHERE setting_key = ?")
            .bind(MODE_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row
            .and_then(|r| text(&r, "setting_value"))
            .and_then(|v| SyncMode::parse(&v)))
    }

    async fn set_sync_mode(&self, mode: SyncMode) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO settings (setting_key, setting_value) VALUES (?, ?) {}",
            self.upsert_tail("setting_key", &["setting_value"])
        );
        sqlx::query(&sql)
            .bind(MODE_KEY)
            .bind(mode.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn apply_snapshot(&self, snapshot: &Snapshot, observed_at: i64) -> Result<ApplyResult, StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut result = ApplyResult::default();

        result.tasks = self.upsert_tasks(&mut tx, &snapshot.tasks, observed_at).await?;
        for task in &snapshot.tasks {
            self.upsert_provider_state(&mut tx, task, observed_at).await?;
        }
        for project in &snapshot.projects {
            self.upsert_project(&mut tx, project).await?;
            result.projects += 1;
        }
        for label in &snapshot.labels {
            self.upsert_label(&mut tx, label).await?;
            result.labels += 1;
        }
        for id in &snapshot.deleted_task_ids {
            if Self::delete_task_rows(&mut tx, id).await? {
                result.deleted_tasks += 1;
            }
        }
        for id in &snapshot.deleted_project_ids {
            sqlx::query("DELETE FROM projects WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        for id in &snapshot.deleted_label_ids {
            sqlx::query("DELETE FROM labels WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        self.write_checkpoint(&mut tx, &snapshot.sync_token, observed_at).await?;

        // Dropping `tx` before this point rolls everything back
        tx.commit().await.map_err(backend)?;

        debug!(
            tasks = result.tasks,
            projects = result.projects,
            labels = result.labels,
            deleted = result.deleted_tasks,
            "Snapshot applied"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::query::QueryBuilder;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("task_sync_test_{}_{}.db", name, uuid::Uuid::new_v4()))
    }

    fn cleanup_db(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{}-wal", path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", path.display()));
    }

    async fn open(path: &PathBuf) -> SqlStore {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        SqlStore::new(&url).await.unwrap()
    }

    fn test_task(id: &str, project: &str) -> Task {
        let mut task = Task::new(id, format!("task {}", id));
        task.project_id = Some(project.to_string());
        task.labels = vec!["home".into()];
        task.due = Some(Due {
            date: "2026-01-02".into(),
            datetime: None,
            string: Some("jan 2".into()),
            is_recurring: false,
        });
        task.raw = json!({"id": id, "child_order": 1});
        task.refresh_hash();
        task
    }

    #[tokio::test]
    async fn test_task_round_trip() {
        let db_path = temp_db_path("task_round_trip");
        let store = open(&db_path).await;

        let task = test_task("a", "p1");
        store.save_task(&task).await.unwrap();

        let got = store.get_task("a").await.unwrap().unwrap();
        assert_eq!(got, task);
        assert!(store.get_task("missing").await.unwrap().is_none());

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_save_tasks_batch_and_delete() {
        let db_path = temp_db_path("batch");
        let store = open(&db_path).await;

        let tasks: Vec<Task> = (0..250).map(|i| test_task(&format!("t{:03}", i), "p")).collect();
        assert_eq!(store.save_tasks(&tasks).await.unwrap(), 250);
        assert_eq!(store.task_ids().await.unwrap().len(), 250);

        let _ = store.save_field_metadata("t000", FieldName::Category, &json!("x"), 1).await.unwrap();
        assert!(store.delete_task("t000").await.unwrap());
        assert!(!store.delete_task("t000").await.unwrap());
        assert!(store.get_field_metadata("t000").await.unwrap().is_none());

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_metadata_forward_only() {
        let db_path = temp_db_path("metadata");
        let store = open(&db_path).await;

        let t1 = 1_000;
        let t2 = 2_000;
        assert_eq!(
            store.save_field_metadata("a", FieldName::PriorityScore, &json!(0.4), t1).await.unwrap(),
            MetadataWrite::Applied
        );
        assert_eq!(
            store.save_field_metadata("a", FieldName::PriorityScore, &json!(0.9), t2).await.unwrap(),
            MetadataWrite::Applied
        );
        assert_eq!(
            store.save_field_metadata("a", FieldName::PriorityScore, &json!(0.4), t1).await.unwrap(),
            MetadataWrite::Stale { stored_at: t2 }
        );
        // Equal timestamp is also rejected
        assert!(!store
            .save_field_metadata("a", FieldName::PriorityScore, &json!(0.1), t2)
            .await
            .unwrap()
            .is_applied());

        let meta = store.get_field_metadata("a").await.unwrap().unwrap();
        assert_eq!(meta.value(FieldName::PriorityScore), Some(&json!(0.9)));
        assert_eq!(meta.classified_at(FieldName::PriorityScore), Some(t2));

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_concurrent_metadata_writers_keep_newest() {
        let db_path = temp_db_path("metadata_concurrent");
        let store = std::sync::Arc::new(open(&db_path).await);

        let mut handles = Vec::new();
        for ts in [5_i64, 3, 9, 1, 7, 2, 8] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .save_field_metadata("a", FieldName::Size, &json!(format!("v{}", ts)), ts)
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            let _ = h.await.unwrap();
        }

        let meta = store.get_field_metadata("a").await.unwrap().unwrap();
        assert_eq!(meta.classified_at(FieldName::Size), Some(9));
        assert_eq!(meta.value(FieldName::Size), Some(&json!("v9")));

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_provider_state_changed_at() {
        let db_path = temp_db_path("provider_state");
        let store = open(&db_path).await;

        let mut task = test_task("a", "p");
        let s1 = store.save_last_synced_state(&task, 10).await.unwrap();
        assert_eq!((s1.observed_at, s1.changed_at), (10, 10));

        let s2 = store.save_last_synced_state(&task, 20).await.unwrap();
        assert_eq!((s2.observed_at, s2.changed_at), (20, 10));

        task.content = "renamed".into();
        task.refresh_hash();
        let s3 = store.save_last_synced_state(&task, 30).await.unwrap();
        assert_eq!((s3.observed_at, s3.changed_at), (30, 30));
        assert_eq!(s3.payload, json!({"id": "a", "child_order": 1}));

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_apply_snapshot_and_checkpoint() {
        let db_path = temp_db_path("apply_snapshot");
        let store = open(&db_path).await;

        store.save_task(&test_task("old", "p")).await.unwrap();

        let mut snapshot = Snapshot::empty(SyncToken::new("tok1"), true);
        snapshot.tasks = vec![test_task("a", "p"), test_task("b", "q")];
        snapshot.labels = vec![Label { id: "l1".into(), name: "home".into(), color: None, raw: Value::Null }];
        snapshot.deleted_task_ids = vec!["old".into()];

        let result = store.apply_snapshot(&snapshot, 100).await.unwrap();
        assert_eq!(result, ApplyResult { tasks: 2, projects: 0, labels: 1, deleted_tasks: 1 });

        let cp = store.get_checkpoint().await.unwrap().unwrap();
        assert_eq!(cp.token.as_str(), "tok1");
        assert_eq!(cp.updated_at, 100);
        assert_eq!(store.task_ids().await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.list_labels().await.unwrap().len(), 1);

        // Empty incremental still advances the checkpoint
        store.apply_snapshot(&Snapshot::empty(SyncToken::new("tok2"), false), 200).await.unwrap();
        assert_eq!(store.get_checkpoint().await.unwrap().unwrap().token.as_str(), "tok2");

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_list_tasks_query() {
        let db_path = temp_db_path("list_query");
        let store = open(&db_path).await;

        let mut done = test_task("c", "p1");
        done.is_completed = true;
        store
            .save_tasks(&[test_task("a", "p1"), test_task("b", "p2"), done])
            .await
            .unwrap();
        let _ = store.save_field_metadata("a", FieldName::Category, &json!("errand"), 1).await.unwrap();
        let _ = store.save_field_metadata("a", FieldName::TimeEstimateMinutes, &json!(20), 1).await.unwrap();
        let _ = store.save_field_metadata("b", FieldName::Category, &json!("errand"), 1).await.unwrap();

        let open_in_p1 = QueryBuilder::new().project("p1").completed(false).build();
        let ids: Vec<String> = store.list_tasks(&open_in_p1).await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a"]);

        let quick_errands = QueryBuilder::new()
            .meta_eq(FieldName::Category, "errand")
            .meta_range(FieldName::TimeEstimateMinutes, None, Some(30.0))
            .build();
        let ids: Vec<String> = store.list_tasks(&quick_errands).await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a"]);

        let labelled = store.list_tasks(&TaskQuery::label("home")).await.unwrap();
        assert_eq!(labelled.len(), 3);

        cleanup_db(&db_path);
    }

    async fn ids(store: &dyn MirrorStore, query: &TaskQuery) -> Vec<String> {
        store.list_tasks(query).await.unwrap().into_iter().map(|t| t.id).collect()
    }

    #[tokio::test]
    async fn test_queries_agree_with_memory_store() {
        let db_path = temp_db_path("parity");
        let sql = open(&db_path).await;
        let memory = crate::storage::memory::InMemoryStore::new();

        let mut wild = test_task("b", "p1");
        wild.labels = vec!["h_me".into(), "50%".into()];
        let mut odd = test_task("c", "p1");
        odd.labels = vec!["hxme".into(), "500".into()];
        let tasks = [test_task("a", "p1"), wild, odd];

        for store in [&sql as &dyn MirrorStore, &memory] {
            store.save_tasks(&tasks).await.unwrap();
            let _ = store.save_field_metadata("a", FieldName::Size, &json!("m"), 1).await.unwrap();
            let _ = store.save_field_metadata("b", FieldName::Size, &json!(5), 1).await.unwrap();
            let _ = store.save_field_metadata("c", FieldName::Size, &json!("0"), 1).await.unwrap();
        }

        let queries = [
            TaskQuery::meta_range(FieldName::Size, None, Some(10.0)),
            TaskQuery::meta_range(FieldName::Size, None, None),
            TaskQuery::label("h_me"),
            TaskQuery::label("50%"),
            TaskQuery::label("home"),
        ];
        for query in &queries {
            assert_eq!(ids(&sql, query).await, ids(&memory, query).await, "{:?}", query);
        }
        assert_eq!(ids(&sql, &queries[0]).await, vec!["b"]);
        assert_eq!(ids(&sql, &queries[2]).await, vec!["b"]);
        assert_eq!(ids(&sql, &queries[3]).await, vec!["b"]);

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_replace_task_rekeys_metadata() {
        let db_path = temp_db_path("replace");
        let store = open(&db_path).await;

        store.save_task(&test_task("local-1", "p")).await.unwrap();
        let _ = store.save_field_metadata("local-1", FieldName::CanDelegate, &json!(true), 3).await.unwrap();

        store.replace_task("local-1", &test_task("900", "p"), 70).await.unwrap();
        assert!(store.get_task("local-1").await.unwrap().is_none());
        assert!(store.get_task("900").await.unwrap().is_some());
        assert_eq!(store.get_last_synced_state("900").await.unwrap().unwrap().observed_at, 70);
        assert!(store.get_last_synced_state("local-1").await.unwrap().is_none());
        let meta = store.get_field_metadata("900").await.unwrap().unwrap();
        assert_eq!(meta.value(FieldName::CanDelegate), Some(&json!(true)));

        assert!(matches!(
            store.replace_task("local-1", &test_task("901", "p"), 80).await,
            Err(StorageError::NotFound)
        ));

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_sync_mode_setting() {
        let db_path = temp_db_path("mode");
        let store = open(&db_path).await;

        assert_eq!(store.get_sync_mode().await.unwrap(), None);
        store.set_sync_mode(SyncMode::Standalone).await.unwrap();
        assert_eq!(store.get_sync_mode().await.unwrap(), Some(SyncMode::Standalone));
        store.set_sync_mode(SyncMode::Connected).await.unwrap();
        assert_eq!(store.get_sync_mode().await.unwrap(), Some(SyncMode::Connected));

        cleanup_db(&db_path);
    }
}
