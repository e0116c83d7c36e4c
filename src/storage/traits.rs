// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::metadata::{FieldMetadata, FieldName, MetadataWrite};
use crate::model::{Label, Project, ProviderSyncState, Snapshot, SyncCheckpoint, SyncMode, SyncToken, Task};
use super::query::TaskQuery;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Stored data could not be decoded: {0}")]
    Serialization(String),
}

/// Row counts from applying one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyResult {
    pub tasks: usize,
    pub projects: usize,
    pub labels: usize,
    pub deleted_tasks: usize,
}

/// Durable local mirror of remote state.
///
/// Every method that writes more than one row is atomic: it either commits
/// all rows or none.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    // ---- tasks ----
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StorageError>;
    async fn save_task(&self, task: &Task) -> Result<(), StorageError>;
    /// Upsert a batch of tasks in one transaction.
    async fn save_tasks(&self, tasks: &[Task]) -> Result<usize, StorageError>;
    /// Delete a task together with its field metadata and provider state.
    async fn delete_task(&self, id: &str) -> Result<bool, StorageError>;
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StorageError>;
    async fn task_ids(&self) -> Result<Vec<String>, StorageError>;
    /// Upsert a remote-confirmed task and record it as observed, in one transaction.
    async fn import_task(&self, task: &Task, observed_at: i64) -> Result<(), StorageError>;
    /// Swap `old_id` for the remote-confirmed `task` (which carries the new id)
    /// in one transaction: metadata moves across and `task` is recorded as observed.
    async fn replace_task(&self, old_id: &str, task: &Task, observed_at: i64) -> Result<(), StorageError>;

    // ---- projects / labels ----
    async fn get_project(&self, id: &str) -> Result<Option<Project>, StorageError>;
    async fn save_project(&self, project: &Project) -> Result<(), StorageError>;
    async fn delete_project(&self, id: &str) -> Result<bool, StorageError>;
    async fn list_projects(&self) -> Result<Vec<Project>, StorageError>;
    async fn get_label(&self, id: &str) -> Result<Option<Label>, StorageError>;
    async fn save_label(&self, label: &Label) -> Result<(), StorageError>;
    async fn delete_label(&self, id: &str) -> Result<bool, StorageError>;
    async fn list_labels(&self) -> Result<Vec<Label>, StorageError>;

    // ---- field metadata ----
    /// Write one field. Returns [`MetadataWrite::Stale`] (never an error) when
    /// `classified_at` is not newer than the stored timestamp for that field.
    async fn save_field_metadata(
        &self,
        task_id: &str,
        field: FieldName,
        value: &Value,
        classified_at: i64,
    ) -> Result<MetadataWrite, StorageError>;
    async fn get_field_metadata(&self, task_id: &str) -> Result<Option<FieldMetadata>, StorageError>;

    // ---- provider state ----
    async fn get_last_synced_state(&self, task_id: &str) -> Result<Option<ProviderSyncState>, StorageError>;
    /// Overwrite the provider state for `task`, observed at `observed_at`.
    async fn save_last_synced_state(&self, task: &Task, observed_at: i64) -> Result<ProviderSyncState, StorageError>;

    // ---- checkpoint ----
    async fn get_checkpoint(&self) -> Result<Option<SyncCheckpoint>, StorageError>;
    async fn set_checkpoint(&self, token: &SyncToken, updated_at: i64) -> Result<(), StorageError>;

    /// Instant the checkpoint was last replaced.
    async fn get_last_sync_time(&self) -> Result<Option<i64>, StorageError> {
        Ok(self.get_checkpoint().await?.map(|c| c.updated_at))
    }

    // ---- settings ----
    async fn get_sync_mode(&self) -> Result<Option<SyncMode>, StorageError>;
    async fn set_sync_mode(&self, mode: SyncMode) -> Result<(), StorageError>;

    /// Apply a snapshot in one transaction: upsert tasks, projects and labels,
    /// apply remote deletions, overwrite provider state for every task in the
    /// snapshot and persist the snapshot's token as the new checkpoint.
    async fn apply_snapshot(&self, snapshot: &Snapshot, observed_at: i64) -> Result<ApplyResult, StorageError>;
}
