// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory mirror store.
//!
//! All state lives behind one `RwLock`, so every multi-row write is applied
//! while holding a single write guard and is atomic by construction.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::query::TaskQuery;
use super::traits::{ApplyResult, MirrorStore, StorageError};
use crate::metadata::{FieldMetadata, FieldName, MetadataWrite};
use crate::model::{Label, Project, ProviderSyncState, Snapshot, SyncCheckpoint, SyncMode, SyncToken, Task};

#[derive(Default)]
struct MirrorState {
    tasks: HashMap<String, Task>,
    projects: HashMap<String, Project>,
    labels: HashMap<String, Label>,
    metadata: HashMap<String, FieldMetadata>,
    provider_state: HashMap<String, ProviderSyncState>,
    checkpoint: Option<SyncCheckpoint>,
    mode: Option<SyncMode>,
}

impl MirrorState {
    fn remove_task(&mut self, id: &str) -> bool {
        self.metadata.remove(id);
        self.provider_state.remove(id);
        self.tasks.remove(id).is_some()
    }

    fn observe(&mut self, task: &Task, observed_at: i64) -> ProviderSyncState {
        let changed_at = match self.provider_state.get(&task.id) {
            Some(prev) if prev.content_hash == task.content_hash => prev.changed_at,
            _ => observed_at,
        };
        let state = ProviderSyncState {
            task_id: task.id.clone(),
            payload: task.provider_payload(),
            content_hash: task.content_hash.clone(),
            observed_at,
            changed_at,
        };
        self.provider_state.insert(task.id.clone(), state.clone());
        state
    }
}

fn stored(task: &Task) -> Task {
    let mut task = task.clone();
    task.comments.clear();
    task
}

pub struct InMemoryStore {
    state: RwLock<MirrorState>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MirrorState::default()),
        }
    }

    /// Number of mirrored tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().tasks.is_empty()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MirrorStore for InMemoryStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StorageError> {
        Ok(self.state.read().tasks.get(id).cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        self.state.write().tasks.insert(task.id.clone(), stored(task));
        Ok(())
    }

    async fn save_tasks(&self, tasks: &[Task]) -> Result<usize, StorageError> {
        let mut state = self.state.write();
        for task in tasks {
            state.tasks.insert(task.id.clone(), stored(task));
        }
        Ok(tasks.len())
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.state.write().remove_task(id))
    }

    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StorageError> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| query.matches(t, state.metadata.get(&t.id)))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn task_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self.state.read().tasks.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn import_task(&self, task: &Task, observed_at: i64) -> Result<(), StorageError> {
        let mut state = self.state.write();
        state.tasks.insert(task.id.clone(), stored(task));
        state.observe(task, observed_at);
        Ok(())
    }

    async fn replace_task(&self, old_id: &str, task: &Task, observed_at: i64) -> Result<(), StorageError> {
        let mut state = self.state.write();
        if !state.tasks.contains_key(old_id) {
            return Err(StorageError::NotFound);
        }
        state.tasks.remove(old_id);
        state.provider_state.remove(old_id);
        if let Some(mut meta) = state.metadata.remove(old_id) {
            meta.task_id = task.id.clone();
            state.metadata.insert(task.id.clone(), meta);
        }
        state.tasks.insert(task.id.clone(), stored(task));
        state.observe(task, observed_at);
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, StorageError> {
        Ok(self.state.read().projects.get(id).cloned())
    }

    async fn save_project(&self, project: &Project) -> Result<(), StorageError> {
        self.state.write().projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn delete_project(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.state.write().projects.remove(id).is_some())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StorageError> {
        let mut projects: Vec<Project> = self.state.read().projects.values().cloned().collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn get_label(&self, id: &str) -> Result<Option<Label>, StorageError> {
        Ok(self.state.read().labels.get(id).cloned())
    }

    async fn save_label(&self, label: &Label) -> Result<(), StorageError> {
        self.state.write().labels.insert(label.id.clone(), label.clone());
        Ok(())
    }

    async fn delete_label(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.state.write().labels.remove(id).is_some())
    }

    async fn list_labels(&self) -> Result<Vec<Label>, StorageError> {
        let mut labels: Vec<Label> = self.state.read().labels.values().cloned().collect();
        labels.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(labels)
    }

    async fn save_field_metadata(
        &self,
        task_id: &str,
        field: FieldName,
        value: &Value,
        classified_at: i64,
    ) -> Result<MetadataWrite, StorageError> {
        let mut state = self.state.write();
        let meta = state
            .metadata
            .entry(task_id.to_string())
            .or_insert_with(|| FieldMetadata::new(task_id));
        Ok(meta.apply(field, value.clone(), classified_at))
    }

    async fn get_field_metadata(&self, task_id: &str) -> Result<Option<FieldMetadata>, StorageError> {
        Ok(self.state.read().metadata.get(task_id).cloned())
    }

    async fn get_last_synced_state(&self, task_id: &str) -> Result<Option<ProviderSyncState>, StorageError> {
        Ok(self.state.read().provider_state.get(task_id).cloned())
    }

    async fn save_last_synced_state(&self, task: &Task, observed_at: i64) -> Result<ProviderSyncState, StorageError> {
        Ok(self.state.write().observe(task, observed_at))
    }

    async fn get_checkpoint(&self) -> Result<Option<SyncCheckpoint>, StorageError> {
        Ok(self.state.read().checkpoint.clone())
    }

    async fn set_checkpoint(&self, token: &SyncToken, updated_at: i64) -> Result<(), StorageError> {
        self.state.write().checkpoint = Some(SyncCheckpoint {
            token: token.clone(),
            updated_at,
        });
        Ok(())
    }

    async fn get_sync_mode(&self) -> Result<Option<SyncMode>, StorageError> {
        Ok(self.state.read().mode)
    }

    async fn set_sync_mode(&self, mode: SyncMode) -> Result<(), StorageError> {
        self.state.write().mode = Some(mode);
        Ok(())
    }

    async fn apply_snapshot(&self, snapshot: &Snapshot, observed_at: i64) -> Result<ApplyResult, StorageError> {
        let mut state = self.state.write();
        let mut result = ApplyResult::default();

        for task in &snapshot.tasks {
            state.tasks.insert(task.id.clone(), stored(task));
            state.observe(task, observed_at);
            result.tasks += 1;
        }
        for project in &snapshot.projects {
            state.projects.insert(project.id.clone(), project.clone());
            result.projects += 1;
        }
        for label in &snapshot.labels {
            state.labels.insert(label.id.clone(), label.clone());
            result.labels += 1;
        }
        for id in &snapshot.deleted_task_ids {
            if state.remove_task(id) {
                result.deleted_tasks += 1;
            }
        }
        for id in &snapshot.deleted_project_ids {
            state.projects.remove(id);
        }
        for id in &snapshot.deleted_label_ids {
            state.labels.remove(id);
        }
        state.checkpoint = Some(SyncCheckpoint {
            token: snapshot.sync_token.clone(),
            updated_at: observed_at,
        });

        Ok(result)
    }
}
