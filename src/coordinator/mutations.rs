// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-mutation callbacks.
//!
//! Connected: the remote write goes first, then the mirror is updated
//! optimistically from the confirmed result. A failed remote write leaves
//! the mirror untouched. Standalone: only the mirror changes.
//!
//! None of these take the sync lock; the next snapshot overwrites whatever
//! the optimistic update wrote.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::SyncEngine;
use crate::error::SyncError;
use crate::model::{local_task_id, now_millis, Comment, Due, Task, MAX_PRIORITY, MIN_PRIORITY};
use crate::remote::traits::{NewTask, RemoteError, TaskUpdate, WriteClient};

/// Run one remote write and count its outcome. Never retried.
async fn tracked<T>(
    operation: &'static str,
    write: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, SyncError> {
    match write.await {
        Ok(value) => {
            crate::metrics::record_write(operation, "success");
            Ok(value)
        }
        Err(e) => {
            crate::metrics::record_write(operation, "failure");
            crate::metrics::record_remote_error(operation, e.kind());
            warn!(operation, error = %e, "Remote write failed");
            Err(e.into())
        }
    }
}

fn apply_update(task: &mut Task, update: &TaskUpdate) {
    if let Some(content) = &update.content {
        task.content = content.clone();
    }
    if let Some(description) = &update.description {
        task.description = description.clone();
    }
    if let Some(priority) = update.priority {
        task.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
    }
    if let Some(labels) = &update.labels {
        task.labels = labels.clone();
    }
    if let Some(due) = &update.due_string {
        task.due.get_or_insert_with(Due::default).string = Some(due.clone());
    }
    task.refresh_hash();
}

fn local_task(new: &NewTask) -> Task {
    let mut task = Task::new(local_task_id(), new.content.clone());
    task.description = new.description.clone();
    task.project_id = new.project_id.clone();
    task.priority = new.priority.unwrap_or(MIN_PRIORITY).clamp(MIN_PRIORITY, MAX_PRIORITY);
    task.labels = new.labels.clone();
    if new.due_date.is_some() || new.due_string.is_some() {
        task.due = Some(Due {
            date: new.due_date.clone().unwrap_or_default(),
            string: new.due_string.clone(),
            ..Default::default()
        });
    }
    task.refresh_hash();
    task
}

impl SyncEngine {
    /// Writer to use, or `None` when mutations should stay local.
    fn connected_writer(&self) -> Option<Arc<dyn WriteClient>> {
        if self.is_connected() {
            self.writer.clone()
        } else {
            None
        }
    }

    async fn existing_task(&self, task_id: &str) -> Result<Task, SyncError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SyncError::UnknownTask(task_id.to_string()))
    }

    /// Create a task. Returns the mirrored record (remote id when connected,
    /// `local-<uuid>` when standalone).
    pub async fn create_task(&self, new: &NewTask) -> Result<Task, SyncError> {
        let task = match self.connected_writer() {
            Some(writer) => {
                let task = tracked("create_task", writer.create_task(new)).await?;
                self.store.import_task(&task, now_millis()).await?;
                task
            }
            None => {
                let task = local_task(new);
                self.store.save_task(&task).await?;
                task
            }
        };
        info!(task_id = %task.id, "Task created");
        Ok(task)
    }

    pub async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, SyncError> {
        if update.is_empty() {
            return self.existing_task(task_id).await;
        }
        match self.connected_writer() {
            Some(writer) => {
                let task = tracked("update_task", writer.update_task(task_id, update)).await?;
                self.store.import_task(&task, now_millis()).await?;
                Ok(task)
            }
            None => {
                let mut task = self.existing_task(task_id).await?;
                apply_update(&mut task, update);
                self.store.save_task(&task).await?;
                Ok(task)
            }
        }
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<(), SyncError> {
        self.set_completed(task_id, true).await
    }

    pub async fn reopen_task(&self, task_id: &str) -> Result<(), SyncError> {
        self.set_completed(task_id, false).await
    }

    async fn set_completed(&self, task_id: &str, completed: bool) -> Result<(), SyncError> {
        if let Some(writer) = self.connected_writer() {
            if completed {
                tracked("complete_task", writer.complete_task(task_id)).await?;
            } else {
                tracked("reopen_task", writer.reopen_task(task_id)).await?;
            }
            // Remote confirmed; the mirror may not have the task yet
            let Some(mut task) = self.store.get_task(task_id).await? else {
                debug!(task_id, "Task not mirrored yet, next sync brings it in");
                return Ok(());
            };
            task.is_completed = completed;
            task.refresh_hash();
            self.store.save_task(&task).await?;
            return Ok(());
        }

        let mut task = self.existing_task(task_id).await?;
        task.is_completed = completed;
        if !completed {
            task.completed_at = None;
        }
        task.refresh_hash();
        self.store.save_task(&task).await?;
        Ok(())
    }

    /// Delete a task remotely (when connected) and from the mirror, together
    /// with its metadata and cached comments.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), SyncError> {
        let connected = match self.connected_writer() {
            Some(writer) => {
                tracked("delete_task", writer.delete_task(task_id)).await?;
                true
            }
            None => false,
        };

        let removed = self.store.delete_task(task_id).await?;
        self.comment_cache.remove(task_id);
        if !removed && !connected {
            return Err(SyncError::UnknownTask(task_id.to_string()));
        }
        info!(task_id, "Task deleted");
        Ok(())
    }

    /// Add a comment remotely and into the comment cache. Comments are not
    /// stored in the mirror, so standalone mode cannot accept them.
    pub async fn add_comment(&self, task_id: &str, content: &str) -> Result<Comment, SyncError> {
        let writer = self.connected_writer().ok_or(SyncError::Standalone)?;
        let comment = tracked("add_comment", writer.add_comment(task_id, content)).await?;
        self.comment_cache.merge_delta(task_id, std::slice::from_ref(&comment));
        Ok(comment)
    }
}
