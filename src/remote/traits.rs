// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Comment, Snapshot, SyncToken, Task};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure, 5xx or rate limiting. Retry on the next sync.
    #[error("Remote unavailable: {0}")]
    Unavailable(String),
    /// The remote answered with something we cannot decode.
    #[error("Remote protocol error: {0}")]
    Protocol(String),
    #[error("Remote rejected credentials: {0}")]
    Auth(String),
    #[error("Remote entity not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Protocol(_) => "protocol",
            Self::Auth(_) => "auth",
            Self::NotFound(_) => "not_found",
        }
    }
}

/// Payload for creating a task remotely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

impl NewTask {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Carry an existing task's fields over, e.g. when pushing a local-only task.
    pub fn from_task(task: &Task) -> Self {
        Self {
            content: task.content.clone(),
            description: task.description.clone(),
            project_id: task.project_id.clone(),
            priority: Some(task.priority),
            labels: task.labels.clone(),
            due_string: task.due.as_ref().and_then(|d| d.string.clone()),
            due_date: task.due.as_ref().map(|d| d.date.clone()),
        }
    }
}

/// Partial update; `None` fields are left untouched remotely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_string: Option<String>,
}

impl TaskUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.labels.is_none()
            && self.due_string.is_none()
    }
}

/// Bulk read side of the remote.
///
/// Implementations are pure fetches: they never touch the mirror.
#[async_trait]
pub trait ReadClient: Send + Sync {
    /// `None` requests a full snapshot. A token the remote no longer honors
    /// also yields a full snapshot (`is_full_sync = true`).
    async fn fetch_snapshot(&self, checkpoint: Option<&SyncToken>) -> Result<Snapshot, RemoteError>;

    /// Comments for one task, used for tasks missing from the last snapshot.
    async fn fetch_comments(&self, task_id: &str) -> Result<Vec<Comment>, RemoteError>;
}

/// Single-entity writes. Never retried automatically: a blind retry could
/// duplicate a creation or a comment.
#[async_trait]
pub trait WriteClient: Send + Sync {
    async fn create_task(&self, task: &NewTask) -> Result<Task, RemoteError>;
    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, RemoteError>;
    async fn delete_task(&self, task_id: &str) -> Result<(), RemoteError>;
    async fn complete_task(&self, task_id: &str) -> Result<(), RemoteError>;
    async fn reopen_task(&self, task_id: &str) -> Result<(), RemoteError>;
    async fn add_comment(&self, task_id: &str, content: &str) -> Result<Comment, RemoteError>;
}
