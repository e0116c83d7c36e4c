// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirrored entities and the snapshot bundle.
//!
//! A [`Task`] is the canonical record the mirror keeps for every remote task.
//! Fields the engine does not model are kept verbatim in [`Task::raw`] so a
//! round trip through the mirror never loses provider data.
//!
//! # Example
//!
//! ```
//! use task_sync::Task;
//!
//! let mut task = Task::new("t-1", "Buy milk");
//! task.priority = 4;
//! task.refresh_hash();
//!
//! assert_eq!(task.id, "t-1");
//! assert_eq!(task.content_hash.len(), 64);
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Lowest priority ordinal accepted from the remote.
pub const MIN_PRIORITY: u8 = 1;
/// Highest ("urgent") priority ordinal.
pub const MAX_PRIORITY: u8 = 4;

/// Current wall clock as epoch millis.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Opaque cursor into the remote change stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncToken(String);

impl SyncToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the mirror is attached to a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No remote; the mirror is the only store
    Standalone,
    #[default]
    Connected,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::Connected => "connected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standalone" => Some(Self::Standalone),
            "connected" => Some(Self::Connected),
            _ => None,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Due-date descriptor as the remote reports it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Due {
    /// Calendar date (`YYYY-MM-DD`)
    pub date: String,
    /// Full timestamp when the due has a time component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
    /// Human phrasing ("every monday")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    #[serde(default)]
    pub is_recurring: bool,
}

/// A comment attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub task_id: String,
    pub content: String,
    #[serde(default)]
    pub posted_at: Option<String>,
}

/// Canonical task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable remote id (or `local-<uuid>` for tasks created in standalone mode)
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub project_id: Option<String>,
    /// 1 (normal) to 4 (urgent)
    pub priority: u8,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub due: Option<Due>,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// SHA-256 over the modeled fields, see [`Task::compute_hash`]
    #[serde(default)]
    pub content_hash: String,
    /// Provider payload passthrough
    #[serde(default)]
    pub raw: Value,
    /// Attached by the comment resolver, never persisted with the task row
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,
}

impl Task {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut task = Self {
            id: id.into(),
            content: content.into(),
            description: String::new(),
            project_id: None,
            priority: MIN_PRIORITY,
            labels: Vec::new(),
            due: None,
            is_completed: false,
            completed_at: None,
            created_at: None,
            content_hash: String::new(),
            raw: Value::Null,
            comments: Vec::new(),
        };
        task.refresh_hash();
        task
    }

    /// Hash of the user-visible fields. Label order does not matter.
    pub fn compute_hash(&self) -> String {
        let mut labels = self.labels.clone();
        labels.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.description.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.project_id.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8, self.priority]);
        for label in &labels {
            hasher.update(label.as_bytes());
            hasher.update([0u8]);
        }
        if let Some(due) = &self.due {
            hasher.update(due.date.as_bytes());
            hasher.update(due.datetime.as_deref().unwrap_or("").as_bytes());
            hasher.update([due.is_recurring as u8]);
        }
        hasher.update([self.is_completed as u8]);
        hex::encode(hasher.finalize())
    }

    pub fn refresh_hash(&mut self) {
        self.content_hash = self.compute_hash();
    }

    /// Payload recorded as the last-known remote state.
    pub fn provider_payload(&self) -> Value {
        if self.raw.is_null() {
            serde_json::to_value(self).unwrap_or(Value::Null)
        } else {
            self.raw.clone()
        }
    }

    /// Local-only tasks have never been confirmed by the remote.
    pub fn is_local_only(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// Prefix for ids minted while running without a remote.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Mint an id for a task created in standalone mode.
pub fn local_task_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

/// One consolidated read result from the remote.
///
/// Comments arrive inline, keyed by task id, so a sync never fans out into
/// one request per task.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    pub projects: Vec<Project>,
    pub labels: Vec<Label>,
    pub comments_by_task_id: HashMap<String, Vec<Comment>>,
    pub deleted_task_ids: Vec<String>,
    pub deleted_project_ids: Vec<String>,
    pub deleted_label_ids: Vec<String>,
    /// Comments removed remotely since the previous checkpoint
    pub deleted_comment_ids: Vec<String>,
    /// Successor checkpoint to persist once the snapshot is applied
    pub sync_token: SyncToken,
    pub is_full_sync: bool,
}

impl Snapshot {
    /// An empty incremental snapshot that only advances the checkpoint.
    pub fn empty(sync_token: SyncToken, is_full_sync: bool) -> Self {
        Self {
            sync_token,
            is_full_sync,
            ..Default::default()
        }
    }
}

/// Last remote payload observed for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSyncState {
    pub task_id: String,
    pub payload: Value,
    pub content_hash: String,
    /// When this payload was observed (epoch millis)
    pub observed_at: i64,
    /// When the payload hash last differed from the previous observation
    pub changed_at: i64,
}

/// The single stored sync cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub token: SyncToken,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_label_order() {
        let mut a = Task::new("1", "x");
        a.labels = vec!["home".into(), "errand".into()];
        let mut b = a.clone();
        b.labels = vec!["errand".into(), "home".into()];
        assert_eq!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = Task::new("1", "x");
        let b = Task::new("1", "y");
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_hash_ignores_raw_and_comments() {
        let a = Task::new("1", "x");
        let mut b = a.clone();
        b.raw = serde_json::json!({"child_order": 3});
        b.comments.push(Comment {
            id: "c".into(),
            task_id: "1".into(),
            content: "hi".into(),
            posted_at: None,
        });
        assert_eq!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn test_local_ids() {
        let id = local_task_id();
        assert!(id.starts_with(LOCAL_ID_PREFIX));
        assert!(Task::new(id, "x").is_local_only());
        assert!(!Task::new("123", "x").is_local_only());
    }

    #[test]
    fn test_sync_mode_parse() {
        assert_eq!(SyncMode::parse("standalone"), Some(SyncMode::Standalone));
        assert_eq!(SyncMode::parse(SyncMode::Connected.as_str()), Some(SyncMode::Connected));
        assert_eq!(SyncMode::parse("offline"), None);
        assert_eq!(SyncMode::default(), SyncMode::Connected);
    }

    #[test]
    fn test_sync_token_is_transparent() {
        let token = SyncToken::new("tok1");
        assert_eq!(serde_json::to_string(&token).unwrap(), "\"tok1\"");
        assert_eq!(token.to_string(), "tok1");
    }

    #[test]
    fn test_empty_snapshot_has_default_token() {
        let snapshot = Snapshot::default();
        assert_eq!(snapshot.sync_token, SyncToken::default());
        assert!(snapshot.tasks.is_empty() && snapshot.deleted_comment_ids.is_empty());
        assert!(!snapshot.is_full_sync);

        let advanced = Snapshot::empty(SyncToken::new("tok2"), false);
        assert_eq!(advanced.sync_token.as_str(), "tok2");
    }
}
