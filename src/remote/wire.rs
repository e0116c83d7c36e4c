// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Provider payload mapping.
//!
//! Pure functions between the remote's JSON and the mirror model; no I/O.
//! Two payload families exist:
//!
//! - bulk sync (`/sync/v9/sync`): `items`, `projects`, `labels`, `notes`, each
//!   record carrying an `is_deleted` flag, plus `sync_token` and `full_sync`
//! - REST v2 (`/rest/v2/...`): one task or comment per response
//!
//! Every mapped entity keeps the untouched provider record in `raw`.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

use super::traits::RemoteError;
use crate::model::{Comment, Due, Label, Project, Snapshot, SyncToken, Task, MAX_PRIORITY, MIN_PRIORITY};

/// Token that asks the bulk endpoint for everything.
pub const FULL_SYNC_TOKEN: &str = "*";

/// Resource types requested on every bulk read.
pub const RESOURCE_TYPES: &[&str] = &["items", "projects", "labels", "notes"];

/// Ids arrive as strings on current API versions and as numbers on old ones.
fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {}", other))),
    }
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("invalid id: {}", other))),
    }
}

/// Top-level bulk sync response.
#[derive(Debug, Deserialize)]
pub struct SyncResponse {
    pub sync_token: String,
    #[serde(default)]
    pub full_sync: bool,
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub projects: Vec<Value>,
    #[serde(default)]
    pub labels: Vec<Value>,
    #[serde(default)]
    pub notes: Vec<Value>,
}

#[derive(Deserialize)]
struct WireItem {
    #[serde(deserialize_with = "de_id")]
    id: String,
    content: String,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    project_id: Option<String>,
    #[serde(default = "default_priority")]
    priority: i64,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    due: Option<Due>,
    /// Sync API spelling
    #[serde(default)]
    checked: bool,
    /// REST spelling
    #[serde(default)]
    is_completed: bool,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default, alias = "created_at")]
    added_at: Option<String>,
}

fn default_priority() -> i64 {
    MIN_PRIORITY as i64
}

#[derive(Deserialize)]
struct WireProject {
    #[serde(deserialize_with = "de_id")]
    id: String,
    name: String,
    #[serde(default)]
    color: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    parent_id: Option<String>,
    #[serde(default)]
    is_favorite: bool,
    #[serde(default)]
    is_deleted: bool,
}

#[derive(Deserialize)]
struct WireLabel {
    #[serde(deserialize_with = "de_id")]
    id: String,
    name: String,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    is_deleted: bool,
}

#[derive(Deserialize)]
struct WireComment {
    #[serde(deserialize_with = "de_id")]
    id: String,
    /// `item_id` on the sync API, `task_id` on REST
    #[serde(alias = "item_id", deserialize_with = "de_id")]
    task_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    posted_at: Option<String>,
    #[serde(default)]
    is_deleted: bool,
}

fn decode<T: for<'de> Deserialize<'de>>(kind: &str, value: &Value) -> Result<T, RemoteError> {
    T::deserialize(value).map_err(|e| RemoteError::Protocol(format!("malformed {}: {}", kind, e)))
}

fn clamp_priority(id: &str, priority: i64) -> u8 {
    if priority < MIN_PRIORITY as i64 || priority > MAX_PRIORITY as i64 {
        warn!(task_id = %id, priority, "Priority out of range, clamping");
    }
    priority.clamp(MIN_PRIORITY as i64, MAX_PRIORITY as i64) as u8
}

fn item_to_task(item: WireItem, raw: &Value) -> Task {
    let priority = clamp_priority(&item.id, item.priority);
    let mut task = Task {
        id: item.id,
        content: item.content,
        description: item.description,
        project_id: item.project_id,
        priority,
        labels: item.labels,
        due: item.due,
        is_completed: item.checked || item.is_completed,
        completed_at: item.completed_at,
        created_at: item.added_at,
        content_hash: String::new(),
        raw: raw.clone(),
        comments: Vec::new(),
    };
    task.refresh_hash();
    task
}

/// Map a REST task body.
pub fn task_from_rest(value: &Value) -> Result<Task, RemoteError> {
    let item: WireItem = decode("task", value)?;
    Ok(item_to_task(item, value))
}

/// Map a REST comment body.
pub fn comment_from_rest(value: &Value) -> Result<Comment, RemoteError> {
    let c: WireComment = decode("comment", value)?;
    Ok(Comment {
        id: c.id,
        task_id: c.task_id,
        content: c.content,
        posted_at: c.posted_at,
    })
}

/// Map a bulk sync response into a [`Snapshot`].
///
/// Every live task in the response gets an entry in `comments_by_task_id`,
/// empty when it has no notes, so the comment resolver can tell "no
/// comments" apart from "not in this snapshot".
pub fn snapshot_from_sync(response: SyncResponse) -> Result<Snapshot, RemoteError> {
    if response.sync_token.is_empty() {
        return Err(RemoteError::Protocol("response carries an empty sync_token".into()));
    }

    let mut snapshot = Snapshot::empty(SyncToken::new(response.sync_token), response.full_sync);

    for raw in &response.items {
        let item: WireItem = decode("item", raw)?;
        if item.is_deleted {
            snapshot.deleted_task_ids.push(item.id);
            continue;
        }
        snapshot.comments_by_task_id.entry(item.id.clone()).or_default();
        snapshot.tasks.push(item_to_task(item, raw));
    }

    for raw in &response.projects {
        let p: WireProject = decode("project", raw)?;
        if p.is_deleted {
            snapshot.deleted_project_ids.push(p.id);
            continue;
        }
        snapshot.projects.push(Project {
            id: p.id,
            name: p.name,
            color: p.color,
            parent_id: p.parent_id,
            is_favorite: p.is_favorite,
            raw: raw.clone(),
        });
    }

    for raw in &response.labels {
        let l: WireLabel = decode("label", raw)?;
        if l.is_deleted {
            snapshot.deleted_label_ids.push(l.id);
            continue;
        }
        snapshot.labels.push(Label {
            id: l.id,
            name: l.name,
            color: l.color,
            raw: raw.clone(),
        });
    }

    let mut notes: HashMap<String, Vec<Comment>> = HashMap::new();
    for raw in &response.notes {
        let c: WireComment = decode("note", raw)?;
        if c.is_deleted {
            snapshot.deleted_comment_ids.push(c.id);
            continue;
        }
        notes.entry(c.task_id.clone()).or_default().push(Comment {
            id: c.id,
            task_id: c.task_id,
            content: c.content,
            posted_at: c.posted_at,
        });
    }
    for (task_id, comments) in notes {
        snapshot.comments_by_task_id.entry(task_id).or_default().extend(comments);
    }

    Ok(snapshot)
}

/// Form fields for one bulk read.
pub fn sync_request_form(checkpoint: Option<&SyncToken>) -> Vec<(&'static str, String)> {
    let token = checkpoint
        .map(|t| t.as_str().to_string())
        .unwrap_or_else(|| FULL_SYNC_TOKEN.to_string());
    let resource_types = serde_json::to_string(RESOURCE_TYPES).unwrap_or_else(|_| "[\"all\"]".into());
    vec![("sync_token", token), ("resource_types", resource_types)]
}
