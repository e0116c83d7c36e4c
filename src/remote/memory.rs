// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process remote.
//!
//! Keeps a versioned copy of remote state and answers bulk reads from it the
//! way the real provider does: `None` returns everything, a known token
//! returns only what changed since, and an expired token falls back to a
//! full snapshot. Tokens are `v<version>`.
//!
//! Call counters, failure injection and a snapshot gate let tests observe
//! round trips and hold a sync mid-fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::traits::{NewTask, ReadClient, RemoteError, TaskUpdate, WriteClient};
use crate::model::{Comment, Due, Label, Project, Snapshot, SyncToken, Task};

#[derive(Default)]
struct RemoteState {
    version: u64,
    /// Tokens older than this are treated as expired
    min_valid: u64,
    next_id: u64,
    tasks: HashMap<String, (Task, u64)>,
    tombstones: HashMap<String, u64>,
    projects: HashMap<String, (Project, u64)>,
    labels: HashMap<String, (Label, u64)>,
    comments: HashMap<String, Vec<Comment>>,
    comment_tombstones: HashMap<String, u64>,
}

impl RemoteState {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn mint_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }

    fn touch_task(&mut self, id: &str) {
        let v = self.bump();
        if let Some(entry) = self.tasks.get_mut(id) {
            entry.0.refresh_hash();
            entry.1 = v;
        }
    }

    fn token_version(&self, token: &SyncToken) -> Option<u64> {
        let v: u64 = token.as_str().strip_prefix('v')?.parse().ok()?;
        (v >= self.min_valid && v <= self.version).then_some(v)
    }

    fn snapshot_since(&self, since: Option<u64>) -> Snapshot {
        let after = since.unwrap_or(0);
        let full = since.is_none();
        let mut snapshot = Snapshot::empty(SyncToken::new(format!("v{}", self.version)), full);

        for (id, (task, v)) in &self.tasks {
            if full || *v > after {
                snapshot.tasks.push(task.clone());
                snapshot
                    .comments_by_task_id
                    .insert(id.clone(), self.comments.get(id).cloned().unwrap_or_default());
            }
        }
        if !full {
            for (id, v) in &self.tombstones {
                if *v > after {
                    snapshot.deleted_task_ids.push(id.clone());
                }
            }
            for (id, v) in &self.comment_tombstones {
                if *v > after {
                    snapshot.deleted_comment_ids.push(id.clone());
                }
            }
        }
        for (project, v) in self.projects.values() {
            if full || *v > after {
                snapshot.projects.push(project.clone());
            }
        }
        for (label, v) in self.labels.values() {
            if full || *v > after {
                snapshot.labels.push(label.clone());
            }
        }
        snapshot.tasks.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }
}

#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    snapshot_calls: AtomicUsize,
    comment_calls: AtomicUsize,
    write_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    snapshot_failure: Mutex<Option<RemoteError>>,
    write_failure: Mutex<Option<RemoteError>>,
    comment_failures: Mutex<HashMap<String, RemoteError>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- seeding ----

    /// Insert or replace a task as if it changed remotely.
    pub fn put_task(&self, mut task: Task) {
        task.comments.clear();
        task.refresh_hash();
        let mut state = self.state.lock();
        let v = state.bump();
        state.tombstones.remove(&task.id);
        state.tasks.insert(task.id.clone(), (task, v));
    }

    /// Delete a task remotely, leaving a tombstone for incremental reads.
    pub fn remove_task(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        if state.tasks.remove(id).is_none() {
            return false;
        }
        state.comments.remove(id);
        let v = state.bump();
        state.tombstones.insert(id.to_string(), v);
        true
    }

    pub fn put_project(&self, project: Project) {
        let mut state = self.state.lock();
        let v = state.bump();
        state.projects.insert(project.id.clone(), (project, v));
    }

    pub fn put_label(&self, label: Label) {
        let mut state = self.state.lock();
        let v = state.bump();
        state.labels.insert(label.id.clone(), (label, v));
    }

    pub fn put_comment(&self, comment: Comment) {
        let mut state = self.state.lock();
        let task_id = comment.task_id.clone();
        state.comments.entry(task_id.clone()).or_default().push(comment);
        state.touch_task(&task_id);
    }

    /// Delete a comment remotely. The owning task shows up in the next
    /// incremental read alongside the comment tombstone.
    pub fn remove_comment(&self, comment_id: &str) -> bool {
        let mut state = self.state.lock();
        let owner = state.comments.iter_mut().find_map(|(task_id, comments)| {
            let before = comments.len();
            comments.retain(|c| c.id != comment_id);
            (comments.len() != before).then(|| task_id.clone())
        });
        let Some(task_id) = owner else {
            return false;
        };
        state.touch_task(&task_id);
        let v = state.version;
        state.comment_tombstones.insert(comment_id.to_string(), v);
        true
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.state.lock().tasks.get(id).map(|(t, _)| t.clone())
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current head token.
    pub fn head_token(&self) -> SyncToken {
        SyncToken::new(format!("v{}", self.state.lock().version))
    }

    /// Invalidate every token issued so far.
    pub fn expire_tokens(&self) {
        let mut state = self.state.lock();
        state.min_valid = state.version + 1;
    }

    // ---- failure injection ----

    pub fn fail_snapshots(&self, error: Option<RemoteError>) {
        *self.snapshot_failure.lock() = error;
    }

    pub fn fail_writes(&self, error: Option<RemoteError>) {
        *self.write_failure.lock() = error;
    }

    pub fn fail_comments_for(&self, task_id: &str, error: RemoteError) {
        self.comment_failures.lock().insert(task_id.to_string(), error);
    }

    // ---- gate ----

    /// Block every snapshot fetch until [`release_snapshot`](Self::release_snapshot).
    pub fn hold_snapshots(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one held fetch through.
    pub fn release_snapshot(&self) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(1);
        }
    }

    /// Remove the gate and let every waiting fetch through.
    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.close();
        }
    }

    // ---- counters ----

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn comment_calls(&self) -> usize {
        self.comment_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent snapshot fetches observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<(), RemoteError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        match self.write_failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn with_task<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Result<R, RemoteError> {
        let mut state = self.state.lock();
        let result = match state.tasks.get_mut(id) {
            Some((task, _)) => f(task),
            None => return Err(RemoteError::NotFound(format!("task {}", id))),
        };
        state.touch_task(id);
        Ok(result)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReadClient for InMemoryRemote {
    async fn fetch_snapshot(&self, checkpoint: Option<&SyncToken>) -> Result<Snapshot, RemoteError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if let Some(e) = self.snapshot_failure.lock().clone() {
            return Err(e);
        }

        let state = self.state.lock();
        let since = checkpoint.and_then(|t| state.token_version(t));
        Ok(state.snapshot_since(since))
    }

    async fn fetch_comments(&self, task_id: &str) -> Result<Vec<Comment>, RemoteError> {
        self.comment_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.comment_failures.lock().get(task_id).cloned() {
            return Err(e);
        }
        let state = self.state.lock();
        if !state.tasks.contains_key(task_id) {
            return Err(RemoteError::NotFound(format!("task {}", task_id)));
        }
        Ok(state.comments.get(task_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl WriteClient for InMemoryRemote {
    async fn create_task(&self, new: &NewTask) -> Result<Task, RemoteError> {
        self.check_write()?;
        let mut state = self.state.lock();
        let id = state.mint_id("r");
        let mut task = Task::new(id.clone(), new.content.clone());
        task.description = new.description.clone();
        task.project_id = new.project_id.clone();
        task.priority = new.priority.unwrap_or(task.priority);
        task.labels = new.labels.clone();
        task.due = new.due_date.as_ref().map(|date| Due {
            date: date.clone(),
            string: new.due_string.clone(),
            ..Default::default()
        });
        task.refresh_hash();
        let v = state.bump();
        state.tasks.insert(id, (task.clone(), v));
        Ok(task)
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, RemoteError> {
        self.check_write()?;
        self.with_task(task_id, |task| {
            if let Some(content) = &update.content {
                task.content = content.clone();
            }
            if let Some(description) = &update.description {
                task.description = description.clone();
            }
            if let Some(priority) = update.priority {
                task.priority = priority;
            }
            if let Some(labels) = &update.labels {
                task.labels = labels.clone();
            }
            if let Some(due) = &update.due_string {
                task.due = Some(Due {
                    date: due.clone(),
                    string: Some(due.clone()),
                    ..Default::default()
                });
            }
            task.refresh_hash();
            task.clone()
        })
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), RemoteError> {
        self.check_write()?;
        if self.remove_task(task_id) {
            Ok(())
        } else {
            Err(RemoteError::NotFound(format!("task {}", task_id)))
        }
    }

    async fn complete_task(&self, task_id: &str) -> Result<(), RemoteError> {
        self.check_write()?;
        self.with_task(task_id, |task| task.is_completed = true)
    }

    async fn reopen_task(&self, task_id: &str) -> Result<(), RemoteError> {
        self.check_write()?;
        self.with_task(task_id, |task| {
            task.is_completed = false;
            task.completed_at = None;
        })
    }

    async fn add_comment(&self, task_id: &str, content: &str) -> Result<Comment, RemoteError> {
        self.check_write()?;
        let mut state = self.state.lock();
        if !state.tasks.contains_key(task_id) {
            return Err(RemoteError::NotFound(format!("task {}", task_id)));
        }
        let comment = Comment {
            id: state.mint_id("c"),
            task_id: task_id.to_string(),
            content: content.to_string(),
            posted_at: None,
        };
        state.comments.entry(task_id.to_string()).or_default().push(comment.clone());
        state.touch_task(task_id);
        Ok(comment)
    }
}
