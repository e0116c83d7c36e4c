// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Comment cache resolver.
//!
//! Comments arrive inline with every snapshot. The cache keeps them keyed by
//! task id so that attaching comments to a task set costs no remote calls
//! for tasks the last snapshots covered. Tasks the cache holds no complete
//! list for (e.g. after a restart that resumed from a checkpoint) fall back
//! to a per-task read.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::SyncEngine;
use crate::model::{Comment, Snapshot, Task};
use crate::resilience::retry::{retry_when, RetryConfig};

pub(super) struct CommentCache {
    entries: DashMap<String, Vec<Comment>>,
    /// Set once a full snapshot has been absorbed. Before that, an
    /// incremental snapshot only carries deltas and cannot seed new entries.
    primed: AtomicBool,
}

impl CommentCache {
    pub(super) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            primed: AtomicBool::new(false),
        }
    }

    /// Fold a snapshot in. A full snapshot replaces the cache; an incremental
    /// one merges by comment id and drops deleted comments.
    pub(super) fn absorb(&self, snapshot: &Snapshot) {
        if snapshot.is_full_sync {
            self.entries.clear();
            self.primed.store(true, Ordering::SeqCst);
        }
        for (task_id, comments) in &snapshot.comments_by_task_id {
            self.merge_delta(task_id, comments);
        }
        if !snapshot.deleted_comment_ids.is_empty() {
            let deleted: HashSet<&str> = snapshot.deleted_comment_ids.iter().map(String::as_str).collect();
            for mut entry in self.entries.iter_mut() {
                entry.retain(|c| !deleted.contains(c.id.as_str()));
            }
        }
        for task_id in &snapshot.deleted_task_ids {
            self.entries.remove(task_id);
        }
        crate::metrics::set_comment_cache_entries(self.entries.len());
    }

    /// Merge a task's complete comment list, creating the entry if needed.
    pub(super) fn merge(&self, task_id: &str, comments: &[Comment]) {
        let mut entry = self.entries.entry(task_id.to_string()).or_default();
        Self::upsert(&mut entry, comments);
    }

    /// Merge comments that may be only part of a task's list. An unknown
    /// task gets an entry only once the cache is primed.
    pub(super) fn merge_delta(&self, task_id: &str, comments: &[Comment]) {
        if self.primed.load(Ordering::SeqCst) {
            self.merge(task_id, comments);
        } else if let Some(mut entry) = self.entries.get_mut(task_id) {
            Self::upsert(&mut entry, comments);
        }
    }

    fn upsert(entry: &mut Vec<Comment>, comments: &[Comment]) {
        for comment in comments {
            match entry.iter().position(|c| c.id == comment.id) {
                Some(pos) => entry[pos] = comment.clone(),
                None => entry.push(comment.clone()),
            }
        }
    }

    pub(super) fn get(&self, task_id: &str) -> Option<Vec<Comment>> {
        self.entries.get(task_id).map(|e| e.value().clone())
    }

    pub(super) fn remove(&self, task_id: &str) {
        self.entries.remove(task_id);
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// How a task set's comments were resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    /// Served from snapshot payloads
    pub from_cache: usize,
    /// Fetched individually from the remote
    pub fetched: usize,
    /// Individual fetch failed; the task is returned without comments
    pub failed: usize,
    /// Not cached and no remote to ask (standalone)
    pub skipped: usize,
}

impl ResolveStats {
    /// Remote calls made for this resolution.
    #[must_use]
    pub fn remote_calls(&self) -> usize {
        self.fetched + self.failed
    }
}

#[derive(Debug, Clone)]
pub struct CommentResolution {
    /// Same tasks, same order, comments attached
    pub tasks: Vec<Task>,
    pub stats: ResolveStats,
}

impl SyncEngine {
    /// Attach comments to `tasks`, preferring the snapshot cache.
    ///
    /// Never fails as a whole: a task whose individual fetch fails comes back
    /// with no comments and is counted in [`ResolveStats::failed`].
    pub async fn fetch_comments_for_tasks(&self, tasks: Vec<Task>) -> CommentResolution {
        let mut stats = ResolveStats::default();
        let mut tasks = tasks;
        let mut misses: Vec<String> = Vec::new();

        for task in tasks.iter_mut() {
            match self.comment_cache.get(&task.id) {
                Some(comments) => {
                    task.comments = comments;
                    stats.from_cache += 1;
                }
                None => misses.push(task.id.clone()),
            }
        }
        misses.sort();
        misses.dedup();

        let fetched: HashMap<String, Vec<Comment>> = match (&self.reader, self.is_connected()) {
            (Some(reader), true) if !misses.is_empty() => {
                let concurrency = self.config.comment_fetch_concurrency.max(1);
                let results: Vec<(String, Option<Vec<Comment>>)> = stream::iter(misses)
                    .map(|task_id| {
                        let reader = reader.clone();
                        async move {
                            let result = retry_when(
                                "fetch_comments",
                                &RetryConfig::query(),
                                |e: &crate::remote::traits::RemoteError| e.is_retryable(),
                                || reader.fetch_comments(&task_id),
                            )
                            .await;
                            match result {
                                Ok(comments) => (task_id, Some(comments)),
                                Err(e) => {
                                    warn!(task_id = %task_id, error = %e, "Comment fetch failed");
                                    crate::metrics::record_remote_error("fetch_comments", e.kind());
                                    (task_id, None)
                                }
                            }
                        }
                    })
                    .buffer_unordered(concurrency)
                    .collect()
                    .await;

                let mut map = HashMap::new();
                for (task_id, comments) in results {
                    match comments {
                        Some(comments) => {
                            self.comment_cache.merge(&task_id, &comments);
                            stats.fetched += 1;
                            map.insert(task_id, comments);
                        }
                        None => stats.failed += 1,
                    }
                }
                map
            }
            _ => {
                stats.skipped = misses.len();
                HashMap::new()
            }
        };

        for task in tasks.iter_mut() {
            if let Some(comments) = fetched.get(&task.id) {
                task.comments = comments.clone();
            }
        }

        debug!(
            from_cache = stats.from_cache,
            fetched = stats.fetched,
            failed = stats.failed,
            skipped = stats.skipped,
            "Comments resolved"
        );
        crate::metrics::record_comment_resolution(stats.from_cache, stats.fetched, stats.failed);
        CommentResolution { tasks, stats }
    }

    /// Number of task ids with cached comments.
    #[must_use]
    pub fn comment_cache_len(&self) -> usize {
        self.comment_cache.len()
    }
}
