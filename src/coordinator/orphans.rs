// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Orphan detection and merge decisions.
//!
//! An orphan is a task id present in exactly one of {mirror, remote}. Scans
//! are derived from current state every time; decisions are not persisted.
//! An ignored remote-only task therefore shows up again on the next scan
//! until it is imported or deleted upstream.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::SyncEngine;
use crate::error::SyncError;
use crate::model::{now_millis, Task};
use crate::remote::traits::NewTask;

/// Remote task set captured by the last scan.
pub(super) struct RemoteScan {
    pub(super) tasks: HashMap<String, Task>,
}

impl RemoteScan {
    fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrphanReport {
    /// In the mirror, absent remotely (sorted by id)
    pub local_only: Vec<Task>,
    /// Remote, absent from the mirror (sorted by id)
    pub remote_only: Vec<Task>,
    pub requires_user_decision: bool,
}

impl OrphanReport {
    pub fn new(local_only: Vec<Task>, remote_only: Vec<Task>) -> Self {
        let requires_user_decision = !local_only.is_empty() || !remote_only.is_empty();
        Self {
            local_only,
            remote_only,
            requires_user_decision,
        }
    }

    pub fn local_only_ids(&self) -> Vec<&str> {
        self.local_only.iter().map(|t| t.id.as_str()).collect()
    }

    pub fn remote_only_ids(&self) -> Vec<&str> {
        self.remote_only.iter().map(|t| t.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    /// Upsert the remote task into the mirror, no remote write
    ImportToLocal,
    /// Create the mirror task remotely, then re-key it to the remote id
    PushToRemote,
    Ignore,
}

impl MergeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImportToLocal => "import_to_local",
            Self::PushToRemote => "push_to_remote",
            Self::Ignore => "ignore",
        }
    }
}

/// Operator decision for one orphan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub task_id: String,
    pub action: MergeAction,
}

impl MergeDecision {
    pub fn new(task_id: impl Into<String>, action: MergeAction) -> Self {
        Self {
            task_id: task_id.into(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionResult {
    Imported,
    Pushed { remote_id: String },
    Ignored,
    Failed { error: String },
}

impl DecisionResult {
    fn outcome(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "failed",
            Self::Ignored => "ignored",
            _ => "applied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub task_id: String,
    pub action: MergeAction,
    pub result: DecisionResult,
}

impl DecisionOutcome {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.result, DecisionResult::Failed { .. })
    }
}

impl SyncEngine {
    /// Compare the remote task-id set against the mirror's.
    ///
    /// Performs one full remote read. Neither the mirror nor the checkpoint
    /// is touched.
    pub async fn detect_orphans(&self) -> Result<OrphanReport, SyncError> {
        let reader = self.require_reader()?;
        let snapshot = reader.fetch_snapshot(None).await?;
        let scan = RemoteScan::new(snapshot.tasks);

        let local_ids: HashSet<String> = self.store.task_ids().await?.into_iter().collect();

        let mut local_only_ids: Vec<&String> = local_ids.iter().filter(|id| !scan.tasks.contains_key(*id)).collect();
        local_only_ids.sort();
        let mut local_only = Vec::with_capacity(local_only_ids.len());
        for id in local_only_ids {
            if let Some(task) = self.store.get_task(id).await? {
                local_only.push(task);
            }
        }

        let mut remote_only: Vec<Task> = scan
            .tasks
            .values()
            .filter(|t| !local_ids.contains(&t.id))
            .cloned()
            .collect();
        remote_only.sort_by(|a, b| a.id.cmp(&b.id));

        *self.last_scan.write() = Some(scan);

        crate::metrics::record_orphans(local_only.len(), remote_only.len());
        let report = OrphanReport::new(local_only, remote_only);
        info!(
            local_only = report.local_only.len(),
            remote_only = report.remote_only.len(),
            "Orphan scan complete"
        );
        Ok(report)
    }

    /// Apply operator decisions.
    ///
    /// Waits for the sync lock so no cycle interleaves. Each decision is
    /// applied on its own; a failure is reported in its outcome and does not
    /// stop the rest.
    pub async fn apply_merge_decisions(&self, decisions: &[MergeDecision]) -> Vec<DecisionOutcome> {
        let _guard = self.sync_lock.lock().await;
        let mut outcomes = Vec::with_capacity(decisions.len());

        for decision in decisions {
            let result = match decision.action {
                MergeAction::ImportToLocal => self.import_to_local(&decision.task_id).await,
                MergeAction::PushToRemote => self.push_to_remote(&decision.task_id).await,
                MergeAction::Ignore => Ok(DecisionResult::Ignored),
            };
            let result = result.unwrap_or_else(|e| {
                warn!(task_id = %decision.task_id, action = decision.action.as_str(), error = %e, "Merge decision failed");
                DecisionResult::Failed { error: e.to_string() }
            });

            crate::metrics::record_merge_decision(decision.action.as_str(), result.outcome());
            outcomes.push(DecisionOutcome {
                task_id: decision.task_id.clone(),
                action: decision.action,
                result,
            });
        }
        outcomes
    }

    async fn remote_task(&self, task_id: &str) -> Result<Option<Task>, SyncError> {
        let cached = self
            .last_scan
            .read()
            .as_ref()
            .and_then(|scan| scan.tasks.get(task_id).cloned());
        if cached.is_some() {
            return Ok(cached);
        }

        let reader = self.require_reader()?;
        let snapshot = reader.fetch_snapshot(None).await?;
        let scan = RemoteScan::new(snapshot.tasks);
        let found = scan.tasks.get(task_id).cloned();
        *self.last_scan.write() = Some(scan);
        Ok(found)
    }

    async fn import_to_local(&self, task_id: &str) -> Result<DecisionResult, SyncError> {
        let task = self
            .remote_task(task_id)
            .await?
            .ok_or_else(|| SyncError::UnknownTask(task_id.to_string()))?;
        self.store.import_task(&task, now_millis()).await?;
        info!(task_id, "Imported remote task");
        Ok(DecisionResult::Imported)
    }

    async fn push_to_remote(&self, task_id: &str) -> Result<DecisionResult, SyncError> {
        let writer = self.require_writer()?;
        let local = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SyncError::UnknownTask(task_id.to_string()))?;

        let mut confirmed = writer.create_task(&NewTask::from_task(&local)).await.map_err(|e| {
            crate::metrics::record_write("create_task", "failure");
            e
        })?;
        crate::metrics::record_write("create_task", "success");

        if local.is_completed && !confirmed.is_completed {
            // Creation always yields an open task remotely
            match writer.complete_task(&confirmed.id).await {
                Ok(()) => {
                    crate::metrics::record_write("complete_task", "success");
                    confirmed.is_completed = true;
                    confirmed.completed_at = local.completed_at.clone();
                    confirmed.refresh_hash();
                }
                Err(e) => {
                    crate::metrics::record_write("complete_task", "failure");
                    warn!(task_id, remote_id = %confirmed.id, error = %e, "Pushed task is still open remotely");
                }
            }
        }

        if let Err(e) = self.store.replace_task(task_id, &confirmed, now_millis()).await {
            // The remote copy exists now; the next scan shows both sides
            warn!(task_id, remote_id = %confirmed.id, error = %e, "Pushed task but could not re-key mirror");
            return Err(e.into());
        }
        if let Some(scan) = self.last_scan.write().as_mut() {
            scan.tasks.insert(confirmed.id.clone(), confirmed.clone());
        }

        info!(task_id, remote_id = %confirmed.id, "Pushed local task");
        Ok(DecisionResult::Pushed { remote_id: confirmed.id })
    }
}
