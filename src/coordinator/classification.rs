// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Classification seam and freshness tracking.
//!
//! The engine never computes categories or estimates itself. It asks a
//! [`Classifier`] for them and persists the outputs as field metadata, one
//! forward-only timestamp per field. A task needs (re)classification when a
//! field was never written or the remote payload changed after it was.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::SyncEngine;
use crate::error::SyncError;
use crate::metadata::{Classification, FieldMetadata, FieldName, MetadataWrite, TimeEstimate};
use crate::model::{now_millis, Label, Task};
use crate::storage::query::TaskQuery;

/// Past classifications handed to the classifier as context.
const HISTORY_LIMIT: usize = 50;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),
    #[error("Classifier returned an unusable result: {0}")]
    InvalidOutput(String),
}

/// External classification collaborator.
///
/// `history` holds metadata of previously classified tasks; the engine only
/// supplies it and stores what comes back.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        task: &Task,
        history: &[FieldMetadata],
        labels: &[Label],
    ) -> Result<Classification, ClassifierError>;

    async fn estimate_time(
        &self,
        task: &Task,
        category_history: &[FieldMetadata],
    ) -> Result<TimeEstimate, ClassifierError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyReport {
    pub classified: usize,
    pub estimated: usize,
    /// Writes dropped because a newer result had already landed
    pub stale: usize,
    pub failed: usize,
}

impl SyncEngine {
    /// Write one metadata field. A stale write is dropped, not an error.
    pub async fn save_field(
        &self,
        task_id: &str,
        field: FieldName,
        value: &Value,
        classified_at: i64,
    ) -> Result<MetadataWrite, SyncError> {
        let write = self.store.save_field_metadata(task_id, field, value, classified_at).await?;
        if let MetadataWrite::Stale { stored_at } = write {
            debug!(task_id, field = field.as_str(), classified_at, stored_at, "Dropped stale field write");
            crate::metrics::record_stale_write(field.as_str());
        }
        Ok(write)
    }

    async fn save_fields(
        &self,
        task_id: &str,
        fields: Vec<(FieldName, Value)>,
        classified_at: i64,
    ) -> Result<bool, SyncError> {
        if self.store.get_task(task_id).await?.is_none() {
            return Err(SyncError::UnknownTask(task_id.to_string()));
        }
        let mut all_applied = true;
        for (field, value) in fields {
            all_applied &= self.save_field(task_id, field, &value, classified_at).await?.is_applied();
        }
        Ok(all_applied)
    }

    /// Persist a classifier result. Returns `false` if any field was stale.
    pub async fn record_classification(
        &self,
        task_id: &str,
        classification: Classification,
        classified_at: i64,
    ) -> Result<bool, SyncError> {
        self.save_fields(task_id, classification.into_fields(), classified_at).await
    }

    pub async fn record_time_estimate(
        &self,
        task_id: &str,
        estimate: TimeEstimate,
        classified_at: i64,
    ) -> Result<bool, SyncError> {
        self.save_fields(task_id, estimate.into_fields(), classified_at).await
    }

    /// Persist a priority score computed outside the engine.
    pub async fn record_priority_score(
        &self,
        task_id: &str,
        score: f64,
        classified_at: i64,
    ) -> Result<bool, SyncError> {
        self.save_fields(task_id, vec![(FieldName::PriorityScore, Value::from(score))], classified_at)
            .await
    }

    /// Whether `field` was never written for the task, or written before the
    /// remote payload last changed.
    pub async fn needs_classification(&self, task_id: &str, field: FieldName) -> Result<bool, SyncError> {
        let classified_at = self
            .store
            .get_field_metadata(task_id)
            .await?
            .and_then(|m| m.classified_at(field));
        let Some(classified_at) = classified_at else {
            return Ok(true);
        };
        let changed_at = self.store.get_last_synced_state(task_id).await?.map(|s| s.changed_at);
        Ok(changed_at.is_some_and(|changed| classified_at < changed))
    }

    /// Open tasks whose `field` needs (re)classification, sorted by id.
    pub async fn tasks_needing_classification(&self, field: FieldName) -> Result<Vec<Task>, SyncError> {
        let mut pending = Vec::new();
        for task in self.store.list_tasks(&TaskQuery::completed(false)).await? {
            if self.needs_classification(&task.id, field).await? {
                pending.push(task);
            }
        }
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pending)
    }

    async fn classification_history(&self, query: &TaskQuery) -> Result<Vec<FieldMetadata>, SyncError> {
        let mut history = Vec::new();
        for task in self.store.list_tasks(query).await? {
            if history.len() >= HISTORY_LIMIT {
                break;
            }
            if let Some(meta) = self.store.get_field_metadata(&task.id).await? {
                history.push(meta);
            }
        }
        Ok(history)
    }

    /// Run `classifier` over up to `limit` tasks that need a category.
    ///
    /// A classifier failure skips that task; storage errors abort the run.
    pub async fn classify_pending(&self, classifier: &dyn Classifier, limit: usize) -> Result<ClassifyReport, SyncError> {
        let mut report = ClassifyReport::default();
        let pending = self.tasks_needing_classification(FieldName::Category).await?;
        if pending.is_empty() {
            return Ok(report);
        }

        let labels = self.store.list_labels().await?;
        let history = self
            .classification_history(&TaskQuery::meta_present(FieldName::Category))
            .await?;

        for task in pending.into_iter().take(limit) {
            // Stamp before the call: a change landing mid-classification must stay visible
            let classified_at = now_millis();

            let classification = match classifier.classify(&task, &history, &labels).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Classification failed");
                    report.failed += 1;
                    continue;
                }
            };
            let category = classification.category.clone();
            if self.record_classification(&task.id, classification, classified_at).await? {
                report.classified += 1;
            } else {
                report.stale += 1;
            }

            let category_history = self
                .classification_history(&TaskQuery::meta_eq(FieldName::Category, category))
                .await?;
            match classifier.estimate_time(&task, &category_history).await {
                Ok(estimate) => {
                    if self.record_time_estimate(&task.id, estimate, classified_at).await? {
                        report.estimated += 1;
                    } else {
                        report.stale += 1;
                    }
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Time estimate failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            classified = report.classified,
            estimated = report.estimated,
            stale = report.stale,
            failed = report.failed,
            "Classification pass complete"
        );
        Ok(report)
    }
}
