// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The sync cycle.
//!
//! A cycle runs in its own spawned task that owns the sync lock guard. A
//! caller that stops waiting (timeout, dropped future) only loses the report:
//! the cycle still commits its transaction fully or not at all and then
//! releases the lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{watch, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::comments::CommentCache;
use super::{SyncEngine, SyncHealth, SyncReport, SyncState};
use crate::error::SyncError;
use crate::model::now_millis;
use crate::remote::traits::ReadClient;
use crate::resilience::retry::{backoff_delay, RetryConfig};
use crate::storage::traits::{MirrorStore, StorageError};

/// Everything a detached cycle needs.
struct SyncCycle {
    store: Arc<dyn MirrorStore>,
    reader: Arc<dyn ReadClient>,
    comments: Arc<CommentCache>,
    state: Arc<watch::Sender<SyncState>>,
    health: Arc<RwLock<SyncHealth>>,
    backoff: RetryConfig,
}

impl SyncEngine {
    /// Run one sync cycle from the stored checkpoint (full if there is none).
    ///
    /// Returns `Err(SyncInProgress)` if another cycle holds the lock and
    /// `Err(Standalone)` without a remote. Remote and storage failures come
    /// back as a report with `success == false`.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        self.start_cycle(false).await
    }

    /// Fetch a full snapshot regardless of the stored checkpoint. The stored
    /// checkpoint is replaced only if the cycle succeeds.
    pub async fn force_full_sync(&self) -> Result<SyncReport, SyncError> {
        self.start_cycle(true).await
    }

    async fn start_cycle(&self, force_full: bool) -> Result<SyncReport, SyncError> {
        if !self.is_connected() {
            return Err(SyncError::Standalone);
        }
        let reader = self.require_reader()?;

        let guard = match self.sync_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Sync requested while another cycle is running");
                crate::metrics::record_sync_rejected();
                return Err(SyncError::SyncInProgress);
            }
        };

        let cycle = SyncCycle {
            store: self.store.clone(),
            reader,
            comments: self.comment_cache.clone(),
            state: self.state.clone(),
            health: self.health.clone(),
            backoff: self.backoff.clone(),
        };

        tokio::spawn(cycle.run(force_full, guard))
            .await
            .map_err(|e| {
                error!(error = %e, "Sync task aborted");
                SyncError::Storage(StorageError::Backend(format!("sync task aborted: {}", e)))
            })
    }
}

impl SyncCycle {
    #[tracing::instrument(skip(self, _guard), fields(run_id = %uuid::Uuid::new_v4()))]
    async fn run(self, force_full: bool, _guard: OwnedMutexGuard<()>) -> SyncReport {
        let start = Instant::now();
        self.set_state(SyncState::Syncing);

        let checkpoint = if force_full {
            None
        } else {
            match self.store.get_checkpoint().await {
                Ok(cp) => cp.map(|c| c.token),
                Err(e) => return self.fail(start, e.to_string(), true, "storage"),
            }
        };
        let requested = if checkpoint.is_some() { "incremental" } else { "full" };
        debug!(mode = requested, "Fetching snapshot");

        let snapshot = match self.reader.fetch_snapshot(checkpoint.as_ref()).await {
            Ok(s) => s,
            Err(e) => {
                crate::metrics::record_remote_error("fetch_snapshot", e.kind());
                let retryable = e.is_retryable();
                return self.fail(start, e.to_string(), retryable, requested);
            }
        };

        if checkpoint.is_some() && snapshot.is_full_sync {
            info!("Checkpoint expired remotely, received full snapshot");
        }

        let observed_at = now_millis();
        let applied = {
            let _timer = crate::metrics::LatencyTimer::new("apply_snapshot");
            self.store.apply_snapshot(&snapshot, observed_at).await
        };
        let applied = match applied {
            Ok(a) => a,
            Err(e) => return self.fail(start, e.to_string(), true, requested),
        };

        self.comments.absorb(&snapshot);
        match self.store.task_ids().await {
            Ok(ids) => crate::metrics::set_mirrored("tasks", ids.len()),
            Err(e) => debug!(error = %e, "Could not count mirrored tasks"),
        }

        let mode = if snapshot.is_full_sync { "full" } else { "incremental" };
        let duration = start.elapsed();
        let report = SyncReport {
            success: true,
            task_count: applied.tasks,
            project_count: applied.projects,
            label_count: applied.labels,
            deleted_count: applied.deleted_tasks,
            duration_ms: duration.as_millis() as u64,
            is_full_sync: snapshot.is_full_sync,
            sync_token: Some(snapshot.sync_token.clone()),
            error: None,
            retryable: false,
            retry_after: None,
        };

        {
            let mut health = self.health.write();
            health.consecutive_failures = 0;
            health.last_failure_at = None;
            health.last_report = Some(report.clone());
        }
        crate::metrics::record_sync(mode, "success");
        crate::metrics::record_sync_duration(mode, duration);
        crate::metrics::record_applied("tasks", applied.tasks);
        crate::metrics::record_applied("projects", applied.projects);
        crate::metrics::record_applied("labels", applied.labels);
        crate::metrics::set_consecutive_failures(0);
        self.set_state(SyncState::Idle);

        info!(
            mode,
            tasks = applied.tasks,
            projects = applied.projects,
            labels = applied.labels,
            deleted = applied.deleted_tasks,
            duration_ms = report.duration_ms,
            "Sync complete"
        );
        report
    }

    fn fail(&self, start: Instant, error: String, retryable: bool, mode: &str) -> SyncReport {
        let failures = {
            let mut health = self.health.write();
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.last_failure_at = Some(Instant::now());
            health.consecutive_failures
        };
        let retry_after = backoff_delay(&self.backoff, failures);
        let report = SyncReport::failed(error, retryable, retry_after, start.elapsed().as_millis() as u64);

        warn!(
            error = report.error.as_deref().unwrap_or_default(),
            failures,
            retryable,
            retry_after_ms = retry_after.as_millis() as u64,
            "Sync failed, checkpoint left untouched"
        );
        self.health.write().last_report = Some(report.clone());
        crate::metrics::record_sync(mode, "failure");
        crate::metrics::set_consecutive_failures(failures);
        self.set_state(SyncState::Failed);
        self.settle_after(retry_after, failures);
        report
    }

    /// Return to `Idle` once the backoff window closes, unless another cycle
    /// has started or failed in the meantime.
    fn settle_after(&self, window: Duration, failures: u32) {
        let state = self.state.clone();
        let health = self.health.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if health.read().consecutive_failures != failures {
                return;
            }
            let settled = state.send_if_modified(|current| {
                if *current == SyncState::Failed {
                    *current = SyncState::Idle;
                    true
                } else {
                    false
                }
            });
            if settled {
                crate::metrics::set_sync_state(SyncState::Idle.gauge());
                debug!(failures, "Backoff window closed");
            }
        });
    }

    fn set_state(&self, state: SyncState) {
        let _ = self.state.send(state);
        crate::metrics::set_sync_state(state.gauge());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncEngineConfig;
    use crate::model::{SyncToken, Task};
    use crate::remote::memory::InMemoryRemote;
    use crate::remote::traits::RemoteError;
    use crate::storage::memory::InMemoryStore;

    fn engine() -> (SyncEngine, Arc<InMemoryRemote>, Arc<InMemoryStore>) {
        let remote = Arc::new(InMemoryRemote::new());
        let store = Arc::new(InMemoryStore::new());
        let config = SyncEngineConfig {
            backoff_initial_ms: 1_000,
            backoff_max_ms: 4_000,
            ..Default::default()
        };
        let engine = SyncEngine::new(config, store.clone(), remote.clone(), remote.clone());
        (engine, remote, store)
    }

    #[tokio::test]
    async fn test_first_sync_is_full() {
        let (engine, remote, store) = engine();
        remote.put_task(Task::new("A", "a"));
        remote.put_task(Task::new("B", "b"));

        let report = engine.sync().await.unwrap();
        assert!(report.success);
        assert!(report.is_full_sync);
        assert_eq!(report.task_count, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(engine.state(), SyncState::Idle);

        let cp = store.get_checkpoint().await.unwrap().unwrap();
        assert_eq!(Some(cp.token), report.sync_token);
    }

    #[tokio::test]
    async fn test_second_sync_is_incremental() {
        let (engine, remote, _store) = engine();
        remote.put_task(Task::new("A", "a"));
        engine.sync().await.unwrap();

        remote.put_task(Task::new("B", "b"));
        let report = engine.sync().await.unwrap();
        assert!(!report.is_full_sync);
        assert_eq!(report.task_count, 1);
    }

    #[tokio::test]
    async fn test_failure_backs_off_and_recovers() {
        let (engine, remote, store) = engine();
        remote.put_task(Task::new("A", "a"));
        engine.sync().await.unwrap();
        let before = store.get_checkpoint().await.unwrap();

        remote.fail_snapshots(Some(RemoteError::Unavailable("503".into())));
        let r1 = engine.sync().await.unwrap();
        let r2 = engine.sync().await.unwrap();
        assert!(!r1.success && r1.retryable);
        assert_eq!(r1.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(r2.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(engine.state(), SyncState::Failed);
        assert_eq!(engine.status().consecutive_failures, 2);
        assert!(engine.status().backoff_remaining.is_some());
        assert_eq!(store.get_checkpoint().await.unwrap(), before);

        remote.fail_snapshots(None);
        let r3 = engine.sync().await.unwrap();
        assert!(r3.success);
        assert_eq!(engine.status().consecutive_failures, 0);
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_settles_to_idle_after_backoff() {
        let (engine, remote, _store) = engine();
        remote.fail_snapshots(Some(RemoteError::Unavailable("503".into())));
        let report = engine.sync().await.unwrap();
        assert_eq!(report.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(engine.state(), SyncState::Failed);

        let mut states = engine.state_receiver();
        states.borrow_and_update();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(states.has_changed().unwrap());
        assert_eq!(engine.state(), SyncState::Idle);
        assert_eq!(engine.status().consecutive_failures, 1);
        assert!(engine.status().last_report.is_some_and(|r| !r.success));
    }

    #[tokio::test]
    async fn test_auth_failure_not_retryable() {
        let (engine, remote, _) = engine();
        remote.fail_snapshots(Some(RemoteError::Auth("401".into())));
        let report = engine.sync().await.unwrap();
        assert!(!report.success);
        assert!(!report.retryable);
    }

    #[tokio::test]
    async fn test_force_full_sync_ignores_checkpoint() {
        let (engine, remote, store) = engine();
        remote.put_task(Task::new("A", "a"));
        engine.sync().await.unwrap();

        let report = engine.force_full_sync().await.unwrap();
        assert!(report.is_full_sync);
        assert_eq!(report.task_count, 1);
        assert_eq!(
            store.get_checkpoint().await.unwrap().map(|c| c.token),
            Some(SyncToken::new(remote.head_token().as_str()))
        );
    }
}
