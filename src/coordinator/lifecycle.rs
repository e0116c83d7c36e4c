// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start, mode switches, run loop.

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{OrphanReport, SyncEngine, SyncReport};
use crate::error::SyncError;
use crate::model::SyncMode;

impl SyncEngine {
    /// Load the persisted sync mode, or persist the configured one on first
    /// start. A connected mode with no remote attached falls back to
    /// standalone.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SyncError> {
        let stored = self.store.get_sync_mode().await?;
        let mut mode = stored.unwrap_or(self.config.mode);

        if mode == SyncMode::Connected && self.reader.is_none() {
            warn!("Connected mode requested but no remote is attached, running standalone");
            mode = SyncMode::Standalone;
        }
        if stored.is_none() {
            self.store.set_sync_mode(mode).await?;
        }

        *self.mode.write() = mode;
        info!(mode = mode.as_str(), persisted = stored.is_some(), "Sync engine started");
        Ok(())
    }

    /// Switch between standalone and connected.
    ///
    /// Standalone → connected runs orphan detection and returns its report;
    /// nothing is merged until [`apply_merge_decisions`](Self::apply_merge_decisions).
    pub async fn set_sync_mode(&self, mode: SyncMode) -> Result<Option<OrphanReport>, SyncError> {
        if mode == SyncMode::Connected && self.reader.is_none() {
            return Err(SyncError::Standalone);
        }
        let previous = self.sync_mode();
        self.store.set_sync_mode(mode).await?;
        *self.mode.write() = mode;
        info!(from = previous.as_str(), to = mode.as_str(), "Sync mode changed");

        if previous == SyncMode::Standalone && mode == SyncMode::Connected {
            return Ok(Some(self.detect_orphans().await?));
        }
        Ok(None)
    }

    /// One scheduled sync attempt. Skipped while standalone, inside the
    /// backoff window, or when another cycle holds the lock.
    pub async fn tick(&self) -> Option<SyncReport> {
        if !self.is_connected() {
            return None;
        }
        let remaining = self.health.read().backoff_remaining();
        if let Some(remaining) = remaining {
            debug!(remaining_ms = remaining.as_millis() as u64, "Inside backoff window, skipping sync");
            return None;
        }

        match self.sync().await {
            Ok(report) => Some(report),
            Err(SyncError::SyncInProgress) => {
                debug!("Sync already running, skipping tick");
                None
            }
            Err(e) => {
                warn!(error = %e, "Scheduled sync rejected");
                None
            }
        }
    }

    /// Sync every `sync_interval_secs` until `shutdown` flips to `true` (or
    /// its sender is dropped).
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sync_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.config.sync_interval().as_secs(), "Sync loop running");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Sync loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncEngineConfig;
    use crate::model::Task;
    use crate::remote::memory::InMemoryRemote;
    use crate::remote::traits::RemoteError;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::MirrorStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_persists_configured_mode() {
        let remote = Arc::new(InMemoryRemote::new());
        let store = Arc::new(InMemoryStore::new());
        let engine = SyncEngine::new(SyncEngineConfig::default(), store.clone(), remote.clone(), remote);
        engine.start().await.unwrap();
        assert_eq!(store.get_sync_mode().await.unwrap(), Some(SyncMode::Connected));
    }

    #[tokio::test]
    async fn test_start_loads_persisted_mode() {
        let remote = Arc::new(InMemoryRemote::new());
        let store = Arc::new(InMemoryStore::new());
        store.set_sync_mode(SyncMode::Standalone).await.unwrap();

        let engine = SyncEngine::new(SyncEngineConfig::default(), store, remote.clone(), remote);
        engine.start().await.unwrap();
        assert_eq!(engine.sync_mode(), SyncMode::Standalone);
        assert!(matches!(engine.sync().await, Err(SyncError::Standalone)));
    }

    #[tokio::test]
    async fn test_connect_without_remote_is_rejected() {
        let engine = SyncEngine::standalone(SyncEngineConfig::default(), Arc::new(InMemoryStore::new()));
        engine.start().await.unwrap();
        assert!(matches!(
            engine.set_sync_mode(SyncMode::Connected).await,
            Err(SyncError::Standalone)
        ));
        assert_eq!(engine.sync_mode(), SyncMode::Standalone);
    }

    #[tokio::test]
    async fn test_switch_to_connected_reports_orphans() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.put_task(Task::new("remote-1", "from phone"));
        let store = Arc::new(InMemoryStore::new());
        let config = SyncEngineConfig {
            mode: SyncMode::Standalone,
            ..Default::default()
        };
        let engine = SyncEngine::new(config, store.clone(), remote.clone(), remote);
        engine.start().await.unwrap();

        store.save_task(&Task::new("local-1", "from laptop")).await.unwrap();

        let report = engine.set_sync_mode(SyncMode::Connected).await.unwrap().unwrap();
        assert_eq!(report.local_only_ids(), vec!["local-1"]);
        assert_eq!(report.remote_only_ids(), vec!["remote-1"]);
        assert_eq!(store.get_sync_mode().await.unwrap(), Some(SyncMode::Connected));

        // Already connected: no scan
        assert!(engine.set_sync_mode(SyncMode::Connected).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tick_honors_backoff() {
        let remote = Arc::new(InMemoryRemote::new());
        let config = SyncEngineConfig {
            backoff_initial_ms: 60_000,
            ..Default::default()
        };
        let engine = SyncEngine::new(config, Arc::new(InMemoryStore::new()), remote.clone(), remote.clone());

        remote.fail_snapshots(Some(RemoteError::Unavailable("down".into())));
        let report = engine.tick().await.unwrap();
        assert!(!report.success);

        remote.fail_snapshots(None);
        assert!(engine.tick().await.is_none());
        assert_eq!(remote.snapshot_calls(), 1);

        // Direct sync ignores the window
        assert!(engine.sync().await.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let remote = Arc::new(InMemoryRemote::new());
        let config = SyncEngineConfig {
            sync_interval_secs: 10,
            ..Default::default()
        };
        let engine = Arc::new(SyncEngine::new(
            config,
            Arc::new(InMemoryStore::new()),
            remote.clone(),
            remote.clone(),
        ));

        let (tx, rx) = watch::channel(false);
        let runner = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        runner.await.unwrap();

        // Immediate first tick, then at 10s and 20s
        assert_eq!(remote.snapshot_calls(), 3);
    }
}
