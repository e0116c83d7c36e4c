// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] ties the components together:
//! - a [`MirrorStore`] holding the local mirror, field metadata and checkpoint
//! - a [`ReadClient`] for bulk snapshots and a [`WriteClient`] for single writes
//! - the comment cache fed by every applied snapshot
//! - orphan detection and merge decisions for standalone → connected switches
//!
//! # Sync cycle
//!
//! ```text
//! try_lock ─► read checkpoint ─► fetch_snapshot ─► apply_snapshot (one tx) ─► absorb comments
//!    │                                 │                  │
//!    └─ SyncInProgress                 └──── failure ─────┴─► Failed, checkpoint untouched
//!                                                                   │
//!                                                                   └─ backoff elapsed ─► Idle
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use task_sync::{SyncEngine, SyncEngineConfig, SyncState};
//! use task_sync::remote::memory::InMemoryRemote;
//! use task_sync::storage::memory::InMemoryStore;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let remote = Arc::new(InMemoryRemote::new());
//! let engine = SyncEngine::new(
//!     SyncEngineConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     remote.clone(),
//!     remote,
//! );
//! engine.start().await.expect("start failed");
//!
//! let report = engine.sync().await.expect("sync rejected");
//! assert!(report.success);
//! assert_eq!(engine.state(), SyncState::Idle);
//! # }
//! ```

mod types;
mod sync;
mod lifecycle;
mod comments;
mod orphans;
mod mutations;
mod classification;

pub use types::{SyncState, SyncReport, SyncStatus};
pub use comments::{CommentResolution, ResolveStats};
pub use orphans::{OrphanReport, MergeAction, MergeDecision, DecisionOutcome, DecisionResult};
pub use classification::{Classifier, ClassifierError, ClassifyReport};

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tracing::warn;

use crate::config::SyncEngineConfig;
use crate::error::SyncError;
use crate::model::{SyncMode, Task};
use crate::remote::http::HttpRemote;
use crate::remote::traits::{ReadClient, WriteClient};
use crate::resilience::retry::RetryConfig;
use crate::storage::memory::InMemoryStore;
use crate::storage::query::TaskQuery;
use crate::storage::sql::SqlStore;
use crate::storage::traits::MirrorStore;

use comments::CommentCache;
use orphans::RemoteScan;

/// Outcome bookkeeping shared between the engine and spawned cycles.
#[derive(Debug, Default)]
pub(super) struct SyncHealth {
    pub(super) consecutive_failures: u32,
    pub(super) last_report: Option<SyncReport>,
    pub(super) last_failure_at: Option<Instant>,
}

impl SyncHealth {
    /// Time left before the backoff window closes.
    pub(super) fn backoff_remaining(&self) -> Option<Duration> {
        let at = self.last_failure_at?;
        let window = self.last_report.as_ref()?.retry_after?;
        window.checked_sub(at.elapsed()).filter(|d| !d.is_zero())
    }
}

/// Main sync engine coordinator.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; share it behind an `Arc`. Only one sync cycle
/// runs at a time, everything else may run concurrently.
pub struct SyncEngine {
    pub(super) config: SyncEngineConfig,

    /// Local mirror (ground truth for reads)
    pub(super) store: Arc<dyn MirrorStore>,

    /// Remote capabilities; both `None` for a standalone-only engine
    pub(super) reader: Option<Arc<dyn ReadClient>>,
    pub(super) writer: Option<Arc<dyn WriteClient>>,

    /// Held by the running sync cycle and by merge-decision application
    pub(super) sync_lock: Arc<Mutex<()>>,

    /// Orchestrator state (broadcast to watchers)
    pub(super) state: Arc<watch::Sender<SyncState>>,
    pub(super) state_rx: watch::Receiver<SyncState>,

    pub(super) health: Arc<RwLock<SyncHealth>>,

    /// Backoff schedule between failed cycles
    pub(super) backoff: RetryConfig,

    pub(super) comment_cache: Arc<CommentCache>,

    /// Remote tasks seen by the last orphan scan, for import decisions
    pub(super) last_scan: RwLock<Option<RemoteScan>>,

    pub(super) mode: RwLock<SyncMode>,
}

impl SyncEngine {
    /// Create a connected engine. Call [`start()`](Self::start) to load the
    /// persisted mode before use.
    pub fn new(
        config: SyncEngineConfig,
        store: Arc<dyn MirrorStore>,
        reader: Arc<dyn ReadClient>,
        writer: Arc<dyn WriteClient>,
    ) -> Self {
        Self::build(config, store, Some(reader), Some(writer))
    }

    /// Create an engine with no remote. Mutations only touch the mirror and
    /// new tasks get `local-<uuid>` ids.
    pub fn standalone(config: SyncEngineConfig, store: Arc<dyn MirrorStore>) -> Self {
        let mut config = config;
        config.mode = SyncMode::Standalone;
        Self::build(config, store, None, None)
    }

    fn build(
        config: SyncEngineConfig,
        store: Arc<dyn MirrorStore>,
        reader: Option<Arc<dyn ReadClient>>,
        writer: Option<Arc<dyn WriteClient>>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SyncState::Idle);
        let backoff = RetryConfig::sync_backoff(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        let mode = config.mode;

        Self {
            config,
            store,
            reader,
            writer,
            sync_lock: Arc::new(Mutex::new(())),
            state: Arc::new(state_tx),
            state_rx,
            health: Arc::new(RwLock::new(SyncHealth::default())),
            backoff,
            comment_cache: Arc::new(CommentCache::new()),
            last_scan: RwLock::new(None),
            mode: RwLock::new(mode),
        }
    }

    /// Build backends from configuration and start the engine.
    ///
    /// Uses [`SqlStore`] when `sql_url` is set (in-memory mirror otherwise)
    /// and [`HttpRemote`] when `api_token` is set (standalone otherwise).
    pub async fn from_config(config: SyncEngineConfig) -> Result<Self, SyncError> {
        let store: Arc<dyn MirrorStore> = match &config.sql_url {
            Some(url) => Arc::new(SqlStore::with_max_connections(url, config.sql_max_connections).await?),
            None => {
                warn!("No SQL URL configured - mirror lives in memory only");
                Arc::new(InMemoryStore::new())
            }
        };

        let engine = if config.api_token.is_some() {
            let remote = Arc::new(HttpRemote::from_config(&config)?);
            Self::new(config, store, remote.clone(), remote)
        } else {
            warn!("No API token configured - running standalone");
            Self::standalone(config, store)
        };

        engine.start().await?;
        Ok(engine)
    }

    /// Get current orchestrator state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// The local mirror, for read-side queries.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MirrorStore> {
        &self.store
    }

    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        *self.mode.read()
    }

    /// Whether a remote is attached at all.
    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.reader.is_some()
    }

    /// Query the mirror.
    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, SyncError> {
        Ok(self.store.list_tasks(query).await?)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, SyncError> {
        Ok(self.store.get_task(id).await?)
    }

    /// Instant (epoch millis) the checkpoint was last replaced.
    pub async fn last_sync_time(&self) -> Result<Option<i64>, SyncError> {
        Ok(self.store.get_last_sync_time().await?)
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let health = self.health.read();
        SyncStatus {
            state: self.state(),
            mode: self.sync_mode(),
            consecutive_failures: health.consecutive_failures,
            last_report: health.last_report.clone(),
            backoff_remaining: health.backoff_remaining(),
        }
    }

    pub(super) fn require_reader(&self) -> Result<Arc<dyn ReadClient>, SyncError> {
        self.reader.clone().ok_or(SyncError::Standalone)
    }

    pub(super) fn require_writer(&self) -> Result<Arc<dyn WriteClient>, SyncError> {
        self.writer.clone().ok_or(SyncError::Standalone)
    }

    pub(super) fn is_connected(&self) -> bool {
        self.sync_mode() == SyncMode::Connected && self.reader.is_some()
    }
}
