//! Public types for the sync engine coordinator.

use std::time::Duration;

use crate::model::{SyncMode, SyncToken};

/// Sync orchestrator state.
///
/// ```text
/// Idle → Syncing → Idle            (success)
/// Idle → Syncing → Failed → Idle   (error; Idle again once the backoff window closes)
/// ```
///
/// A cycle triggered while still `Failed` moves straight to `Syncing`. The
/// failure count and last report stay in [`SyncStatus`] after the state
/// settles.
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    /// Last cycle failed and its backoff window is still open; the
    /// checkpoint was left untouched
    Failed,
}

impl SyncState {
    pub(crate) fn gauge(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Syncing => 1,
            Self::Failed => 2,
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Syncing => write!(f, "Syncing"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Result of one sync cycle.
///
/// A failed cycle is still a report (`success == false`), not an `Err`:
/// previously mirrored data stays intact and queryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub success: bool,
    pub task_count: usize,
    pub project_count: usize,
    pub label_count: usize,
    /// Tasks removed because the remote reported them deleted
    pub deleted_count: usize,
    pub duration_ms: u64,
    pub is_full_sync: bool,
    /// Checkpoint persisted by this cycle
    pub sync_token: Option<SyncToken>,
    pub error: Option<String>,
    /// Whether the failure is worth retrying on a later cycle
    pub retryable: bool,
    /// Earliest sensible moment for the next attempt, relative to the failure
    pub retry_after: Option<Duration>,
}

impl SyncReport {
    pub(crate) fn failed(error: String, retryable: bool, retry_after: Duration, duration_ms: u64) -> Self {
        Self {
            success: false,
            task_count: 0,
            project_count: 0,
            label_count: 0,
            deleted_count: 0,
            duration_ms,
            is_full_sync: false,
            sync_token: None,
            error: Some(error),
            retryable,
            retry_after: Some(retry_after),
        }
    }
}

/// Snapshot of orchestrator health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub mode: SyncMode,
    pub consecutive_failures: u32,
    pub last_report: Option<SyncReport>,
    /// Remaining backoff window, if the last cycle failed
    pub backoff_remaining: Option<Duration>,
}
