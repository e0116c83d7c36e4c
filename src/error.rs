// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;

use crate::remote::traits::RemoteError;
use crate::storage::traits::StorageError;

/// Errors surfaced by [`crate::SyncEngine`].
#[derive(Error, Debug)]
pub enum SyncError {
    /// Another sync cycle holds the lock. Wait and retry.
    #[error("A sync is already in progress")]
    SyncInProgress,
    /// The operation needs a remote but the engine is in standalone mode.
    #[error("Operation requires connected mode")]
    Standalone,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Unknown task: {0}")]
    UnknownTask(String),
}

impl SyncError {
    /// Whether the same call may succeed later without reconfiguration.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SyncInProgress => true,
            Self::Remote(e) => e.is_retryable(),
            Self::Storage(StorageError::Backend(_)) => true,
            _ => false,
        }
    }
}
