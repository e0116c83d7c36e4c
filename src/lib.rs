//! # Task Sync Engine
//!
//! Keeps a durable local mirror of a remote task service and caches
//! per-task metadata produced by an external classifier.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Remote Task Service                    │
//! │  • Bulk snapshot read (opaque sync token, comments inline)  │
//! │  • Single-entity REST writes                                │
//! └─────────────────────────────────────────────────────────────┘
//!              │ ReadClient                 ▲ WriteClient
//!              ▼                            │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SyncEngine                          │
//! │  • One sync cycle at a time (try_lock, else rejected)       │
//! │  • Comment cache fed by every snapshot                      │
//! │  • Orphan detection on standalone → connected switch        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ apply_snapshot (one transaction)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  MirrorStore (SQLite/MySQL)                 │
//! │  • Tasks, projects, labels                                  │
//! │  • Field metadata with forward-only timestamps              │
//! │  • Provider sync state + single-row checkpoint              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use task_sync::{SyncEngine, SyncEngineConfig};
//! use task_sync::storage::query::TaskQuery;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncEngineConfig {
//!         sql_url: Some("sqlite:///var/lib/tasks/mirror.db?mode=rwc".into()),
//!         api_token: Some("0123456789abcdef".into()),
//!         ..Default::default()
//!     };
//!
//!     let engine = SyncEngine::from_config(config).await.expect("Failed to start");
//!
//!     let report = engine.sync().await.expect("Sync rejected");
//!     println!("Mirrored {} tasks", report.task_count);
//!
//!     // Reads always come from the mirror
//!     let open = engine.list_tasks(&TaskQuery::completed(false)).await.unwrap();
//!     println!("{} open tasks", open.len());
//! }
//! ```
//!
//! ## Backoff
//!
//! ```
//! use std::time::Duration;
//! use task_sync::RetryConfig;
//! use task_sync::resilience::retry::backoff_delay;
//!
//! let backoff = RetryConfig::sync_backoff(Duration::from_secs(5), Duration::from_secs(300));
//! assert_eq!(backoff_delay(&backoff, 1), Duration::from_secs(5));
//! assert_eq!(backoff_delay(&backoff, 3), Duration::from_secs(20));
//! assert_eq!(backoff_delay(&backoff, 20), Duration::from_secs(300));
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`SyncEngine`], comment resolver, orphan resolver, mutations
//! - [`storage`]: Mirror stores (SQL, memory) and the composable task query
//! - [`remote`]: Remote capabilities, HTTP client, in-memory fake
//! - [`model`] / [`metadata`]: Tasks, snapshots, field metadata
//! - [`resilience`]: Retry and backoff policies

pub mod config;
pub mod model;
pub mod metadata;
pub mod storage;
pub mod remote;
pub mod resilience;
pub mod coordinator;
pub mod error;
pub mod metrics;

pub use config::SyncEngineConfig;
pub use coordinator::{
    Classifier, ClassifierError, ClassifyReport, CommentResolution, DecisionOutcome, DecisionResult,
    MergeAction, MergeDecision, OrphanReport, ResolveStats, SyncEngine, SyncReport, SyncState, SyncStatus,
};
pub use error::SyncError;
pub use metadata::{Classification, FieldMetadata, FieldName, MetadataWrite, TimeEstimate};
pub use model::{Comment, Label, Project, Snapshot, SyncMode, SyncToken, Task};
pub use remote::traits::{NewTask, ReadClient, RemoteError, TaskUpdate, WriteClient};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{MirrorStore, StorageError};
pub use metrics::LatencyTimer;
