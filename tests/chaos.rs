//! Chaos Testing for the Sync Engine
//!
//! Failure scenarios driven by:
//! 1. **FailingStore** - a mirror wrapper that errors on chosen operations
//! 2. **Remote failure injection** - outages, protocol garbage, revoked auth
//! 3. **Held snapshots** - a gate that parks a cycle mid-fetch so concurrent
//!    callers and abandoned callers can be observed
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use task_sync::metadata::{FieldMetadata, FieldName, MetadataWrite};
use task_sync::model::{Label, Project, ProviderSyncState, Snapshot, SyncCheckpoint, SyncMode, SyncToken, Task};
use task_sync::remote::memory::InMemoryRemote;
use task_sync::storage::memory::InMemoryStore;
use task_sync::storage::query::TaskQuery;
use task_sync::storage::traits::ApplyResult;
use task_sync::{MirrorStore, RemoteError, StorageError, SyncEngine, SyncEngineConfig, SyncError, SyncState};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Delegates to an in-memory mirror; `apply_snapshot` fails while armed.
pub struct FailingStore {
    inner: InMemoryStore,
    fail_apply: AtomicBool,
    error_msg: String,
}

impl FailingStore {
    pub fn new(error_msg: &str) -> Self {
        Self {
            inner: InMemoryStore::new(),
            fail_apply: AtomicBool::new(false),
            error_msg: error_msg.to_string(),
        }
    }

    pub fn arm(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MirrorStore for FailingStore {
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StorageError> {
        self.inner.get_task(id).await
    }
    async fn save_task(&self, task: &Task) -> Result<(), StorageError> {
        self.inner.save_task(task).await
    }
    async fn save_tasks(&self, tasks: &[Task]) -> Result<usize, StorageError> {
        self.inner.save_tasks(tasks).await
    }
    async fn delete_task(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.delete_task(id).await
    }
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, StorageError> {
        self.inner.list_tasks(query).await
    }
    async fn task_ids(&self) -> Result<Vec<String>, StorageError> {
        self.inner.task_ids().await
    }
    async fn import_task(&self, task: &Task, observed_at: i64) -> Result<(), StorageError> {
        self.inner.import_task(task, observed_at).await
    }
    async fn replace_task(&self, old_id: &str, task: &Task, observed_at: i64) -> Result<(), StorageError> {
        self.inner.replace_task(old_id, task, observed_at).await
    }
    async fn get_project(&self, id: &str) -> Result<Option<Project>, StorageError> {
        self.inner.get_project(id).await
    }
    async fn save_project(&self, project: &Project) -> Result<(), StorageError> {
        self.inner.save_project(project).await
    }
    async fn delete_project(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.delete_project(id).await
    }
    async fn list_projects(&self) -> Result<Vec<Project>, StorageError> {
        self.inner.list_projects().await
    }
    async fn get_label(&self, id: &str) -> Result<Option<Label>, StorageError> {
        self.inner.get_label(id).await
    }
    async fn save_label(&self, label: &Label) -> Result<(), StorageError> {
        self.inner.save_label(label).await
    }
    async fn delete_label(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.delete_label(id).await
    }
    async fn list_labels(&self) -> Result<Vec<Label>, StorageError> {
        self.inner.list_labels().await
    }
    async fn save_field_metadata(
        &self,
        task_id: &str,
        field: FieldName,
        value: &Value,
        classified_at: i64,
    ) -> Result<MetadataWrite, StorageError> {
        self.inner.save_field_metadata(task_id, field, value, classified_at).await
    }
    async fn get_field_metadata(&self, task_id: &str) -> Result<Option<FieldMetadata>, StorageError> {
        self.inner.get_field_metadata(task_id).await
    }
    async fn get_last_synced_state(&self, task_id: &str) -> Result<Option<ProviderSyncState>, StorageError> {
        self.inner.get_last_synced_state(task_id).await
    }
    async fn save_last_synced_state(&self, task: &Task, observed_at: i64) -> Result<ProviderSyncState, StorageError> {
        self.inner.save_last_synced_state(task, observed_at).await
    }
    async fn get_checkpoint(&self) -> Result<Option<SyncCheckpoint>, StorageError> {
        self.inner.get_checkpoint().await
    }
    async fn set_checkpoint(&self, token: &SyncToken, updated_at: i64) -> Result<(), StorageError> {
        self.inner.set_checkpoint(token, updated_at).await
    }
    async fn get_sync_mode(&self) -> Result<Option<SyncMode>, StorageError> {
        self.inner.get_sync_mode().await
    }
    async fn set_sync_mode(&self, mode: SyncMode) -> Result<(), StorageError> {
        self.inner.set_sync_mode(mode).await
    }
    async fn apply_snapshot(&self, snapshot: &Snapshot, observed_at: i64) -> Result<ApplyResult, StorageError> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(self.error_msg.clone()));
        }
        self.inner.apply_snapshot(snapshot, observed_at).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Log output for `--nocapture` runs; RUST_LOG picks the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine_with(store: Arc<dyn MirrorStore>, remote: Arc<InMemoryRemote>) -> Arc<SyncEngine> {
    init_tracing();
    let config = SyncEngineConfig {
        backoff_initial_ms: 1_000,
        backoff_max_ms: 8_000,
        ..Default::default()
    };
    Arc::new(SyncEngine::new(config, store, remote.clone(), remote))
}

async fn wait_for_fetch(remote: &InMemoryRemote) {
    for _ in 0..500 {
        if remote.in_flight() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("snapshot fetch never started");
}

// =============================================================================
// Storage failures
// =============================================================================

#[tokio::test]
async fn chaos_store_failure_leaves_checkpoint_byte_identical() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.put_task(Task::new("A", "a"));
    let store = Arc::new(FailingStore::new("disk I/O error"));
    let engine = engine_with(store.clone(), remote.clone());

    assert!(engine.sync().await.unwrap().success);
    let before = store.get_checkpoint().await.unwrap().unwrap();

    remote.put_task(Task::new("B", "b"));
    store.arm(true);
    let report = engine.sync().await.unwrap();

    assert!(!report.success);
    assert!(report.retryable);
    assert!(report.error.unwrap().contains("disk I/O error"));
    assert_eq!(engine.state(), SyncState::Failed);
    assert_eq!(store.get_checkpoint().await.unwrap().unwrap(), before);

    // Previously mirrored data is still there, the failed batch is not
    assert!(store.get_task("A").await.unwrap().is_some());
    assert!(store.get_task("B").await.unwrap().is_none());

    store.arm(false);
    let report = engine.sync().await.unwrap();
    assert!(report.success);
    assert!(!report.is_full_sync);
    assert!(store.get_task("B").await.unwrap().is_some());
    assert_eq!(engine.state(), SyncState::Idle);
}

// =============================================================================
// Remote failures
// =============================================================================

#[tokio::test]
async fn chaos_protocol_error_is_not_retryable() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.put_task(Task::new("A", "a"));
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_with(store.clone(), remote.clone());
    engine.sync().await.unwrap();

    remote.fail_snapshots(Some(RemoteError::Protocol("sync_token missing".into())));
    let report = engine.sync().await.unwrap();
    assert!(!report.success);
    assert!(!report.retryable);
    assert_eq!(engine.status().consecutive_failures, 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn chaos_outage_backoff_grows_then_resets() {
    let remote = Arc::new(InMemoryRemote::new());
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_with(store, remote.clone());

    remote.fail_snapshots(Some(RemoteError::Unavailable("503".into())));
    let delays: Vec<Duration> = {
        let mut out = Vec::new();
        for _ in 0..5 {
            out.push(engine.sync().await.unwrap().retry_after.unwrap());
        }
        out
    };
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(8),
        ]
    );

    remote.fail_snapshots(None);
    assert!(engine.sync().await.unwrap().success);
    let status = engine.status();
    assert_eq!(status.consecutive_failures, 0);
    assert!(status.backoff_remaining.is_none());
}

// =============================================================================
// Concurrency and cancellation
// =============================================================================

#[tokio::test]
async fn chaos_concurrent_sync_is_rejected() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.put_task(Task::new("A", "a"));
    let engine = engine_with(Arc::new(InMemoryStore::new()), remote.clone());

    remote.hold_snapshots();
    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.sync().await }
    });
    wait_for_fetch(&remote).await;
    assert_eq!(engine.state(), SyncState::Syncing);

    for _ in 0..3 {
        assert!(matches!(engine.sync().await, Err(SyncError::SyncInProgress)));
    }

    remote.release_snapshot();
    let report = first.await.unwrap().unwrap();
    assert!(report.success);
    assert_eq!(remote.snapshot_calls(), 1);
    assert_eq!(remote.max_in_flight(), 1);
}

#[tokio::test]
async fn chaos_abandoned_caller_still_commits() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.put_task(Task::new("A", "a"));
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_with(store.clone(), remote.clone());

    remote.hold_snapshots();
    let timed_out = tokio::time::timeout(Duration::from_millis(20), engine.sync()).await;
    assert!(timed_out.is_err(), "caller should have given up");
    assert!(matches!(engine.sync().await, Err(SyncError::SyncInProgress)));

    remote.open_gate();
    let head = remote.head_token();
    let mut committed = false;
    for _ in 0..500 {
        if engine.state() == SyncState::Idle {
            committed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(committed, "detached cycle never finished");
    assert_eq!(store.get_checkpoint().await.unwrap().unwrap().token, head);
    assert!(store.get_task("A").await.unwrap().is_some());

    // Lock was released with the cycle
    assert!(engine.sync().await.unwrap().success);
}
