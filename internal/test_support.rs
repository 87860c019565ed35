use crate::backend::{BackendProvider, BackupInfo, StorageBackend, UploadProgressFn};
use crate::config::ConfigStore;
use crate::errors::{CoreError, CoreResult};
use crate::events::ProgressBroadcaster;
use crate::history::HistoryStore;
use crate::models::{Backend, BackendKind, Schedule, StorageUsage, Task};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a component test needs: a scratch root with the standard
/// layout, a config store, a history store, and an event broadcaster.
pub struct TestHarness {
    pub root: TempDir,
    pub config: Arc<ConfigStore>,
    pub history: HistoryStore,
    pub events: ProgressBroadcaster,
}

pub async fn build_harness() -> TestHarness {
    let root = TempDir::new().expect("temp root");
    let config_dir = root.path().join("config");
    std::fs::create_dir_all(&config_dir).expect("config dir");
    std::fs::create_dir_all(root.path().join("temp")).expect("temp dir");
    std::fs::create_dir_all(root.path().join("sources")).expect("sources dir");

    let config = Arc::new(
        ConfigStore::create_default(config_dir.join("config.json"), root.path(), "temp", "sources")
            .expect("config store"),
    );
    let history = HistoryStore::open(&config_dir.join("archivist.db"))
        .await
        .expect("history store");
    TestHarness {
        root,
        config,
        history,
        events: ProgressBroadcaster::new(),
    }
}

pub fn backend_record(name: &str) -> Backend {
    Backend {
        id: Uuid::nil(),
        kind: BackendKind::Local,
        name: name.to_string(),
        config: serde_json::Map::new(),
        enabled: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        last_test: None,
        last_test_status: None,
    }
}

pub fn task_record(name: &str, source_path: &str, backend_ids: Vec<Uuid>) -> Task {
    Task {
        id: Uuid::nil(),
        name: name.to_string(),
        description: String::new(),
        source_path: source_path.to_string(),
        backend_ids,
        schedule: Schedule::Manual,
        archive_options: Default::default(),
        retention_policy: Default::default(),
        enabled: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        last_run: None,
        next_run: None,
    }
}

#[derive(Default)]
struct MemoryBackendState {
    remote: Vec<BackupInfo>,
    uploads: Vec<String>,
    deletes: Vec<String>,
    fail_uploads: HashSet<String>,
}

/// In-memory backend double: canned listings, recorded mutations, switchable
/// failure and slow-upload behavior.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryBackendState>>,
    fail_all_uploads: Arc<AtomicBool>,
    slow_uploads: Arc<AtomicBool>,
    fail_test: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_remote(&self, path: &str, size: i64, last_modified: DateTime<Utc>) {
        self.state
            .lock()
            .expect("state lock")
            .remote
            .push(BackupInfo {
                path: path.to_string(),
                size,
                last_modified: last_modified.to_rfc3339(),
                hash: String::new(),
            });
    }

    pub fn fail_upload_for(&self, path: &str) {
        self.state
            .lock()
            .expect("state lock")
            .fail_uploads
            .insert(path.to_string());
    }

    pub fn fail_all_uploads(&self) {
        self.fail_all_uploads.store(true, Ordering::SeqCst);
    }

    /// Uploads hang until the run's cancellation token fires.
    pub fn slow_uploads(&self) {
        self.slow_uploads.store(true, Ordering::SeqCst);
    }

    pub fn fail_test(&self) {
        self.fail_test.store(true, Ordering::SeqCst);
    }

    pub fn uploaded_paths(&self) -> Vec<String> {
        self.state.lock().expect("state lock").uploads.clone()
    }

    pub fn deleted_paths(&self) -> Vec<String> {
        self.state.lock().expect("state lock").deletes.clone()
    }

    pub fn remote_paths(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("state lock")
            .remote
            .iter()
            .map(|entry| entry.path.clone())
            .collect()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn test(&self) -> CoreResult<()> {
        if self.fail_test.load(Ordering::SeqCst) {
            return Err(CoreError::ConnectionFailed(
                "simulated test failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        remote_path: &str,
        progress: Option<&UploadProgressFn>,
    ) -> CoreResult<()> {
        if self.slow_uploads.load(Ordering::SeqCst) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
                    return Err(CoreError::Execution("slow upload never finished".to_string()));
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        if self.fail_all_uploads.load(Ordering::SeqCst) {
            return Err(CoreError::ConnectionFailed(
                "simulated upload failure".to_string(),
            ));
        }
        {
            let state = self.state.lock().expect("state lock");
            if state.fail_uploads.contains(remote_path) {
                return Err(CoreError::ConnectionFailed(
                    "simulated upload failure".to_string(),
                ));
            }
        }

        let size = tokio::fs::metadata(local_path).await?.len() as i64;
        let mut state = self.state.lock().expect("state lock");
        state.uploads.push(remote_path.to_string());
        state.remote.retain(|entry| entry.path != remote_path);
        state.remote.push(BackupInfo {
            path: remote_path.to_string(),
            size,
            last_modified: Utc::now().to_rfc3339(),
            hash: String::new(),
        });
        drop(state);
        if let Some(progress) = progress {
            progress(size, size);
        }
        Ok(())
    }

    async fn list(&self, _cancel: &CancellationToken, prefix: &str) -> CoreResult<Vec<BackupInfo>> {
        let state = self.state.lock().expect("state lock");
        Ok(state
            .remote
            .iter()
            .filter(|entry| prefix.is_empty() || entry.path.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, _cancel: &CancellationToken, remote_path: &str) -> CoreResult<()> {
        let mut state = self.state.lock().expect("state lock");
        let before = state.remote.len();
        state.remote.retain(|entry| entry.path != remote_path);
        if state.remote.len() == before {
            return Err(CoreError::NotFound(format!(
                "file not found: {remote_path}"
            )));
        }
        state.deletes.push(remote_path.to_string());
        Ok(())
    }

    async fn get_usage(&self, _cancel: &CancellationToken) -> CoreResult<StorageUsage> {
        let state = self.state.lock().expect("state lock");
        Ok(StorageUsage {
            used: state.remote.iter().map(|entry| entry.size).sum(),
            total: -1,
        })
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Backend provider serving [`MemoryBackend`] doubles keyed by backend ID.
#[derive(Default)]
pub struct MemoryProvider {
    backends: Mutex<HashMap<Uuid, MemoryBackend>>,
    fail_connect: Mutex<HashSet<Uuid>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, backend: MemoryBackend) {
        self.backends
            .lock()
            .expect("backends lock")
            .insert(id, backend);
    }

    pub fn fail_connect(&self, id: Uuid) {
        self.fail_connect.lock().expect("fail lock").insert(id);
    }
}

#[async_trait]
impl BackendProvider for MemoryProvider {
    async fn connect(&self, backend: &Backend) -> CoreResult<Box<dyn StorageBackend>> {
        if self
            .fail_connect
            .lock()
            .expect("fail lock")
            .contains(&backend.id)
        {
            return Err(CoreError::ConnectionFailed(
                "simulated connect failure".to_string(),
            ));
        }
        self.backends
            .lock()
            .expect("backends lock")
            .get(&backend.id)
            .cloned()
            .map(|b| Box::new(b) as Box<dyn StorageBackend>)
            .ok_or_else(|| {
                CoreError::NotFound(format!("no memory backend registered: {}", backend.id))
            })
    }
}
