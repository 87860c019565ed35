use crate::errors::{CoreError, CoreResult};
use crate::models::{Backend, Config, Settings, Task};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use uuid::Uuid;

/// Owner of the persisted configuration document. All reads hand out clones;
/// all mutations validate, persist atomically, and roll the in-memory state
/// back when the disk write fails.
#[derive(Debug)]
pub struct ConfigStore {
    config_path: PathBuf,
    root_dir: PathBuf,
    config: RwLock<Config>,
}

impl ConfigStore {
    /// Load an existing configuration file.
    pub fn load(config_path: impl Into<PathBuf>, root_dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let config_path = config_path.into();
        let data = fs::read(&config_path)?;
        let config: Config = serde_json::from_slice(&data)
            .map_err(|err| CoreError::Validation(format!("failed to parse configuration: {err}")))?;
        validate(&config)?;
        Ok(Self {
            config_path,
            root_dir: root_dir.into(),
            config: RwLock::new(config),
        })
    }

    /// Create and persist a default configuration document.
    pub fn create_default(
        config_path: impl Into<PathBuf>,
        root_dir: impl Into<PathBuf>,
        temp_dir: &str,
        sources_dir: &str,
    ) -> CoreResult<Self> {
        let store = Self {
            config_path: config_path.into(),
            root_dir: root_dir.into(),
            config: RwLock::new(Config {
                version: "1.0".to_string(),
                backends: Vec::new(),
                tasks: Vec::new(),
                settings: Settings {
                    temp_dir: temp_dir.to_string(),
                    sources_dir: sources_dir.to_string(),
                    max_concurrent_tasks: 3,
                    log_level: "info".to_string(),
                },
            }),
        };
        if let Some(dir) = store.config_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let config = store.config.read().expect("config lock").clone();
        store.persist(&config)?;
        Ok(store)
    }

    /// Load the configuration, falling back to a default document when the
    /// file does not exist yet.
    pub fn load_or_create_default(
        config_path: impl Into<PathBuf>,
        root_dir: impl Into<PathBuf>,
        temp_dir: &str,
        sources_dir: &str,
    ) -> CoreResult<Self> {
        let config_path = config_path.into();
        if config_path.exists() {
            Self::load(config_path, root_dir)
        } else {
            Self::create_default(config_path, root_dir, temp_dir, sources_dir)
        }
    }

    pub fn get(&self) -> Config {
        self.config.read().expect("config lock").clone()
    }

    pub fn get_settings(&self) -> Settings {
        self.config.read().expect("config lock").settings.clone()
    }

    pub fn update_settings(&self, settings: Settings) -> CoreResult<()> {
        self.mutate(|config| {
            config.settings = settings;
            Ok(())
        })
    }

    /// Absolute paths pass through; relative paths resolve against the root.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root_dir.join(candidate)
        }
    }

    pub fn get_backend(&self, id: Uuid) -> CoreResult<Backend> {
        let config = self.config.read().expect("config lock");
        config
            .backends
            .iter()
            .find(|backend| backend.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("backend not found: {id}")))
    }

    pub fn list_backends(&self) -> Vec<Backend> {
        self.config.read().expect("config lock").backends.clone()
    }

    pub fn add_backend(&self, mut backend: Backend) -> CoreResult<Backend> {
        if backend.id.is_nil() {
            backend.id = Uuid::new_v4();
        }
        validate_backend_fields(&backend)?;
        let now = Utc::now();
        backend.created_at = now;
        backend.updated_at = now;
        let added = backend.clone();
        self.mutate(move |config| {
            if config.backends.iter().any(|b| b.id == backend.id) {
                return Err(CoreError::Conflict(format!(
                    "backend with ID {} already exists",
                    backend.id
                )));
            }
            config.backends.push(backend.clone());
            Ok(())
        })?;
        Ok(added)
    }

    pub fn update_backend(&self, id: Uuid, mut backend: Backend) -> CoreResult<Backend> {
        backend.id = id;
        validate_backend_fields(&backend)?;
        backend.updated_at = Utc::now();
        let mut updated = None;
        self.mutate(|config| {
            let existing = config
                .backends
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("backend not found: {id}")))?;
            backend.created_at = existing.created_at;
            *existing = backend.clone();
            updated = Some(backend);
            Ok(())
        })?;
        Ok(updated.expect("updated backend"))
    }

    pub fn delete_backend(&self, id: Uuid) -> CoreResult<()> {
        self.mutate(|config| {
            if let Some(task) = config
                .tasks
                .iter()
                .find(|task| task.backend_ids.contains(&id))
            {
                return Err(CoreError::Conflict(format!(
                    "backend is in use by task: {}",
                    task.name
                )));
            }
            let before = config.backends.len();
            config.backends.retain(|backend| backend.id != id);
            if config.backends.len() == before {
                return Err(CoreError::NotFound(format!("backend not found: {id}")));
            }
            Ok(())
        })
    }

    /// Stamp the outcome of a connectivity test on a backend record.
    pub fn record_backend_test(&self, id: Uuid, status: &str) -> CoreResult<()> {
        self.mutate(|config| {
            let backend = config
                .backends
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("backend not found: {id}")))?;
            backend.last_test = Some(Utc::now());
            backend.last_test_status = Some(status.to_string());
            Ok(())
        })
    }

    pub fn get_task(&self, id: Uuid) -> CoreResult<Task> {
        let config = self.config.read().expect("config lock");
        config
            .tasks
            .iter()
            .find(|task| task.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("task not found: {id}")))
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.config.read().expect("config lock").tasks.clone()
    }

    pub fn add_task(&self, mut task: Task) -> CoreResult<Task> {
        if task.id.is_nil() {
            task.id = Uuid::new_v4();
        }
        validate_task_fields(&task)?;
        let now = Utc::now();
        task.created_at = now;
        task.updated_at = now;
        let added = task.clone();
        self.mutate(move |config| {
            if config.tasks.iter().any(|t| t.id == task.id) {
                return Err(CoreError::Conflict(format!(
                    "task with ID {} already exists",
                    task.id
                )));
            }
            validate_backend_refs(config, &task)?;
            config.tasks.push(task.clone());
            Ok(())
        })?;
        Ok(added)
    }

    pub fn update_task(&self, id: Uuid, mut task: Task) -> CoreResult<Task> {
        task.id = id;
        validate_task_fields(&task)?;
        task.updated_at = Utc::now();
        let mut updated = None;
        self.mutate(|config| {
            validate_backend_refs(config, &task)?;
            let existing = config
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("task not found: {id}")))?;
            task.created_at = existing.created_at;
            *existing = task.clone();
            updated = Some(task);
            Ok(())
        })?;
        Ok(updated.expect("updated task"))
    }

    pub fn delete_task(&self, id: Uuid) -> CoreResult<()> {
        self.mutate(|config| {
            let before = config.tasks.len();
            config.tasks.retain(|task| task.id != id);
            if config.tasks.len() == before {
                return Err(CoreError::NotFound(format!("task not found: {id}")));
            }
            Ok(())
        })
    }

    /// Update run bookkeeping on a task. `None` leaves a field unchanged.
    pub fn update_task_schedule(
        &self,
        id: Uuid,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        self.mutate(|config| {
            let task = config
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("task not found: {id}")))?;
            if let Some(value) = last_run {
                task.last_run = Some(value);
            }
            if let Some(value) = next_run {
                task.next_run = Some(value);
            }
            Ok(())
        })
    }

    /// Apply a mutation under the writer lock and persist inside the critical
    /// section. A failed persist restores the pre-mutation snapshot.
    fn mutate<F>(&self, op: F) -> CoreResult<()>
    where
        F: FnOnce(&mut Config) -> CoreResult<()>,
    {
        let mut config = self.config.write().expect("config lock");
        let snapshot = config.clone();
        op(&mut config)?;
        if let Err(err) = self.persist(&config) {
            *config = snapshot;
            return Err(err);
        }
        Ok(())
    }

    /// Write to a sibling temp file, then atomically rename over the target.
    fn persist(&self, config: &Config) -> CoreResult<()> {
        let data = serde_json::to_vec_pretty(config)
            .map_err(|err| CoreError::Validation(format!("failed to marshal configuration: {err}")))?;
        let tmp_path = self.config_path.with_extension("json.tmp");
        fs::write(&tmp_path, data)?;
        if let Err(err) = fs::rename(&tmp_path, &self.config_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

fn validate(config: &Config) -> CoreResult<()> {
    if config.version.is_empty() {
        return Err(CoreError::Validation("version is required".to_string()));
    }
    let mut backend_ids = std::collections::HashSet::new();
    for backend in &config.backends {
        if backend.id.is_nil() {
            return Err(CoreError::Validation("backend ID is required".to_string()));
        }
        if !backend_ids.insert(backend.id) {
            return Err(CoreError::Validation(format!(
                "duplicate backend ID: {}",
                backend.id
            )));
        }
        validate_backend_fields(backend)?;
    }
    let mut task_ids = std::collections::HashSet::new();
    for task in &config.tasks {
        if task.id.is_nil() {
            return Err(CoreError::Validation("task ID is required".to_string()));
        }
        if !task_ids.insert(task.id) {
            return Err(CoreError::Validation(format!(
                "duplicate task ID: {}",
                task.id
            )));
        }
        validate_task_fields(task)?;
        for backend_id in &task.backend_ids {
            if !backend_ids.contains(backend_id) {
                return Err(CoreError::Validation(format!(
                    "task {} references non-existent backend: {}",
                    task.id, backend_id
                )));
            }
        }
    }
    Ok(())
}

fn validate_backend_fields(backend: &Backend) -> CoreResult<()> {
    if backend.name.is_empty() {
        return Err(CoreError::Validation(format!(
            "backend name is required for backend: {}",
            backend.id
        )));
    }
    Ok(())
}

fn validate_task_fields(task: &Task) -> CoreResult<()> {
    if task.name.is_empty() {
        return Err(CoreError::Validation(format!(
            "task name is required for task: {}",
            task.id
        )));
    }
    if task.source_path.is_empty() {
        return Err(CoreError::Validation(format!(
            "source path is required for task: {}",
            task.id
        )));
    }
    if task.backend_ids.is_empty() {
        return Err(CoreError::Validation(format!(
            "at least one backend is required for task: {}",
            task.id
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for backend_id in &task.backend_ids {
        if !seen.insert(*backend_id) {
            return Err(CoreError::Validation(format!(
                "task {} lists backend {} more than once",
                task.id, backend_id
            )));
        }
    }
    Ok(())
}

fn validate_backend_refs(config: &Config, task: &Task) -> CoreResult<()> {
    for backend_id in &task.backend_ids {
        if !config.backends.iter().any(|b| b.id == *backend_id) {
            return Err(CoreError::Validation(format!(
                "backend not found: {backend_id}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ConfigStore;
    use crate::errors::CoreError;
    use crate::models::{Backend, BackendKind, Schedule, Settings, Task};
    use chrono::Utc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn new_store(dir: &std::path::Path) -> ConfigStore {
        ConfigStore::create_default(dir.join("config.json"), dir, "temp", "sources")
            .expect("create default")
    }

    fn new_backend(name: &str) -> Backend {
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

    fn new_task(name: &str, backend_ids: Vec<Uuid>) -> Task {
        Task {
            id: Uuid::nil(),
            name: name.to_string(),
            description: String::new(),
            source_path: "sources/data".to_string(),
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

    #[test]
    fn create_default_writes_expected_settings() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let settings = store.get_settings();
        assert_eq!(settings.temp_dir, "temp");
        assert_eq!(settings.sources_dir, "sources");
        assert_eq!(settings.max_concurrent_tasks, 3);
        assert_eq!(settings.log_level, "info");
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add backend");
        let task = store
            .add_task(new_task("nightly", vec![backend.id]))
            .expect("add task");

        let reloaded =
            ConfigStore::load(dir.path().join("config.json"), dir.path()).expect("reload");
        assert_eq!(reloaded.get(), store.get());
        assert_eq!(reloaded.get_task(task.id).expect("task").name, "nightly");
    }

    #[test]
    fn add_backend_generates_id_and_timestamps() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");
        assert!(!backend.id.is_nil());
        assert_eq!(backend.created_at, backend.updated_at);
    }

    #[test]
    fn add_backend_rejects_duplicate_id() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");
        let mut duplicate = new_backend("other");
        duplicate.id = backend.id;
        let err = store.add_backend(duplicate).expect_err("duplicate");
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn update_backend_preserves_created_at() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");
        let mut updated = backend.clone();
        updated.name = "renamed".to_string();
        let result = store.update_backend(backend.id, updated).expect("update");
        assert_eq!(result.created_at, backend.created_at);
        assert_eq!(store.get_backend(backend.id).expect("get").name, "renamed");
    }

    #[test]
    fn delete_backend_in_use_fails_with_conflict() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");
        store
            .add_task(new_task("nightly", vec![backend.id]))
            .expect("add task");
        let err = store.delete_backend(backend.id).expect_err("in use");
        assert_eq!(err.code(), "CONFLICT");
        assert!(err.to_string().contains("nightly"));
    }

    #[test]
    fn delete_unknown_backend_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let err = store.delete_backend(Uuid::new_v4()).expect_err("missing");
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn add_task_rejects_unknown_backend_reference() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let err = store
            .add_task(new_task("nightly", vec![Uuid::new_v4()]))
            .expect_err("bad ref");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn add_task_rejects_duplicate_backend_ids() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");
        let err = store
            .add_task(new_task("nightly", vec![backend.id, backend.id]))
            .expect_err("duplicate refs");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn add_task_requires_name_source_and_backends() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");

        let mut no_name = new_task("", vec![backend.id]);
        no_name.name = String::new();
        assert_eq!(
            store.add_task(no_name).expect_err("name").code(),
            "VALIDATION_ERROR"
        );

        let mut no_source = new_task("nightly", vec![backend.id]);
        no_source.source_path = String::new();
        assert_eq!(
            store.add_task(no_source).expect_err("source").code(),
            "VALIDATION_ERROR"
        );

        let no_backends = new_task("nightly", Vec::new());
        assert_eq!(
            store.add_task(no_backends).expect_err("backends").code(),
            "VALIDATION_ERROR"
        );
    }

    #[test]
    fn update_task_schedule_leaves_unset_fields_alone() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");
        let task = store
            .add_task(new_task("nightly", vec![backend.id]))
            .expect("add task");

        let next = Utc::now();
        store
            .update_task_schedule(task.id, None, Some(next))
            .expect("next run");
        let last = Utc::now();
        store
            .update_task_schedule(task.id, Some(last), None)
            .expect("last run");

        let loaded = store.get_task(task.id).expect("task");
        assert_eq!(loaded.next_run, Some(next));
        assert_eq!(loaded.last_run, Some(last));
    }

    #[test]
    fn mutating_a_returned_copy_does_not_leak_into_the_store() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");

        let mut copy = store.get_backend(backend.id).expect("copy");
        copy.name = "mutated".to_string();
        copy.config
            .insert("path".to_string(), serde_json::json!("/elsewhere"));

        let fresh = store.get_backend(backend.id).expect("fresh");
        assert_eq!(fresh.name, "disk");
        assert!(fresh.config.get("path").is_none());
    }

    #[test]
    fn failed_persist_rolls_back_memory_state() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");

        // Replace the config file's parent with an unwritable location by
        // removing the directory out from under the store.
        std::fs::remove_dir_all(dir.path()).expect("remove root");
        let err = store
            .add_backend(new_backend("other"))
            .expect_err("persist should fail");
        assert_eq!(err.code(), "IO_ERROR");
        assert_eq!(store.list_backends().len(), 1);
        assert_eq!(store.list_backends()[0].id, backend.id);
    }

    #[test]
    fn resolve_path_joins_relative_and_keeps_absolute() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        assert_eq!(
            store.resolve_path("sources/app"),
            dir.path().join("sources/app")
        );
        assert_eq!(
            store.resolve_path("/var/backups"),
            std::path::PathBuf::from("/var/backups")
        );
    }

    #[test]
    fn record_backend_test_stamps_status() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");
        store
            .record_backend_test(backend.id, "success")
            .expect("record");
        let loaded = store.get_backend(backend.id).expect("get");
        assert!(loaded.last_test.is_some());
        assert_eq!(loaded.last_test_status.as_deref(), Some("success"));
    }

    #[test]
    fn load_rejects_duplicate_ids() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        let backend = store.add_backend(new_backend("disk")).expect("add");

        // Hand-edit the file to duplicate the backend entry.
        let path = dir.path().join("config.json");
        let mut doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("parse");
        let entry = doc["backends"][0].clone();
        doc["backends"].as_array_mut().expect("array").push(entry);
        std::fs::write(&path, serde_json::to_vec(&doc).expect("encode")).expect("write");

        let err = ConfigStore::load(&path, dir.path()).expect_err("duplicate");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains(&backend.id.to_string()));
    }

    #[test]
    fn update_settings_persists() {
        let dir = tempdir().expect("tempdir");
        let store = new_store(dir.path());
        store
            .update_settings(Settings {
                temp_dir: "scratch".to_string(),
                sources_dir: "sources".to_string(),
                max_concurrent_tasks: 5,
                log_level: "debug".to_string(),
            })
            .expect("update");
        let reloaded =
            ConfigStore::load(dir.path().join("config.json"), dir.path()).expect("reload");
        assert_eq!(reloaded.get_settings().max_concurrent_tasks, 5);
        assert_eq!(reloaded.get_settings().temp_dir, "scratch");
    }
}
