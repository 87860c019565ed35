use crate::archive::{sanitize_filename, ArchiveBuilder, ArchiveProgressFn};
use crate::backend::{BackendProvider, BackupInfo, FactoryProvider, UploadProgressFn};
use crate::config::ConfigStore;
use crate::errors::{CoreError, CoreResult};
use crate::events::ProgressBroadcaster;
use crate::history::HistoryStore;
use crate::models::{
    ArchiveDetails, ArchiveProgress, BackendPlan, BackendResult, BackendResultStatus, DryRunResult,
    Execution, ExecutionStatus, FileDetail, FilesSummary, ProgressEvent, SyncDetails, SyncProgress,
    Task, UploadProgress,
};
use crate::syncdiff::{SyncProgressFn, Syncer};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

const GZIP_COMPRESSION_RATIO: f64 = 0.7;
const TOP_FILES_LIMIT: usize = 10;

/// Handle for an in-flight run.
#[derive(Clone)]
pub struct RunningExecution {
    pub execution_id: Uuid,
    pub task_id: Uuid,
    pub started_at: chrono::DateTime<Utc>,
    cancel: CancellationToken,
}

/// Owns the lifecycle of every run: mode selection, progress emission,
/// per-backend uploads, retention, and the terminal history row.
pub struct Executor {
    config: Arc<ConfigStore>,
    history: HistoryStore,
    events: ProgressBroadcaster,
    provider: Arc<dyn BackendProvider>,
    running: DashMap<Uuid, RunningExecution>,
    run_permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(
        config: Arc<ConfigStore>,
        history: HistoryStore,
        events: ProgressBroadcaster,
    ) -> Arc<Self> {
        let provider = Arc::new(FactoryProvider::new(config.clone()));
        Self::with_provider(config, history, events, provider)
    }

    pub fn with_provider(
        config: Arc<ConfigStore>,
        history: HistoryStore,
        events: ProgressBroadcaster,
        provider: Arc<dyn BackendProvider>,
    ) -> Arc<Self> {
        let max_concurrent = config.get_settings().max_concurrent_tasks.max(1) as usize;
        Arc::new(Self {
            config,
            history,
            events,
            provider,
            running: DashMap::new(),
            run_permits: Arc::new(Semaphore::new(max_concurrent)),
        })
    }

    /// Start a run for the task and return the execution ID immediately; the
    /// body proceeds in the background.
    pub async fn execute(self: &Arc<Self>, task_id: Uuid) -> CoreResult<Uuid> {
        let task = self.config.get_task(task_id)?;
        if !task.enabled {
            return Err(CoreError::Validation("task is disabled".to_string()));
        }

        let execution = Execution {
            id: Uuid::new_v4(),
            task_id,
            task_name: task.name.clone(),
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            archive_size: 0,
            archive_hash: String::new(),
            backend_results: Vec::new(),
            error_message: String::new(),
            duration_ms: 0,
        };

        let cancel = CancellationToken::new();
        let handle = RunningExecution {
            execution_id: execution.id,
            task_id,
            started_at: execution.started_at,
            cancel: cancel.clone(),
        };
        // One execution per task at a time; the map entry is the reservation.
        match self.running.entry(task_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(CoreError::TaskRunning),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }

        if let Err(err) = self.history.create_execution(&execution).await {
            self.running.remove(&task_id);
            return Err(err);
        }

        self.events.broadcast(ProgressEvent::ExecutionStarted {
            execution_id: execution.id,
            task_id,
            task_name: task.name.clone(),
            started_at: execution.started_at,
        });

        let execution_id = execution.id;
        let executor = self.clone();
        tokio::spawn(async move {
            executor.run_execution(task, execution, cancel).await;
            executor.running.remove(&task_id);
        });
        Ok(execution_id)
    }

    /// Cancel an in-flight execution by ID.
    pub fn cancel(&self, execution_id: Uuid) -> CoreResult<()> {
        for entry in self.running.iter() {
            if entry.value().execution_id == execution_id {
                entry.value().cancel.cancel();
                return Ok(());
            }
        }
        Err(CoreError::NotFound(
            "execution not found or not running".to_string(),
        ))
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.running.contains_key(&task_id)
    }

    pub fn running_executions(&self) -> Vec<Uuid> {
        self.running
            .iter()
            .map(|entry| entry.value().execution_id)
            .collect()
    }

    async fn run_execution(
        self: &Arc<Self>,
        task: Task,
        mut execution: Execution,
        cancel: CancellationToken,
    ) {
        let _permit = match self.run_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let started = Instant::now();
        let settings = self.config.get_settings();
        let source_path = self.config.resolve_path(&task.source_path);
        let temp_dir = self.config.resolve_path(&settings.temp_dir);

        if let Err(err) = tokio::fs::metadata(&source_path).await {
            self.fail_execution(
                &mut execution,
                format!("Source path not accessible: {err}"),
                started,
            )
            .await;
            return;
        }

        if task.archive_options.is_sync() {
            self.run_sync_execution(&task, &mut execution, &source_path, started, &cancel)
                .await;
        } else {
            self.run_archive_execution(
                &task,
                &mut execution,
                &source_path,
                &temp_dir,
                started,
                &cancel,
            )
            .await;
        }
    }

    async fn run_archive_execution(
        self: &Arc<Self>,
        task: &Task,
        execution: &mut Execution,
        source_path: &Path,
        temp_dir: &Path,
        started: Instant,
        cancel: &CancellationToken,
    ) {
        tracing::info!(task = %task.name, source = %source_path.display(), "creating archive");
        let builder = ArchiveBuilder::new(source_path, temp_dir, task.archive_options.clone());
        let events = self.events.clone();
        let execution_id = execution.id;
        let progress: Arc<ArchiveProgressFn> = Arc::new(move |current, total, file| {
            events.broadcast(ProgressEvent::ArchiveProgress(ArchiveProgress {
                execution_id,
                phase: "creating_archive".to_string(),
                progress_percent: percent_of(current, total),
                current_file: file.to_string(),
                bytes_processed: current,
                bytes_total: total,
            }));
        });

        let output = match builder
            .build(&task.name, cancel.clone(), Some(progress))
            .await
        {
            Ok(output) => output,
            Err(CoreError::Cancelled) => {
                self.cancel_execution(execution, started, 0, 0).await;
                return;
            }
            Err(err) => {
                self.fail_execution(
                    execution,
                    format!("Failed to create archive: {err}"),
                    started,
                )
                .await;
                return;
            }
        };
        execution.archive_size = output.size;
        execution.archive_hash = output.hash.clone();

        tracing::info!(backends = task.backend_ids.len(), "uploading archive");
        let mut results: Vec<BackendResult> = Vec::new();
        let mut upload_errors: Vec<String> = Vec::new();
        let mut cancelled = false;
        for backend_id in &task.backend_ids {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let result = self
                .upload_to_backend(cancel, *backend_id, &output.archive_path, execution)
                .await;
            if let Err(err) = self.history.add_backend_upload(execution.id, &result).await {
                tracing::error!(error = %err, "failed to record backend upload");
            }
            if result.status == BackendResultStatus::Failed {
                if cancel.is_cancelled() {
                    cancelled = true;
                    results.push(result);
                    break;
                }
                upload_errors.push(format!(
                    "backend {}: {}",
                    result.backend_name, result.error_message
                ));
            }
            results.push(result);
        }

        // The temp artifact never survives the run.
        if let Err(err) = tokio::fs::remove_file(&output.archive_path).await {
            tracing::warn!(error = %err, "failed to remove archive file");
        }

        if cancelled {
            let succeeded = count_succeeded(&results);
            self.cancel_execution(execution, started, succeeded, results.len() - succeeded)
                .await;
            return;
        }

        let total_backends = task.backend_ids.len();
        roll_up_status(execution, total_backends, &upload_errors, "uploads");
        execution.backend_results = results.clone();
        self.complete_execution(task, execution, started).await;

        if task.retention_policy.keep_last > 0 {
            self.apply_retention_policy(cancel, task, &results).await;
        }

        self.events.broadcast(ProgressEvent::ExecutionCompleted {
            execution_id: execution.id,
            task_id: task.id,
            status: execution.status,
            completed_at: execution.completed_at.unwrap_or_else(Utc::now),
            duration_ms: execution.duration_ms,
            archive_size: execution.archive_size,
            backends_succeeded: total_backends - upload_errors.len(),
            backends_failed: upload_errors.len(),
        });
    }

    async fn run_sync_execution(
        self: &Arc<Self>,
        task: &Task,
        execution: &mut Execution,
        source_path: &Path,
        started: Instant,
        cancel: &CancellationToken,
    ) {
        tracing::info!(task = %task.name, source = %source_path.display(), "starting sync");
        let mut results: Vec<BackendResult> = Vec::new();
        let mut sync_errors: Vec<String> = Vec::new();
        let mut total_bytes_uploaded: i64 = 0;
        let mut cancelled = false;

        for backend_id in &task.backend_ids {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let result = self
                .sync_to_backend(cancel, *backend_id, task, source_path, execution)
                .await;
            if let Err(err) = self.history.add_backend_upload(execution.id, &result).await {
                tracing::error!(error = %err, "failed to record backend upload");
            }
            match result.status {
                BackendResultStatus::Failed => {
                    if cancel.is_cancelled() {
                        cancelled = true;
                        results.push(result);
                        break;
                    }
                    sync_errors.push(format!(
                        "backend {}: {}",
                        result.backend_name, result.error_message
                    ));
                }
                BackendResultStatus::Success => total_bytes_uploaded += result.size,
            }
            results.push(result);
        }

        execution.archive_size = total_bytes_uploaded;

        if cancelled {
            let succeeded = count_succeeded(&results);
            self.cancel_execution(execution, started, succeeded, results.len() - succeeded)
                .await;
            return;
        }

        let total_backends = task.backend_ids.len();
        roll_up_status(execution, total_backends, &sync_errors, "syncs");
        execution.backend_results = results;
        self.complete_execution(task, execution, started).await;

        self.events.broadcast(ProgressEvent::ExecutionCompleted {
            execution_id: execution.id,
            task_id: task.id,
            status: execution.status,
            completed_at: execution.completed_at.unwrap_or_else(Utc::now),
            duration_ms: execution.duration_ms,
            archive_size: execution.archive_size,
            backends_succeeded: total_backends - sync_errors.len(),
            backends_failed: sync_errors.len(),
        });
    }

    async fn upload_to_backend(
        &self,
        cancel: &CancellationToken,
        backend_id: Uuid,
        archive_path: &Path,
        execution: &Execution,
    ) -> BackendResult {
        let mut result = empty_result(backend_id);
        let backend_cfg = match self.config.get_backend(backend_id) {
            Ok(backend) => backend,
            Err(err) => {
                result.error_message = format!("Backend not found: {err}");
                return result;
            }
        };
        result.backend_name = backend_cfg.name.clone();

        let instance = match self.provider.connect(&backend_cfg).await {
            Ok(instance) => instance,
            Err(err) => {
                result.error_message = format!("Failed to create backend: {err}");
                return result;
            }
        };

        // Backends prepend their own configured prefixes.
        let remote_path = archive_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        tracing::info!(backend = %backend_cfg.name, "uploading to backend");
        let events = self.events.clone();
        let execution_id = execution.id;
        let backend_name = backend_cfg.name.clone();
        let progress = move |uploaded: i64, total: i64| {
            events.broadcast(ProgressEvent::UploadProgress(UploadProgress {
                execution_id,
                backend_id,
                backend_name: backend_name.clone(),
                progress_percent: percent_of(uploaded, total),
                bytes_uploaded: uploaded,
                bytes_total: total,
            }));
        };
        let outcome = instance
            .upload(
                cancel,
                archive_path,
                &remote_path,
                Some(&progress as &UploadProgressFn),
            )
            .await;
        if let Err(err) = instance.close().await {
            tracing::warn!(error = %err, "failed to close backend");
        }

        match outcome {
            Ok(()) => {
                result.status = BackendResultStatus::Success;
                result.uploaded_at = Some(Utc::now());
                result.size = execution.archive_size;
                result.remote_path = remote_path;
            }
            Err(err) => result.error_message = err.to_string(),
        }
        result
    }

    async fn sync_to_backend(
        &self,
        cancel: &CancellationToken,
        backend_id: Uuid,
        task: &Task,
        source_path: &Path,
        execution: &Execution,
    ) -> BackendResult {
        let mut result = empty_result(backend_id);
        let backend_cfg = match self.config.get_backend(backend_id) {
            Ok(backend) => backend,
            Err(err) => {
                result.error_message = format!("Backend not found: {err}");
                return result;
            }
        };
        result.backend_name = backend_cfg.name.clone();

        let instance = match self.provider.connect(&backend_cfg).await {
            Ok(instance) => instance,
            Err(err) => {
                result.error_message = format!("Failed to create backend: {err}");
                return result;
            }
        };

        let remote_path = sync_remote_base(task, &backend_cfg.config);
        tracing::info!(backend = %backend_cfg.name, remote = %remote_path, "syncing to backend");

        let events = self.events.clone();
        let execution_id = execution.id;
        let backend_name = backend_cfg.name.clone();
        let progress = move |phase: &str, current: usize, total: usize, file: &str| {
            events.broadcast(ProgressEvent::SyncProgress(SyncProgress {
                execution_id,
                backend_id,
                backend_name: backend_name.clone(),
                phase: phase.to_string(),
                progress_percent: percent_of(current as i64, total as i64),
                current_file: file.to_string(),
                files_processed: current,
                files_total: total,
            }));
        };

        let syncer = Syncer::new(
            source_path,
            instance.as_ref(),
            remote_path.clone(),
            task.archive_options.sync_options.clone(),
        );
        let outcome = syncer
            .sync(cancel, Some(&progress as &SyncProgressFn))
            .await;
        if let Err(err) = instance.close().await {
            tracing::warn!(error = %err, "failed to close backend");
        }

        match outcome {
            Ok(summary) if summary.errors.is_empty() => {
                tracing::info!(
                    backend = %backend_cfg.name,
                    uploaded = summary.files_uploaded,
                    deleted = summary.files_deleted,
                    skipped = summary.files_skipped,
                    "sync finished"
                );
                result.status = BackendResultStatus::Success;
                result.uploaded_at = Some(Utc::now());
                result.size = summary.bytes_uploaded;
                result.remote_path = remote_path;
            }
            Ok(summary) => result.error_message = summary.errors.join("; "),
            Err(err) => result.error_message = err.to_string(),
        }
        result
    }

    /// Trim stored archives down to `keep_last` per successful backend. The
    /// candidate set is base names matching `<sanitized task name>_*` ending
    /// in `.gz`; the oldest by last-modified (name as tie-break) go first.
    async fn apply_retention_policy(
        &self,
        cancel: &CancellationToken,
        task: &Task,
        results: &[BackendResult],
    ) {
        let keep = task.retention_policy.keep_last as usize;
        let task_prefix = format!("{}_", sanitize_filename(&task.name));
        for result in results {
            if result.status != BackendResultStatus::Success {
                continue;
            }
            let Ok(backend_cfg) = self.config.get_backend(result.backend_id) else {
                continue;
            };
            let Ok(instance) = self.provider.connect(&backend_cfg).await else {
                continue;
            };

            let list_prefix = parent_prefix(&result.remote_path);
            let listed = match instance.list(cancel, &list_prefix).await {
                Ok(listed) => listed,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to list backups for retention");
                    let _ = instance.close().await;
                    continue;
                }
            };

            let uploaded_base = result
                .remote_path
                .rsplit('/')
                .next()
                .unwrap_or(&result.remote_path)
                .to_string();
            let mut matches: Vec<BackupInfo> = listed
                .into_iter()
                .filter(|file| {
                    let base = file.path.rsplit('/').next().unwrap_or(&file.path);
                    // The artifact this run just stored is always retained.
                    base.starts_with(&task_prefix)
                        && base.ends_with(".gz")
                        && base != uploaded_base
                })
                .collect();
            if matches.len() > keep {
                matches.sort_by(|a, b| {
                    retention_sort_key(a)
                        .cmp(&retention_sort_key(b))
                        .then_with(|| a.path.cmp(&b.path))
                });
                let excess = matches.len() - keep;
                for backup in matches.into_iter().take(excess) {
                    match instance.delete(cancel, &backup.path).await {
                        Ok(()) => tracing::info!(path = %backup.path, "deleted old backup"),
                        Err(err) => {
                            tracing::warn!(error = %err, path = %backup.path, "failed to delete old backup")
                        }
                    }
                }
            }
            let _ = instance.close().await;
        }
    }

    async fn complete_execution(&self, task: &Task, execution: &mut Execution, started: Instant) {
        let now = Utc::now();
        execution.completed_at = Some(now);
        execution.duration_ms = started.elapsed().as_millis() as i64;
        if let Err(err) = self.history.update_execution(execution).await {
            tracing::error!(error = %err, "failed to update execution");
        }
        if let Err(err) = self.config.update_task_schedule(task.id, Some(now), None) {
            tracing::error!(error = %err, "failed to update task last run");
        }
    }

    async fn fail_execution(&self, execution: &mut Execution, message: String, started: Instant) {
        execution.status = ExecutionStatus::Failed;
        execution.error_message = message;
        execution.completed_at = Some(Utc::now());
        execution.duration_ms = started.elapsed().as_millis() as i64;
        if let Err(err) = self.history.update_execution(execution).await {
            tracing::error!(error = %err, "failed to update execution");
        }
        self.events.broadcast(ProgressEvent::ExecutionFailed {
            execution_id: execution.id,
            task_id: execution.task_id,
            status: execution.status,
            completed_at: execution.completed_at.unwrap_or_else(Utc::now),
            error_message: execution.error_message.clone(),
        });
    }

    async fn cancel_execution(
        &self,
        execution: &mut Execution,
        started: Instant,
        succeeded: usize,
        failed: usize,
    ) {
        execution.status = ExecutionStatus::Cancelled;
        execution.error_message = CoreError::Cancelled.to_string();
        execution.completed_at = Some(Utc::now());
        execution.duration_ms = started.elapsed().as_millis() as i64;
        if let Err(err) = self.history.update_execution(execution).await {
            tracing::error!(error = %err, "failed to update execution");
        }
        self.events.broadcast(ProgressEvent::ExecutionCompleted {
            execution_id: execution.id,
            task_id: execution.task_id,
            status: execution.status,
            completed_at: execution.completed_at.unwrap_or_else(Utc::now),
            duration_ms: execution.duration_ms,
            archive_size: execution.archive_size,
            backends_succeeded: succeeded,
            backends_failed: failed,
        });
    }

    /// Read-only planning pass: what a run would do right now, with neither
    /// remote writes nor history rows.
    pub async fn execute_dry_run(
        &self,
        task_id: Uuid,
        backend_ids: Option<Vec<Uuid>>,
    ) -> CoreResult<DryRunResult> {
        let started = Instant::now();
        let analyzed_at = Utc::now();
        let task = self.config.get_task(task_id)?;
        let source_path = self.config.resolve_path(&task.source_path);
        tokio::fs::metadata(&source_path)
            .await
            .map_err(|err| CoreError::DryRun(format!("source path not accessible: {err}")))?;

        let backend_ids = match backend_ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => task.backend_ids.clone(),
        };

        let files_summary = scan_source_summary(&source_path).await?;
        let mut result = DryRunResult {
            task_id,
            task_name: task.name.clone(),
            mode: String::new(),
            source_path: source_path.to_string_lossy().to_string(),
            files_summary,
            archive_details: None,
            sync_details: None,
            backend_plans: Vec::new(),
            analyzed_at,
            duration_ms: 0,
            errors: Vec::new(),
        };

        if task.archive_options.is_sync() {
            result.mode = "sync".to_string();
            result.sync_details = Some(
                self.dry_run_sync(&task, &source_path, &backend_ids)
                    .await
                    .unwrap_or_default(),
            );
        } else {
            result.mode = "archive".to_string();
            let builder = ArchiveBuilder::new(&source_path, "", task.archive_options.clone());
            let ratio = if task.archive_options.compression == "none" {
                1.0
            } else {
                GZIP_COMPRESSION_RATIO
            };
            result.archive_details = Some(ArchiveDetails {
                estimated_archive_size: (result.files_summary.total_size as f64 * ratio) as i64,
                compression_ratio: ratio,
                format: task.archive_options.format.clone(),
                archive_name: builder.generate_filename(&task.name),
            });
        }

        result.backend_plans = self.analyze_backends(&task, &backend_ids).await;
        result.duration_ms = started.elapsed().as_millis() as i64;
        Ok(result)
    }

    async fn dry_run_sync(
        &self,
        task: &Task,
        source_path: &Path,
        backend_ids: &[Uuid],
    ) -> Option<SyncDetails> {
        let cancel = CancellationToken::new();
        for backend_id in backend_ids {
            let Ok(backend_cfg) = self.config.get_backend(*backend_id) else {
                continue;
            };
            let Ok(instance) = self.provider.connect(&backend_cfg).await else {
                continue;
            };
            let remote_path = sync_remote_base(task, &backend_cfg.config);
            let syncer = Syncer::new(
                source_path,
                instance.as_ref(),
                remote_path,
                task.archive_options.sync_options.clone(),
            );
            let details = syncer.dry_run(&cancel).await;
            let _ = instance.close().await;
            if let Ok(details) = details {
                return Some(details);
            }
        }
        None
    }

    async fn analyze_backends(&self, task: &Task, backend_ids: &[Uuid]) -> Vec<BackendPlan> {
        let mut plans = Vec::with_capacity(backend_ids.len());
        for backend_id in backend_ids {
            let mut plan = BackendPlan {
                backend_id: *backend_id,
                backend_name: String::new(),
                backend_type: String::new(),
                remote_path: String::new(),
                available: false,
                error_message: String::new(),
            };
            let backend_cfg = match self.config.get_backend(*backend_id) {
                Ok(backend) => backend,
                Err(_) => {
                    plan.error_message = "Backend not found".to_string();
                    plans.push(plan);
                    continue;
                }
            };
            plan.backend_name = backend_cfg.name.clone();
            plan.backend_type = backend_cfg.kind.as_str().to_string();
            plan.remote_path = if task.archive_options.is_sync() {
                task.name.clone()
            } else {
                ArchiveBuilder::new("", "", task.archive_options.clone())
                    .generate_filename(&task.name)
            };

            match self.provider.connect(&backend_cfg).await {
                Ok(instance) => {
                    match instance.test().await {
                        Ok(()) => plan.available = true,
                        Err(err) => {
                            plan.error_message = format!("Connection test failed: {err}");
                        }
                    }
                    let _ = instance.close().await;
                }
                Err(err) => {
                    plan.error_message = format!("Failed to initialize: {err}");
                }
            }
            plans.push(plan);
        }
        plans
    }
}

fn empty_result(backend_id: Uuid) -> BackendResult {
    BackendResult {
        backend_id,
        backend_name: String::new(),
        status: BackendResultStatus::Failed,
        uploaded_at: None,
        size: 0,
        remote_path: String::new(),
        error_message: String::new(),
    }
}

fn percent_of(current: i64, total: i64) -> f64 {
    if total > 0 {
        current as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

fn count_succeeded(results: &[BackendResult]) -> usize {
    results
        .iter()
        .filter(|result| result.status == BackendResultStatus::Success)
        .count()
}

fn roll_up_status(
    execution: &mut Execution,
    total_backends: usize,
    errors: &[String],
    verb: &str,
) {
    if !errors.is_empty() && errors.len() == total_backends {
        execution.status = ExecutionStatus::Failed;
        execution.error_message = format!("All backend {verb} failed: {}", errors.join("; "));
    } else if !errors.is_empty() {
        execution.status = ExecutionStatus::Success;
        execution.error_message = format!(
            "{} of {} backends failed: {}",
            errors.len(),
            total_backends,
            errors.join("; ")
        );
    } else {
        execution.status = ExecutionStatus::Success;
    }
}

/// Sync runs mirror under the task name, below the backend's own prefix when
/// one is configured.
fn sync_remote_base(task: &Task, backend_config: &serde_json::Map<String, serde_json::Value>) -> String {
    match backend_config
        .get("prefix")
        .and_then(serde_json::Value::as_str)
        .filter(|prefix| !prefix.is_empty())
    {
        Some(prefix) => format!("{prefix}/{}", task.name),
        None => task.name.clone(),
    }
}

fn parent_prefix(remote_path: &str) -> String {
    match remote_path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

fn retention_sort_key(backup: &BackupInfo) -> i64 {
    chrono::DateTime::parse_from_rfc3339(&backup.last_modified)
        .map(|t| t.timestamp_millis())
        .unwrap_or(0)
}

/// Fresh walk of a source tree for dry-run reporting.
async fn scan_source_summary(source_path: &Path) -> CoreResult<FilesSummary> {
    let source_path: PathBuf = source_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut summary = FilesSummary::default();
        let mut all_files: Vec<FileDetail> = Vec::new();
        let mut file_types: HashMap<String, usize> = HashMap::new();
        for entry in WalkDir::new(&source_path) {
            let entry =
                entry.map_err(|err| CoreError::DryRun(format!("failed to scan source: {err}")))?;
            if entry.file_type().is_dir() {
                summary.total_dirs += 1;
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|err| CoreError::DryRun(format!("failed to scan source: {err}")))?;
            let size = metadata.len() as i64;
            summary.total_files += 1;
            summary.total_size += size;

            let extension = entry
                .path()
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_else(|| "[no extension]".to_string());
            *file_types.entry(extension).or_insert(0) += 1;

            let relative = entry
                .path()
                .strip_prefix(&source_path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            if size > summary.largest_file_size {
                summary.largest_file_size = size;
                summary.largest_file = relative.clone();
            }
            all_files.push(FileDetail {
                relative_path: relative,
                size,
                mod_time: metadata
                    .modified()
                    .map(chrono::DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
                hash: String::new(),
                reason: String::new(),
            });
        }
        all_files.sort_by(|a, b| b.size.cmp(&a.size));
        all_files.truncate(TOP_FILES_LIMIT);
        summary.top_files = all_files;
        summary.file_types = file_types;
        Ok(summary)
    })
    .await
    .map_err(|err| CoreError::DryRun(format!("scan task panicked: {err}")))?
}
