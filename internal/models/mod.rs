use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// The complete persisted configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub settings: Settings,
}

/// A storage destination. `config` is kind-specific and opaque to the core;
/// secrets inside it are stored in the clear and masked by the API layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Backend {
    #[serde(default)]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test_status: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
    Gcs,
    Gdrive,
    Azure,
    B2,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
            Self::Gdrive => "gdrive",
            Self::Azure => "azure",
            Self::B2 => "b2",
        }
    }
}

/// A declarative backup job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_path: String,
    pub backend_ids: Vec<Uuid>,
    pub schedule: Schedule,
    #[serde(default)]
    pub archive_options: ArchiveOptions,
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum Schedule {
    Simple {
        simple_type: SimplePeriod,
    },
    Cron {
        cron_expr: String,
    },
    Manual,
}

impl Schedule {
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SimplePeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveOptions {
    pub format: String,
    pub compression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_pattern: Option<String>,
    pub use_timestamp: bool,
    #[serde(default)]
    pub sync_options: SyncOptions,
}

impl ArchiveOptions {
    pub fn is_sync(&self) -> bool {
        self.format == "sync"
    }
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            format: "tar.gz".to_string(),
            compression: "gzip".to_string(),
            name_pattern: None,
            use_timestamp: true,
            sync_options: SyncOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncOptions {
    #[serde(default)]
    pub delete_remote: bool,
}

/// `keep_last == 0` means keep everything.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub keep_last: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub temp_dir: String,
    pub sources_dir: String,
    pub max_concurrent_tasks: u32,
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

/// One concrete run of a task. The task name is denormalized so history
/// survives rename and delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub archive_size: i64,
    #[serde(default)]
    pub archive_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_results: Vec<BackendResult>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendResultStatus {
    Success,
    Failed,
}

impl BackendResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendResult {
    pub backend_id: Uuid,
    pub backend_name: String,
    pub status: BackendResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub remote_path: String,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskStats {
    pub total_executions: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_execution_status: String,
    pub average_duration_ms: i64,
    pub last_archive_size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionsStats {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub running: i64,
    pub last_24h: i64,
}

/// `total == -1` means the store has no fixed capacity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageUsage {
    pub used: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    ExecutionStarted {
        execution_id: Uuid,
        task_id: Uuid,
        task_name: String,
        started_at: DateTime<Utc>,
    },
    ArchiveProgress(ArchiveProgress),
    UploadProgress(UploadProgress),
    SyncProgress(SyncProgress),
    ExecutionCompleted {
        execution_id: Uuid,
        task_id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
        archive_size: i64,
        backends_succeeded: usize,
        backends_failed: usize,
    },
    ExecutionFailed {
        execution_id: Uuid,
        task_id: Uuid,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error_message: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArchiveProgress {
    pub execution_id: Uuid,
    pub phase: String,
    pub progress_percent: f64,
    pub current_file: String,
    pub bytes_processed: i64,
    pub bytes_total: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadProgress {
    pub execution_id: Uuid,
    pub backend_id: Uuid,
    pub backend_name: String,
    pub progress_percent: f64,
    pub bytes_uploaded: i64,
    pub bytes_total: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncProgress {
    pub execution_id: Uuid,
    pub backend_id: Uuid,
    pub backend_name: String,
    pub phase: String,
    pub progress_percent: f64,
    pub current_file: String,
    pub files_processed: usize,
    pub files_total: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DryRunResult {
    pub task_id: Uuid,
    pub task_name: String,
    pub mode: String,
    pub source_path: String,
    pub files_summary: FilesSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_details: Option<ArchiveDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_details: Option<SyncDetails>,
    pub backend_plans: Vec<BackendPlan>,
    pub analyzed_at: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FilesSummary {
    pub total_files: usize,
    pub total_size: i64,
    pub total_dirs: usize,
    pub largest_file: String,
    pub largest_file_size: i64,
    pub file_types: HashMap<String, usize>,
    pub top_files: Vec<FileDetail>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArchiveDetails {
    pub estimated_archive_size: i64,
    pub compression_ratio: f64,
    pub format: String,
    pub archive_name: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SyncDetails {
    pub files_to_upload: Vec<FileDetail>,
    pub files_to_delete: Vec<String>,
    pub files_to_skip: Vec<FileDetail>,
    pub bytes_to_upload: i64,
    pub upload_count: usize,
    pub delete_count: usize,
    pub skip_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileDetail {
    pub relative_path: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendPlan {
    pub backend_id: Uuid,
    pub backend_name: String,
    pub backend_type: String,
    pub remote_path: String,
    pub available: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}
