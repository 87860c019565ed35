use crate::backend::{BackupInfo, StorageBackend};
use crate::errors::{CoreError, CoreResult};
use crate::models::{FileDetail, SyncDetails, SyncOptions};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Called as the differ moves through its phases: `scanning_local`,
/// `listing_remote`, `syncing` (per-file advance), optional `deleting`
/// (per-file advance), `completed`.
pub type SyncProgressFn = dyn Fn(&str, usize, usize, &str) + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub relative_path: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
}

/// Aggregate outcome of one backend sync. `errors` being non-empty marks the
/// backend run failed even when some files transferred.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSummary {
    pub files_scanned: usize,
    pub files_uploaded: usize,
    pub files_deleted: usize,
    pub files_skipped: usize,
    pub bytes_total: i64,
    pub bytes_uploaded: i64,
    pub errors: Vec<String>,
}

/// Compares a local tree against a backend listing and mirrors the
/// difference file by file.
pub struct Syncer<'a> {
    source_path: PathBuf,
    backend: &'a dyn StorageBackend,
    remote_path: String,
    options: SyncOptions,
}

impl<'a> Syncer<'a> {
    pub fn new(
        source_path: impl Into<PathBuf>,
        backend: &'a dyn StorageBackend,
        remote_path: impl Into<String>,
        options: SyncOptions,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            backend,
            remote_path: remote_path.into(),
            options,
        }
    }

    pub async fn sync(
        &self,
        cancel: &CancellationToken,
        progress: Option<&SyncProgressFn>,
    ) -> CoreResult<SyncSummary> {
        let mut summary = SyncSummary::default();

        report(progress, "scanning_local", 0, 0, "");
        let local_files = scan_local_files(&self.source_path).await?;
        summary.files_scanned = local_files.len();
        summary.bytes_total = local_files.iter().map(|f| f.size).sum();

        report(progress, "listing_remote", 0, 0, "");
        let mut remote_map = self.list_remote_map(cancel).await?;

        report(progress, "syncing", 0, local_files.len(), "");
        for (index, local) in local_files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            report(
                progress,
                "syncing",
                index,
                local_files.len(),
                &local.relative_path,
            );

            let upload_needed = match remote_map.get(&local.relative_path) {
                None => true,
                Some(remote) => needs_upload(local, remote),
            };

            if upload_needed {
                let remote_path = self.remote_file_path(&local.relative_path);
                match self
                    .backend
                    .upload(cancel, &local.path, &remote_path, None)
                    .await
                {
                    Ok(()) => {
                        summary.files_uploaded += 1;
                        summary.bytes_uploaded += local.size;
                    }
                    Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                    Err(err) => summary
                        .errors
                        .push(format!("failed to upload {}: {err}", local.relative_path)),
                }
            } else {
                summary.files_skipped += 1;
            }

            remote_map.remove(&local.relative_path);
        }

        if self.options.delete_remote && !remote_map.is_empty() {
            let mut orphans: Vec<BackupInfo> = remote_map.into_values().collect();
            orphans.sort_by(|a, b| a.path.cmp(&b.path));
            report(progress, "deleting", 0, orphans.len(), "");
            for (index, orphan) in orphans.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                report(progress, "deleting", index, orphans.len(), &orphan.path);
                match self.backend.delete(cancel, &orphan.path).await {
                    Ok(()) => summary.files_deleted += 1,
                    Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                    Err(err) => summary
                        .errors
                        .push(format!("failed to delete {}: {err}", orphan.path)),
                }
            }
        }

        report(
            progress,
            "completed",
            summary.files_scanned,
            summary.files_scanned,
            "",
        );
        Ok(summary)
    }

    /// Same classification as [`Syncer::sync`] without touching the remote.
    pub async fn dry_run(&self, cancel: &CancellationToken) -> CoreResult<SyncDetails> {
        let mut details = SyncDetails::default();

        let local_files = scan_local_files(&self.source_path).await?;
        let mut remote_map = self.list_remote_map(cancel).await?;

        for local in &local_files {
            let mut detail = FileDetail {
                relative_path: local.relative_path.clone(),
                size: local.size,
                mod_time: local.mod_time,
                hash: String::new(),
                reason: String::new(),
            };
            match remote_map.get(&local.relative_path) {
                None => {
                    detail.reason = "New file".to_string();
                    details.bytes_to_upload += local.size;
                    details.upload_count += 1;
                    details.files_to_upload.push(detail);
                }
                Some(remote) if needs_upload(local, remote) => {
                    detail.reason = upload_reason(local, remote).to_string();
                    details.bytes_to_upload += local.size;
                    details.upload_count += 1;
                    details.files_to_upload.push(detail);
                }
                Some(_) => {
                    detail.reason = "Unchanged".to_string();
                    details.skip_count += 1;
                    details.files_to_skip.push(detail);
                }
            }
            remote_map.remove(&local.relative_path);
        }

        if self.options.delete_remote {
            let mut orphans: Vec<String> = remote_map.into_keys().collect();
            orphans.sort();
            details.delete_count = orphans.len();
            details.files_to_delete = orphans;
        }

        Ok(details)
    }

    async fn list_remote_map(
        &self,
        cancel: &CancellationToken,
    ) -> CoreResult<HashMap<String, BackupInfo>> {
        let remote_files = self.backend.list(cancel, &self.remote_path).await?;
        let mut map = HashMap::with_capacity(remote_files.len());
        for remote in remote_files {
            let key = self.relative_remote_key(&remote.path);
            map.insert(key, remote);
        }
        Ok(map)
    }

    /// Strip `remote_path/` from a listed path to get the comparable key.
    fn relative_remote_key(&self, path: &str) -> String {
        if self.remote_path.is_empty() {
            return path.to_string();
        }
        match path.strip_prefix(&format!("{}/", self.remote_path)) {
            Some(rest) => rest.to_string(),
            None => path.to_string(),
        }
    }

    fn remote_file_path(&self, relative_path: &str) -> String {
        if self.remote_path.is_empty() {
            relative_path.to_string()
        } else {
            format!("{}/{}", self.remote_path, relative_path)
        }
    }
}

/// Recursive scan of the source tree; files only.
pub async fn scan_local_files(source_path: &Path) -> CoreResult<Vec<LocalFile>> {
    let source_path = source_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkDir::new(&source_path).min_depth(1) {
            let entry = entry.map_err(|err| CoreError::Execution(format!("walk failed: {err}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&source_path)
                .map_err(|err| CoreError::Execution(format!("relative path failed: {err}")))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let metadata = entry.metadata().map_err(|err| {
                CoreError::Execution(format!("stat failed for {relative}: {err}"))
            })?;
            let mod_time = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(LocalFile {
                path: entry.path().to_path_buf(),
                relative_path: relative,
                size: metadata.len() as i64,
                mod_time,
            });
        }
        Ok(files)
    })
    .await
    .map_err(|err| CoreError::Execution(format!("scan task panicked: {err}")))?
}

/// Size first; equal sizes fall back to timestamps with a one-second slack
/// absorbing filesystem quantization. An unparseable remote timestamp with a
/// matching size counts as unchanged.
fn needs_upload(local: &LocalFile, remote: &BackupInfo) -> bool {
    if local.size != remote.size {
        return true;
    }
    let Ok(remote_mod_time) = DateTime::parse_from_rfc3339(&remote.last_modified) else {
        return false;
    };
    local.mod_time > remote_mod_time.with_timezone(&Utc) + Duration::seconds(1)
}

fn upload_reason(local: &LocalFile, remote: &BackupInfo) -> &'static str {
    if local.size != remote.size {
        "Size changed"
    } else {
        "Modified timestamp newer"
    }
}

fn report(progress: Option<&SyncProgressFn>, phase: &str, current: usize, total: usize, file: &str) {
    if let Some(progress) = progress {
        progress(phase, current, total, file);
    }
}
