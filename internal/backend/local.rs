use super::{
    required_config_str, BackupInfo, PathResolver, StorageBackend, UploadProgressFn,
};
use crate::errors::{CoreError, CoreResult};
use crate::models::StorageUsage;
use crate::util::volume::volume_usage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const COPY_BUFFER_SIZE: usize = 32 * 1024;
const TEST_FILE_NAME: &str = ".archivist_test";

/// Stores backups on the local filesystem under a configured base directory.
#[derive(Debug)]
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub async fn initialize(
        config: &Map<String, Value>,
        resolver: &dyn PathResolver,
    ) -> CoreResult<Self> {
        let path = required_config_str(config, "path", "local")?;
        let base_path = resolver.resolve_path(&path);
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn test(&self) -> CoreResult<()> {
        let meta = fs::metadata(&self.base_path)
            .await
            .map_err(|err| CoreError::ConnectionFailed(format!("cannot access path: {err}")))?;
        if !meta.is_dir() {
            return Err(CoreError::ConnectionFailed(
                "path is not a directory".to_string(),
            ));
        }
        let test_file = self.base_path.join(TEST_FILE_NAME);
        fs::write(&test_file, b"test")
            .await
            .map_err(|err| CoreError::ConnectionFailed(format!("directory is not writable: {err}")))?;
        if let Err(err) = fs::remove_file(&test_file).await {
            tracing::warn!(error = %err, "failed to remove test file");
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
        let mut src = fs::File::open(local_path).await?;
        let total = src.metadata().await?.len() as i64;

        let dest_path = self.base_path.join(remote_path);
        if let Some(dir) = dest_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut dst = fs::File::create(&dest_path).await?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written: i64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n]).await?;
            written += n as i64;
            if let Some(progress) = progress {
                progress(written, total);
            }
        }
        dst.flush().await?;
        Ok(())
    }

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> CoreResult<Vec<BackupInfo>> {
        let base_path = self.base_path.clone();
        let prefix = prefix.to_string();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut backups = Vec::new();
            for entry in WalkDir::new(&base_path).min_depth(1) {
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                // Paths that disappear mid-walk are skipped, not fatal.
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&base_path) else {
                    continue;
                };
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if rel == TEST_FILE_NAME || !rel.starts_with(&prefix) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                let modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                backups.push(BackupInfo {
                    path: rel,
                    size: meta.len() as i64,
                    last_modified: modified.to_rfc3339(),
                    hash: String::new(),
                });
            }
            Ok(backups)
        })
        .await
        .map_err(|err| CoreError::Execution(format!("list task panicked: {err}")))?
    }

    async fn delete(&self, _cancel: &CancellationToken, remote_path: &str) -> CoreResult<()> {
        let full_path = self.base_path.join(remote_path);
        fs::remove_file(&full_path).await?;
        Ok(())
    }

    async fn get_usage(&self, _cancel: &CancellationToken) -> CoreResult<StorageUsage> {
        volume_usage(&self.base_path)
            .ok_or_else(|| CoreError::Io(std::io::Error::other("failed to get filesystem stats")))
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}
