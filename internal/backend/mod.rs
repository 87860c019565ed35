use crate::errors::{CoreError, CoreResult};
use crate::models::{Backend, BackendKind, StorageUsage};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub mod azure;
pub mod b2;
pub mod gauth;
pub mod gcs;
pub mod gdrive;
pub mod local;
pub mod s3;

/// Wall-clock bound for connectivity tests.
pub(crate) const TEST_TIMEOUT_SECS: u64 = 10;

/// Called with monotonically increasing uploaded bytes; a final call with
/// `uploaded == total` is allowed but not guaranteed by every store.
pub type UploadProgressFn = dyn Fn(i64, i64) + Send + Sync;

/// One stored object as reported by a backend listing. Paths are logical
/// (backend-local prefix stripped) and use forward slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub path: String,
    pub size: i64,
    pub last_modified: String,
    pub hash: String,
}

/// Resolves relative paths against the configured root directory.
pub trait PathResolver: Send + Sync {
    fn resolve_path(&self, path: &str) -> PathBuf;
}

impl PathResolver for crate::config::ConfigStore {
    fn resolve_path(&self, path: &str) -> PathBuf {
        crate::config::ConfigStore::resolve_path(self, path)
    }
}

/// Capability contract satisfied by every store. Construction and credential
/// checks happen in each kind's `initialize`; the factory is the only caller.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fails when the remote endpoint is unreachable or the target
    /// bucket/container/folder is inaccessible. Bounded to ~10 s.
    async fn test(&self) -> CoreResult<()>;

    async fn upload(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        remote_path: &str,
        progress: Option<&UploadProgressFn>,
    ) -> CoreResult<()>;

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> CoreResult<Vec<BackupInfo>>;

    async fn delete(&self, cancel: &CancellationToken, remote_path: &str) -> CoreResult<()>;

    async fn get_usage(&self, cancel: &CancellationToken) -> CoreResult<StorageUsage>;

    async fn close(&self) -> CoreResult<()>;
}

/// Hands out initialized backend instances. The executor goes through this
/// seam so runs never name a concrete store type.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    async fn connect(&self, backend: &Backend) -> CoreResult<Box<dyn StorageBackend>>;
}

/// Production provider: delegates to [`factory`] with the config store as the
/// path resolver.
pub struct FactoryProvider {
    resolver: std::sync::Arc<crate::config::ConfigStore>,
}

impl FactoryProvider {
    pub fn new(resolver: std::sync::Arc<crate::config::ConfigStore>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl BackendProvider for FactoryProvider {
    async fn connect(&self, backend: &Backend) -> CoreResult<Box<dyn StorageBackend>> {
        factory(backend, self.resolver.as_ref()).await
    }
}

/// Build an initialized backend from its config record. Callers own the
/// returned instance and must `close()` it on every exit path.
pub async fn factory(
    backend: &Backend,
    resolver: &dyn PathResolver,
) -> CoreResult<Box<dyn StorageBackend>> {
    match backend.kind {
        BackendKind::Local => Ok(Box::new(
            local::LocalBackend::initialize(&backend.config, resolver).await?,
        )),
        BackendKind::S3 => Ok(Box::new(s3::S3Backend::initialize(&backend.config).await?)),
        BackendKind::Gcs => Ok(Box::new(
            gcs::GcsBackend::initialize(&backend.config, resolver).await?,
        )),
        BackendKind::Gdrive => Ok(Box::new(
            gdrive::GdriveBackend::initialize(&backend.config, resolver).await?,
        )),
        BackendKind::Azure => Ok(Box::new(
            azure::AzureBackend::initialize(&backend.config).await?,
        )),
        BackendKind::B2 => Ok(Box::new(b2::B2Backend::initialize(&backend.config).await?)),
    }
}

/// Read a required string key from a backend config map.
pub(crate) fn required_config_str(
    config: &Map<String, Value>,
    key: &str,
    kind: &str,
) -> CoreResult<String> {
    match optional_config_str(config, key) {
        Some(value) => Ok(value),
        None => Err(CoreError::Validation(format!(
            "{kind} backend requires '{key}' configuration"
        ))),
    }
}

/// Read an optional non-empty string key from a backend config map.
pub(crate) fn optional_config_str(config: &Map<String, Value>, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Prepend the backend-local prefix to a logical path.
pub(crate) fn join_prefix(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else if path.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}

/// Strip the backend-local prefix from a stored path, yielding the logical
/// path handed back to callers.
pub(crate) fn strip_prefix(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        return path.to_string();
    }
    match path.strip_prefix(&format!("{prefix}/")) {
        Some(rest) => rest.to_string(),
        None => path.to_string(),
    }
}

/// Race a backend operation against the run's cancellation token.
pub(crate) async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(CoreError::Cancelled),
        result = fut => result,
    }
}

pub(crate) fn connection_error(context: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::ConnectionFailed(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{join_prefix, optional_config_str, required_config_str, strip_prefix, with_cancel};
    use crate::errors::CoreError;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn config() -> serde_json::Map<String, serde_json::Value> {
        let value = json!({
            "bucket": "backups",
            "empty": "",
            "number": 7,
        });
        value.as_object().expect("object").clone()
    }

    #[test]
    fn required_config_str_accepts_non_empty_strings() {
        let cfg = config();
        assert_eq!(
            required_config_str(&cfg, "bucket", "s3").expect("bucket"),
            "backups"
        );
        for key in ["empty", "number", "missing"] {
            let err = required_config_str(&cfg, key, "s3").expect_err(key);
            assert_eq!(err.code(), "VALIDATION_ERROR");
            assert!(err.to_string().contains(key));
        }
    }

    #[test]
    fn optional_config_str_filters_empty_values() {
        let cfg = config();
        assert_eq!(optional_config_str(&cfg, "bucket").as_deref(), Some("backups"));
        assert_eq!(optional_config_str(&cfg, "empty"), None);
        assert_eq!(optional_config_str(&cfg, "missing"), None);
    }

    #[test]
    fn prefix_join_and_strip_are_inverses() {
        assert_eq!(join_prefix("", "a/b"), "a/b");
        assert_eq!(join_prefix("backups", ""), "backups");
        assert_eq!(join_prefix("backups", "a/b"), "backups/a/b");
        assert_eq!(strip_prefix("backups", "backups/a/b"), "a/b");
        assert_eq!(strip_prefix("", "a/b"), "a/b");
        assert_eq!(strip_prefix("backups", "elsewhere/a"), "elsewhere/a");
    }

    #[tokio::test]
    async fn with_cancel_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), CoreError> =
            with_cancel(&cancel, std::future::pending()).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn with_cancel_passes_through_results() {
        let cancel = CancellationToken::new();
        let result = with_cancel(&cancel, async { Ok::<_, CoreError>(21) })
            .await
            .expect("value");
        assert_eq!(result, 21);
    }
}
