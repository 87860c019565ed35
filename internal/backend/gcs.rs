use super::gauth::{credentials_from_config, Credentials, TokenSource};
use super::{
    connection_error, join_prefix, optional_config_str, required_config_str, strip_prefix,
    with_cancel, BackupInfo, PathResolver, StorageBackend, UploadProgressFn, TEST_TIMEOUT_SECS,
};
use crate::errors::{CoreError, CoreResult};
use crate::models::StorageUsage;
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";
const LIST_PAGE_SIZE: u32 = 1000;

const VALID_STORAGE_CLASSES: &[&str] = &[
    "STANDARD",
    "NEARLINE",
    "COLDLINE",
    "ARCHIVE",
    "REGIONAL",
    "MULTI_REGIONAL",
    "DURABLE_REDUCED_AVAILABILITY",
];

/// Object names in resource paths are fully encoded, slashes included.
const OBJECT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Stores backups in a Google Cloud Storage bucket via the JSON API.
#[derive(Debug)]
pub struct GcsBackend {
    http: reqwest::Client,
    token: TokenSource,
    bucket: String,
    prefix: String,
    storage_class: Option<String>,
}

impl GcsBackend {
    pub async fn initialize(
        config: &Map<String, Value>,
        resolver: &dyn PathResolver,
    ) -> CoreResult<Self> {
        let bucket = required_config_str(config, "bucket", "GCS")?;
        let prefix = optional_config_str(config, "prefix").unwrap_or_default();
        let storage_class = match optional_config_str(config, "storage_tier") {
            Some(tier) => Some(validate_storage_class(&tier)?),
            None => None,
        };
        let credentials =
            credentials_from_config(config, resolver).unwrap_or(Credentials::Adc);
        let token = TokenSource::new(credentials, STORAGE_SCOPE)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| connection_error("failed to build http client", err))?;
        Ok(Self {
            http,
            token,
            bucket,
            prefix,
            storage_class,
        })
    }

    async fn bearer(&self, cancel: &CancellationToken) -> CoreResult<String> {
        Ok(format!("Bearer {}", self.token.token(cancel).await?))
    }

    async fn list_page(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
        page_token: Option<&str>,
    ) -> CoreResult<ObjectList> {
        let bearer = self.bearer(cancel).await?;
        let mut query = vec![
            ("prefix".to_string(), prefix.to_string()),
            ("maxResults".to_string(), LIST_PAGE_SIZE.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken".to_string(), token.to_string()));
        }
        let request = self
            .http
            .get(format!("{API_BASE}/b/{}/o", self.bucket))
            .query(&query)
            .header("Authorization", bearer);
        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("gcs request failed", err))
        })
        .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to list objects",
                response.status(),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| connection_error("failed to parse list response", err))
    }

    async fn list_all(
        &self,
        cancel: &CancellationToken,
        full_prefix: &str,
    ) -> CoreResult<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_page(cancel, full_prefix, page_token.as_deref())
                .await?;
            for object in page.items {
                backups.push(BackupInfo {
                    path: strip_prefix(&self.prefix, &object.name),
                    size: object.size_bytes(),
                    last_modified: object.updated,
                    hash: object
                        .md5_hash
                        .map(|hash| format!("md5:{hash}"))
                        .unwrap_or_default(),
                });
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(backups)
    }
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn test(&self) -> CoreResult<()> {
        let cancel = CancellationToken::new();
        let check = async {
            let bearer = self.bearer(&cancel).await?;
            let request = self
                .http
                .get(format!("{API_BASE}/b/{}", self.bucket))
                .header("Authorization", bearer);
            request
                .send()
                .await
                .map_err(|err| connection_error("cannot access bucket", err))
        };
        let response = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), check)
            .await
            .map_err(|_| CoreError::ConnectionFailed("bucket check timed out".to_string()))??;
        if !response.status().is_success() {
            return Err(connection_error("cannot access bucket", response.status()));
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
        let key = join_prefix(&self.prefix, remote_path);
        let content = tokio::fs::read(local_path).await?;
        let total = content.len() as i64;

        // Multipart (metadata + media) upload so the storage class applies.
        let mut metadata = json!({ "name": key });
        if let Some(class) = &self.storage_class {
            metadata["storageClass"] = json!(class);
        }
        let boundary = format!("archivist-{}", Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, &metadata.to_string(), &content);

        let bearer = self.bearer(cancel).await?;
        let request = self
            .http
            .post(format!("{UPLOAD_BASE}/b/{}/o", self.bucket))
            .query(&[("uploadType", "multipart")])
            .header("Authorization", bearer)
            .header(
                "Content-Type",
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body);
        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("failed to upload to GCS", err))
        })
        .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to upload to GCS",
                response.status(),
            ));
        }
        if let Some(progress) = progress {
            progress(total, total);
        }
        Ok(())
    }

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> CoreResult<Vec<BackupInfo>> {
        let full_prefix = join_prefix(&self.prefix, prefix);
        self.list_all(cancel, &full_prefix).await
    }

    async fn delete(&self, cancel: &CancellationToken, remote_path: &str) -> CoreResult<()> {
        let key = join_prefix(&self.prefix, remote_path);
        let bearer = self.bearer(cancel).await?;
        let request = self
            .http
            .delete(format!(
                "{API_BASE}/b/{}/o/{}",
                self.bucket,
                encode_object_name(&key)
            ))
            .header("Authorization", bearer);
        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("failed to delete from GCS", err))
        })
        .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to delete from GCS",
                response.status(),
            ));
        }
        Ok(())
    }

    async fn get_usage(&self, cancel: &CancellationToken) -> CoreResult<StorageUsage> {
        let backups = self.list_all(cancel, &self.prefix).await?;
        Ok(StorageUsage {
            used: backups.iter().map(|b| b.size).sum(),
            total: -1,
        })
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}

fn validate_storage_class(tier: &str) -> CoreResult<String> {
    let upper = tier.to_uppercase();
    if VALID_STORAGE_CLASSES.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(CoreError::Validation(format!(
            "invalid GCS storage class: {tier} (valid options: STANDARD, NEARLINE, COLDLINE, ARCHIVE)"
        )))
    }
}

fn encode_object_name(name: &str) -> String {
    utf8_percent_encode(name, OBJECT_ENCODE_SET).to_string()
}

/// RFC 2387 multipart/related body carrying JSON metadata and raw content.
pub(crate) fn multipart_related_body(boundary: &str, metadata: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + metadata.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!("--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectEntry {
    name: String,
    // The JSON API reports sizes as decimal strings.
    #[serde(default)]
    size: Option<String>,
    updated: String,
    #[serde(default)]
    md5_hash: Option<String>,
}

impl ObjectEntry {
    fn size_bytes(&self) -> i64 {
        self.size
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        encode_object_name, multipart_related_body, validate_storage_class, GcsBackend, ObjectList,
    };
    use crate::backend::PathResolver;
    use serde_json::json;
    use std::path::PathBuf;

    struct FixedResolver;

    impl PathResolver for FixedResolver {
        fn resolve_path(&self, path: &str) -> PathBuf {
            PathBuf::from(path)
        }
    }

    #[tokio::test]
    async fn initialize_requires_bucket() {
        let config = json!({});
        let err = GcsBackend::initialize(config.as_object().expect("object"), &FixedResolver)
            .await
            .expect_err("bucket");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("bucket"));
    }

    #[tokio::test]
    async fn initialize_without_credentials_falls_back_to_adc() {
        let config = json!({ "bucket": "backups" });
        GcsBackend::initialize(config.as_object().expect("object"), &FixedResolver)
            .await
            .expect("adc fallback");
    }

    #[tokio::test]
    async fn initialize_validates_storage_tier() {
        let config = json!({ "bucket": "backups", "storage_tier": "FROZEN" });
        let err = GcsBackend::initialize(config.as_object().expect("object"), &FixedResolver)
            .await
            .expect_err("tier");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn storage_class_accepts_legacy_names() {
        assert_eq!(validate_storage_class("nearline").expect("ok"), "NEARLINE");
        assert_eq!(validate_storage_class("Regional").expect("ok"), "REGIONAL");
        assert!(validate_storage_class("warm").is_err());
    }

    #[test]
    fn object_names_encode_slashes() {
        assert_eq!(encode_object_name("pre/daily.tar.gz"), "pre%2Fdaily.tar.gz");
    }

    #[test]
    fn multipart_body_wraps_metadata_and_content() {
        let body = multipart_related_body("b-1", r#"{"name":"x"}"#, b"payload");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--b-1\r\nContent-Type: application/json"));
        assert!(text.contains(r#"{"name":"x"}"#));
        assert!(text.contains("Content-Type: application/octet-stream\r\n\r\npayload"));
        assert!(text.ends_with("--b-1--\r\n"));
    }

    #[test]
    fn object_list_parses_string_sizes() {
        let list: ObjectList = serde_json::from_value(json!({
            "items": [
                {
                    "name": "pre/daily.tar.gz",
                    "size": "2048",
                    "updated": "2025-01-01T00:00:00.000Z",
                    "md5Hash": "hash==",
                },
                {
                    "name": "pre/other.tar.gz",
                    "updated": "2025-01-02T00:00:00.000Z",
                },
            ],
            "nextPageToken": "page2",
        }))
        .expect("parse");
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.items[0].size_bytes(), 2048);
        assert_eq!(list.items[1].size_bytes(), 0);
        assert_eq!(list.next_page_token.as_deref(), Some("page2"));
    }
}
