use super::{
    connection_error, join_prefix, optional_config_str, required_config_str, strip_prefix,
    with_cancel, BackupInfo, StorageBackend, UploadProgressFn, TEST_TIMEOUT_SECS,
};
use crate::errors::{CoreError, CoreResult};
use crate::models::StorageUsage;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

const AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";
const LIST_PAGE_SIZE: u32 = 1000;

const FILE_NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Stores backups on Backblaze B2 through its native JSON API.
#[derive(Debug)]
pub struct B2Backend {
    http: reqwest::Client,
    prefix: String,
    api_url: String,
    auth_token: String,
    bucket_id: String,
    bucket_name: String,
    // Upload URLs are single-use leases handed out by the API.
    upload_lease: Mutex<Option<UploadUrl>>,
}

impl B2Backend {
    pub async fn initialize(config: &Map<String, Value>) -> CoreResult<Self> {
        let bucket_name = required_config_str(config, "bucket", "B2")?;
        let prefix = optional_config_str(config, "prefix").unwrap_or_default();
        let key_id = required_config_str(config, "key_id", "B2")?;
        let application_key = required_config_str(config, "application_key", "B2")?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| connection_error("failed to build http client", err))?;

        let credentials = Base64.encode(format!("{key_id}:{application_key}"));
        let response = http
            .get(AUTHORIZE_URL)
            .header("Authorization", format!("Basic {credentials}"))
            .send()
            .await
            .map_err(|err| connection_error("failed to authorize B2 account", err))?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to authorize B2 account",
                response.status(),
            ));
        }
        let auth: AuthorizeAccount = response
            .json()
            .await
            .map_err(|err| connection_error("failed to parse B2 authorization", err))?;

        let bucket_id =
            resolve_bucket_id(&http, &auth, &bucket_name).await?;

        Ok(Self {
            http,
            prefix,
            api_url: auth.api_url,
            auth_token: auth.authorization_token,
            bucket_id,
            bucket_name,
            upload_lease: Mutex::new(None),
        })
    }

    async fn api_call<T: serde::de::DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        body: Value,
    ) -> CoreResult<T> {
        let url = format!("{}/b2api/v2/{operation}", self.api_url);
        let request = self
            .http
            .post(&url)
            .header("Authorization", self.auth_token.as_str())
            .json(&body);
        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("b2 request failed", err))
        })
        .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                &format!("b2 {operation} failed"),
                response.status(),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| connection_error("failed to parse b2 response", err))
    }

    async fn take_upload_url(&self, cancel: &CancellationToken) -> CoreResult<UploadUrl> {
        if let Some(lease) = self.upload_lease.lock().await.take() {
            return Ok(lease);
        }
        self.api_call(
            cancel,
            "b2_get_upload_url",
            json!({ "bucketId": self.bucket_id }),
        )
        .await
    }

    async fn list_page(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
        start_file_name: Option<&str>,
    ) -> CoreResult<ListFileNames> {
        let mut body = json!({
            "bucketId": self.bucket_id,
            "prefix": prefix,
            "maxFileCount": LIST_PAGE_SIZE,
        });
        if let Some(start) = start_file_name {
            body["startFileName"] = json!(start);
        }
        self.api_call(cancel, "b2_list_file_names", body).await
    }

    async fn list_all(
        &self,
        cancel: &CancellationToken,
        full_prefix: &str,
    ) -> CoreResult<Vec<B2File>> {
        let mut files = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let page = self.list_page(cancel, full_prefix, start.as_deref()).await?;
            files.extend(page.files);
            match page.next_file_name {
                Some(next) => start = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    async fn find_file(
        &self,
        cancel: &CancellationToken,
        file_name: &str,
    ) -> CoreResult<Option<B2File>> {
        let page = self.list_page(cancel, file_name, None).await?;
        Ok(page
            .files
            .into_iter()
            .find(|file| file.file_name == file_name))
    }
}

#[async_trait]
impl StorageBackend for B2Backend {
    async fn test(&self) -> CoreResult<()> {
        let cancel = CancellationToken::new();
        let check = self.list_page(&cancel, &self.prefix, None);
        timeout(Duration::from_secs(TEST_TIMEOUT_SECS), check)
            .await
            .map_err(|_| CoreError::ConnectionFailed("bucket check timed out".to_string()))?
            .map_err(|err| {
                CoreError::ConnectionFailed(format!(
                    "cannot access bucket {}: {err}",
                    self.bucket_name
                ))
            })?;
        Ok(())
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        remote_path: &str,
        progress: Option<&UploadProgressFn>,
    ) -> CoreResult<()> {
        let file_name = join_prefix(&self.prefix, remote_path);
        let body = tokio::fs::read(local_path).await?;
        let total = body.len() as i64;
        let sha1 = hex::encode(Sha1::digest(&body));

        let lease = self.take_upload_url(cancel).await?;
        let encoded_name = encode_file_name(&file_name);
        let request = self
            .http
            .post(&lease.upload_url)
            .header("Authorization", lease.authorization_token.as_str())
            .header("X-Bz-File-Name", encoded_name)
            .header("Content-Type", "b2/x-auto")
            .header("X-Bz-Content-Sha1", sha1)
            .body(body);
        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("failed to upload to B2", err))
        })
        .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to upload to B2",
                response.status(),
            ));
        }
        // A successful upload leaves the lease reusable.
        *self.upload_lease.lock().await = Some(lease);
        if let Some(progress) = progress {
            progress(total, total);
        }
        Ok(())
    }

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> CoreResult<Vec<BackupInfo>> {
        let full_prefix = join_prefix(&self.prefix, prefix);
        let files = self.list_all(cancel, &full_prefix).await?;
        Ok(files
            .into_iter()
            .map(|file| BackupInfo {
                path: strip_prefix(&self.prefix, &file.file_name),
                size: file.content_length,
                last_modified: upload_timestamp_to_rfc3339(file.upload_timestamp),
                hash: file.content_sha1.unwrap_or_default(),
            })
            .collect())
    }

    async fn delete(&self, cancel: &CancellationToken, remote_path: &str) -> CoreResult<()> {
        let file_name = join_prefix(&self.prefix, remote_path);
        let file = self
            .find_file(cancel, &file_name)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("file not found: {remote_path}")))?;
        let _: Value = self
            .api_call(
                cancel,
                "b2_delete_file_version",
                json!({ "fileId": file.file_id, "fileName": file.file_name }),
            )
            .await?;
        Ok(())
    }

    async fn get_usage(&self, cancel: &CancellationToken) -> CoreResult<StorageUsage> {
        let files = self.list_all(cancel, &self.prefix).await?;
        Ok(StorageUsage {
            used: files.iter().map(|f| f.content_length).sum(),
            total: -1,
        })
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}

async fn resolve_bucket_id(
    http: &reqwest::Client,
    auth: &AuthorizeAccount,
    bucket_name: &str,
) -> CoreResult<String> {
    let url = format!("{}/b2api/v2/b2_list_buckets", auth.api_url);
    let response = http
        .post(&url)
        .header("Authorization", auth.authorization_token.as_str())
        .json(&json!({
            "accountId": auth.account_id,
            "bucketName": bucket_name,
        }))
        .send()
        .await
        .map_err(|err| connection_error("failed to access bucket", err))?;
    if !response.status().is_success() {
        return Err(connection_error(
            "failed to access bucket",
            response.status(),
        ));
    }
    let buckets: ListBuckets = response
        .json()
        .await
        .map_err(|err| connection_error("failed to parse bucket list", err))?;
    buckets
        .buckets
        .into_iter()
        .find(|bucket| bucket.bucket_name == bucket_name)
        .map(|bucket| bucket.bucket_id)
        .ok_or_else(|| CoreError::ConnectionFailed(format!("bucket not found: {bucket_name}")))
}

/// B2 file names travel in a header and must be percent-encoded, slashes
/// excepted.
fn encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, FILE_NAME_ENCODE_SET).to_string()
}

fn upload_timestamp_to_rfc3339(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccount {
    account_id: String,
    authorization_token: String,
    api_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBuckets {
    buckets: Vec<BucketEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketEntry {
    bucket_id: String,
    bucket_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrl {
    upload_url: String,
    authorization_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNames {
    files: Vec<B2File>,
    #[serde(default)]
    next_file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct B2File {
    file_id: String,
    file_name: String,
    content_length: i64,
    #[serde(default)]
    content_sha1: Option<String>,
    upload_timestamp: i64,
}
