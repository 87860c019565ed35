use super::gauth::{credentials_from_config, TokenSource};
use super::{
    connection_error, optional_config_str, with_cancel, BackupInfo, PathResolver, StorageBackend,
    UploadProgressFn, TEST_TIMEOUT_SECS,
};
use crate::errors::{CoreError, CoreResult};
use crate::models::StorageUsage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const DEFAULT_FOLDER_NAME: &str = "archivist-backups";
const LIST_PAGE_SIZE: u32 = 100;

/// Stores backups in a Google Drive folder. Uploading a name that already
/// exists in the folder replaces that file's content.
#[derive(Debug)]
pub struct GdriveBackend {
    http: reqwest::Client,
    token: TokenSource,
    folder_id: String,
}

impl GdriveBackend {
    pub async fn initialize(
        config: &Map<String, Value>,
        resolver: &dyn PathResolver,
    ) -> CoreResult<Self> {
        let Some(credentials) = credentials_from_config(config, resolver) else {
            return Err(CoreError::Validation(
                "google Drive backend requires 'credentials_file' or 'credentials_json' configuration"
                    .to_string(),
            ));
        };
        let token = TokenSource::new(credentials, DRIVE_SCOPE)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| connection_error("failed to build http client", err))?;

        let mut backend = Self {
            http,
            token,
            folder_id: String::new(),
        };
        backend.folder_id = match optional_config_str(config, "folder_id") {
            Some(folder_id) => folder_id,
            None => {
                let folder_name = optional_config_str(config, "folder_name")
                    .unwrap_or_else(|| DEFAULT_FOLDER_NAME.to_string());
                backend.find_or_create_folder(&folder_name).await?
            }
        };
        Ok(backend)
    }

    async fn find_or_create_folder(&self, name: &str) -> CoreResult<String> {
        let cancel = CancellationToken::new();
        let query = format!(
            "name='{}' and mimeType='{FOLDER_MIME_TYPE}' and trashed=false",
            escape_query_value(name)
        );
        let found = self.files_page(&cancel, &query, "files(id, name)", None).await?;
        if let Some(folder) = found.files.into_iter().next() {
            return Ok(folder.id);
        }

        let bearer = self.bearer(&cancel).await?;
        let request = self
            .http
            .post(format!("{API_BASE}/files"))
            .query(&[("fields", "id")])
            .header("Authorization", bearer)
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME_TYPE }));
        let response = with_cancel(&cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("failed to create folder", err))
        })
        .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to create folder",
                response.status(),
            ));
        }
        let created: DriveFile = response
            .json()
            .await
            .map_err(|err| connection_error("failed to parse folder response", err))?;
        Ok(created.id)
    }

    async fn bearer(&self, cancel: &CancellationToken) -> CoreResult<String> {
        Ok(format!("Bearer {}", self.token.token(cancel).await?))
    }

    async fn files_page(
        &self,
        cancel: &CancellationToken,
        query: &str,
        fields: &str,
        page_token: Option<&str>,
    ) -> CoreResult<FileList> {
        let bearer = self.bearer(cancel).await?;
        let mut params = vec![
            ("q".to_string(), query.to_string()),
            ("spaces".to_string(), "drive".to_string()),
            ("fields".to_string(), fields.to_string()),
            ("pageSize".to_string(), LIST_PAGE_SIZE.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken".to_string(), token.to_string()));
        }
        let request = self
            .http
            .get(format!("{API_BASE}/files"))
            .query(&params)
            .header("Authorization", bearer);
        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("drive request failed", err))
        })
        .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to list files",
                response.status(),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| connection_error("failed to parse file list", err))
    }

    async fn find_file_in_folder(
        &self,
        cancel: &CancellationToken,
        file_name: &str,
    ) -> CoreResult<Option<String>> {
        let query = format!(
            "name='{}' and '{}' in parents and trashed=false",
            escape_query_value(file_name),
            self.folder_id
        );
        let page = self.files_page(cancel, &query, "files(id)", None).await?;
        Ok(page.files.into_iter().next().map(|file| file.id))
    }

    async fn folder_files(&self, cancel: &CancellationToken) -> CoreResult<Vec<DriveFile>> {
        let query = format!("'{}' in parents and trashed=false", self.folder_id);
        let fields = "nextPageToken, files(id, name, size, modifiedTime, md5Checksum)";
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .files_page(cancel, &query, fields, page_token.as_deref())
                .await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl StorageBackend for GdriveBackend {
    async fn test(&self) -> CoreResult<()> {
        let cancel = CancellationToken::new();
        let check = async {
            let bearer = self.bearer(&cancel).await?;
            let request = self
                .http
                .get(format!("{API_BASE}/files/{}", self.folder_id))
                .query(&[("fields", "id, name")])
                .header("Authorization", bearer);
            request
                .send()
                .await
                .map_err(|err| connection_error("cannot access folder", err))
        };
        let response = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), check)
            .await
            .map_err(|_| CoreError::ConnectionFailed("folder check timed out".to_string()))??;
        if !response.status().is_success() {
            return Err(connection_error("cannot access folder", response.status()));
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
        let file_name = base_name(remote_path);
        let content = tokio::fs::read(local_path).await?;
        let total = content.len() as i64;
        let existing = self.find_file_in_folder(cancel, file_name).await?;
        let bearer = self.bearer(cancel).await?;

        let request = match existing {
            // Same name in the folder: replace content, keeping identity.
            Some(file_id) => self
                .http
                .patch(format!("{UPLOAD_BASE}/files/{file_id}"))
                .query(&[("uploadType", "media")])
                .header("Authorization", bearer)
                .header("Content-Type", "application/octet-stream")
                .body(content),
            None => {
                let metadata = json!({
                    "name": file_name,
                    "parents": [self.folder_id],
                });
                let boundary = format!("archivist-{}", Uuid::new_v4().simple());
                let body =
                    super::gcs::multipart_related_body(&boundary, &metadata.to_string(), &content);
                self.http
                    .post(format!("{UPLOAD_BASE}/files"))
                    .query(&[("uploadType", "multipart")])
                    .header("Authorization", bearer)
                    .header(
                        "Content-Type",
                        format!("multipart/related; boundary={boundary}"),
                    )
                    .body(body)
            }
        };

        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("failed to upload to Google Drive", err))
        })
        .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to upload to Google Drive",
                response.status(),
            ));
        }
        if let Some(progress) = progress {
            progress(total, total);
        }
        Ok(())
    }

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> CoreResult<Vec<BackupInfo>> {
        let files = self.folder_files(cancel).await?;
        Ok(files
            .into_iter()
            // Drive has no real prefix listing; filter the folder contents.
            .filter(|file| prefix.is_empty() || file.name.starts_with(prefix))
            .map(|file| BackupInfo {
                path: file.name.clone(),
                size: file.size_bytes(),
                last_modified: file.modified_time.unwrap_or_default(),
                hash: file.md5_checksum.unwrap_or_default(),
            })
            .collect())
    }

    async fn delete(&self, cancel: &CancellationToken, remote_path: &str) -> CoreResult<()> {
        let file_name = base_name(remote_path);
        let file_id = self
            .find_file_in_folder(cancel, file_name)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("file not found: {remote_path}")))?;
        let bearer = self.bearer(cancel).await?;
        let request = self
            .http
            .delete(format!("{API_BASE}/files/{file_id}"))
            .header("Authorization", bearer);
        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("failed to delete from Google Drive", err))
        })
        .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to delete from Google Drive",
                response.status(),
            ));
        }
        Ok(())
    }

    async fn get_usage(&self, cancel: &CancellationToken) -> CoreResult<StorageUsage> {
        let files = self.folder_files(cancel).await?;
        let used = files.iter().map(|file| file.size_bytes()).sum();

        let bearer = self.bearer(cancel).await?;
        let request = self
            .http
            .get(format!("{API_BASE}/about"))
            .query(&[("fields", "storageQuota")])
            .header("Authorization", bearer);
        let response = with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("failed to read quota", err))
        })
        .await;

        let total = match response {
            Ok(response) if response.status().is_success() => response
                .json::<About>()
                .await
                .ok()
                .and_then(|about| about.storage_quota.limit)
                .and_then(|limit| limit.parse().ok())
                .unwrap_or(-1),
            _ => -1,
        };
        Ok(StorageUsage { used, total })
    }

    async fn close(&self) -> CoreResult<()> {
        Ok(())
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    // Drive reports sizes as decimal strings.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    md5_checksum: Option<String>,
}

impl DriveFile {
    fn size_bytes(&self) -> i64 {
        self.size
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    storage_quota: StorageQuota,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageQuota {
    #[serde(default)]
    limit: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{base_name, escape_query_value, About, FileList, GdriveBackend};
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
    async fn initialize_requires_credentials() {
        let config = json!({ "folder_id": "folder-1" });
        let err = GdriveBackend::initialize(config.as_object().expect("object"), &FixedResolver)
            .await
            .expect_err("credentials");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("credentials_file"));
    }

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("a/b/c.tar.gz"), "c.tar.gz");
        assert_eq!(base_name("c.tar.gz"), "c.tar.gz");
    }

    #[test]
    fn query_values_escape_quotes() {
        assert_eq!(escape_query_value("it's"), "it\\'s");
        assert_eq!(escape_query_value("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn file_list_parses_sizes_and_pagination() {
        let list: FileList = serde_json::from_value(json!({
            "files": [
                {
                    "id": "id-1",
                    "name": "daily.tar.gz",
                    "size": "8192",
                    "modifiedTime": "2025-01-01T00:00:00.000Z",
                    "md5Checksum": "abc",
                },
                { "id": "id-2", "name": "folder-entry" },
            ],
            "nextPageToken": "page2",
        }))
        .expect("parse");
        assert_eq!(list.files.len(), 2);
        assert_eq!(list.files[0].size_bytes(), 8192);
        assert_eq!(list.files[1].size_bytes(), 0);
        assert_eq!(list.next_page_token.as_deref(), Some("page2"));
    }

    #[test]
    fn about_quota_parses_optional_limit() {
        let about: About = serde_json::from_value(json!({
            "storageQuota": { "limit": "1099511627776", "usage": "12345" },
        }))
        .expect("parse");
        assert_eq!(about.storage_quota.limit.as_deref(), Some("1099511627776"));

        let unlimited: About = serde_json::from_value(json!({ "storageQuota": {} }))
            .expect("parse unlimited");
        assert!(unlimited.storage_quota.limit.is_none());
    }
}
