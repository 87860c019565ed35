use super::{
    connection_error, join_prefix, optional_config_str, required_config_str, strip_prefix,
    with_cancel, BackupInfo, StorageBackend, UploadProgressFn, TEST_TIMEOUT_SECS,
};
use crate::errors::{CoreError, CoreResult};
use crate::models::StorageUsage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

const DEFAULT_REGION: &str = "us-east-1";
const MULTIPART_THRESHOLD: i64 = 16 * 1024 * 1024;
const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

const VALID_STORAGE_CLASSES: &[&str] = &[
    "STANDARD",
    "REDUCED_REDUNDANCY",
    "STANDARD_IA",
    "ONEZONE_IA",
    "INTELLIGENT_TIERING",
    "GLACIER",
    "GLACIER_IR",
    "DEEP_ARCHIVE",
];

/// AWS URI encoding: everything except unreserved characters.
const AWS_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Stores backups on AWS S3 or any S3-compatible endpoint (MinIO, Spaces).
#[derive(Debug)]
pub struct S3Backend {
    http: reqwest::Client,
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Option<String>,
    access_key: String,
    secret_key: String,
    storage_class: String,
}

impl S3Backend {
    pub async fn initialize(config: &Map<String, Value>) -> CoreResult<Self> {
        let bucket = required_config_str(config, "bucket", "S3")?;
        let prefix = optional_config_str(config, "prefix").unwrap_or_default();
        let region =
            optional_config_str(config, "region").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let endpoint =
            optional_config_str(config, "endpoint").map(|e| e.trim_end_matches('/').to_string());

        let access_key = optional_config_str(config, "access_key_id")
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty()));
        let secret_key = optional_config_str(config, "secret_access_key").or_else(|| {
            std::env::var("AWS_SECRET_ACCESS_KEY")
                .ok()
                .filter(|v| !v.is_empty())
        });
        let (Some(access_key), Some(secret_key)) = (access_key, secret_key) else {
            return Err(CoreError::Validation(
                "S3 backend requires 'access_key_id' and 'secret_access_key' configuration"
                    .to_string(),
            ));
        };

        let storage_class = match optional_config_str(config, "storage_tier") {
            Some(tier) => validate_storage_class(&tier)?,
            None => "STANDARD".to_string(),
        };

        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| connection_error("failed to build http client", err))?;

        Ok(Self {
            http,
            bucket,
            prefix,
            region,
            endpoint,
            access_key,
            secret_key,
            storage_class,
        })
    }

    /// Request URL and canonical URI path for an object key ("" addresses the
    /// bucket itself). Custom endpoints use path-style addressing.
    fn object_url(&self, key: &str) -> (String, String) {
        let encoded = encode_key(key);
        match &self.endpoint {
            Some(endpoint) => {
                let uri = if encoded.is_empty() {
                    format!("/{}/", self.bucket)
                } else {
                    format!("/{}/{}", self.bucket, encoded)
                };
                (format!("{endpoint}{uri}"), uri)
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let uri = format!("/{encoded}");
                (format!("https://{host}{uri}"), uri)
            }
        }
    }

    fn host_for_uri(&self, url: &str) -> CoreResult<String> {
        let parsed = url::Url::parse(url)
            .map_err(|err| CoreError::Validation(format!("invalid endpoint URL: {err}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| CoreError::Validation("endpoint URL is missing host".to_string()))?;
        Ok(match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    async fn send_signed(
        &self,
        cancel: &CancellationToken,
        method: reqwest::Method,
        key: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        body: Vec<u8>,
    ) -> CoreResult<reqwest::Response> {
        let (mut url, uri_path) = self.object_url(key);
        let canonical_query = canonical_query(query);
        if !canonical_query.is_empty() {
            url = format!("{url}?{canonical_query}");
        }
        let host = self.host_for_uri(&url)?;
        let payload_hash = hex::encode(Sha256::digest(&body));
        let now = Utc::now();
        let headers = self.sign(
            method.as_str(),
            &uri_path,
            &canonical_query,
            &host,
            extra_headers,
            &payload_hash,
            now,
        );

        let mut request = self.http.request(method, &url).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("s3 request failed", err))
        })
        .await
    }

    /// Full header set for a SigV4-signed request, Authorization included.
    #[allow(clippy::too_many_arguments)]
    fn sign(
        &self,
        method: &str,
        uri_path: &str,
        canonical_query: &str,
        host: &str,
        extra_headers: &[(String, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), host.to_string()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.extend(extra_headers.iter().cloned());
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        let canonical_request = format!(
            "{method}\n{uri_path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key
        );

        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(name, _)| name != "host")
            .collect();
        out.push(("Authorization".to_string(), authorization));
        out
    }

    async fn upload_single(
        &self,
        cancel: &CancellationToken,
        key: &str,
        body: Vec<u8>,
        progress: Option<&UploadProgressFn>,
    ) -> CoreResult<()> {
        let total = body.len() as i64;
        let headers = vec![(
            "x-amz-storage-class".to_string(),
            self.storage_class.clone(),
        )];
        let response = self
            .send_signed(cancel, reqwest::Method::PUT, key, &[], &headers, body)
            .await?;
        if !response.status().is_success() {
            return Err(connection_error("failed to upload to S3", response.status()));
        }
        if let Some(progress) = progress {
            progress(total, total);
        }
        Ok(())
    }

    async fn upload_multipart(
        &self,
        cancel: &CancellationToken,
        key: &str,
        local_path: &Path,
        total: i64,
        progress: Option<&UploadProgressFn>,
    ) -> CoreResult<()> {
        let upload_id = self.initiate_multipart(cancel, key).await?;
        match self
            .upload_parts(cancel, key, &upload_id, local_path, total, progress)
            .await
        {
            Ok(parts) => self.complete_multipart(cancel, key, &upload_id, &parts).await,
            Err(err) => {
                self.abort_multipart(key, &upload_id).await;
                Err(err)
            }
        }
    }

    async fn initiate_multipart(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> CoreResult<String> {
        let query = vec![("uploads".to_string(), String::new())];
        let headers = vec![(
            "x-amz-storage-class".to_string(),
            self.storage_class.clone(),
        )];
        let response = self
            .send_signed(cancel, reqwest::Method::POST, key, &query, &headers, Vec::new())
            .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to initiate multipart upload",
                response.status(),
            ));
        }
        let text = response
            .text()
            .await
            .map_err(|err| connection_error("failed to read multipart response", err))?;
        let initiated: InitiateMultipartUploadResult = quick_xml::de::from_str(&text)
            .map_err(|err| connection_error("failed to parse multipart response", err))?;
        Ok(initiated.upload_id)
    }

    async fn upload_parts(
        &self,
        cancel: &CancellationToken,
        key: &str,
        upload_id: &str,
        local_path: &Path,
        total: i64,
        progress: Option<&UploadProgressFn>,
    ) -> CoreResult<Vec<(u32, String)>> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut parts = Vec::new();
        let mut uploaded: i64 = 0;
        let mut part_number: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let mut chunk = vec![0u8; MULTIPART_PART_SIZE];
            let mut filled = 0;
            while filled < chunk.len() {
                let n = file.read(&mut chunk[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            chunk.truncate(filled);

            let query = vec![
                ("partNumber".to_string(), part_number.to_string()),
                ("uploadId".to_string(), upload_id.to_string()),
            ];
            let response = self
                .send_signed(cancel, reqwest::Method::PUT, key, &query, &[], chunk)
                .await?;
            if !response.status().is_success() {
                return Err(connection_error(
                    "failed to upload part",
                    response.status(),
                ));
            }
            let etag = response
                .headers()
                .get("ETag")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            parts.push((part_number, etag));

            uploaded += filled as i64;
            if let Some(progress) = progress {
                progress(uploaded, total);
            }
            if filled < MULTIPART_PART_SIZE {
                break;
            }
            part_number += 1;
        }
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        cancel: &CancellationToken,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> CoreResult<()> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for (number, etag) in parts {
            body.push_str(&format!(
                "<Part><PartNumber>{number}</PartNumber><ETag>{etag}</ETag></Part>"
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        let response = self
            .send_signed(
                cancel,
                reqwest::Method::POST,
                key,
                &query,
                &[],
                body.into_bytes(),
            )
            .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to complete multipart upload",
                response.status(),
            ));
        }
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        let cancel = CancellationToken::new();
        if let Err(err) = self
            .send_signed(&cancel, reqwest::Method::DELETE, key, &query, &[], Vec::new())
            .await
        {
            tracing::warn!(error = %err, upload_id, "failed to abort multipart upload");
        }
    }

    async fn list_page(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
        continuation: Option<&str>,
    ) -> CoreResult<ListBucketResult> {
        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("prefix".to_string(), prefix.to_string()),
        ];
        if let Some(token) = continuation {
            query.push(("continuation-token".to_string(), token.to_string()));
        }
        let response = self
            .send_signed(cancel, reqwest::Method::GET, "", &query, &[], Vec::new())
            .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to list objects",
                response.status(),
            ));
        }
        let text = response
            .text()
            .await
            .map_err(|err| connection_error("failed to read list response", err))?;
        quick_xml::de::from_str(&text)
            .map_err(|err| connection_error("failed to parse list response", err))
    }

    async fn list_all(
        &self,
        cancel: &CancellationToken,
        full_prefix: &str,
    ) -> CoreResult<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .list_page(cancel, full_prefix, continuation.as_deref())
                .await?;
            for object in page.contents {
                backups.push(BackupInfo {
                    path: strip_prefix(&self.prefix, &object.key),
                    size: object.size,
                    last_modified: object.last_modified,
                    hash: String::new(),
                });
            }
            if !page.is_truncated {
                break;
            }
            match page.next_continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(backups)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn test(&self) -> CoreResult<()> {
        let cancel = CancellationToken::new();
        let head = self.send_signed(&cancel, reqwest::Method::HEAD, "", &[], &[], Vec::new());
        let response = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), head)
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
        let total = tokio::fs::metadata(local_path).await?.len() as i64;
        if total > MULTIPART_THRESHOLD {
            self.upload_multipart(cancel, &key, local_path, total, progress)
                .await
        } else {
            let body = tokio::fs::read(local_path).await?;
            self.upload_single(cancel, &key, body, progress).await
        }
    }

    async fn list(&self, cancel: &CancellationToken, prefix: &str) -> CoreResult<Vec<BackupInfo>> {
        let full_prefix = join_prefix(&self.prefix, prefix);
        self.list_all(cancel, &full_prefix).await
    }

    async fn delete(&self, cancel: &CancellationToken, remote_path: &str) -> CoreResult<()> {
        let key = join_prefix(&self.prefix, remote_path);
        let response = self
            .send_signed(cancel, reqwest::Method::DELETE, &key, &[], &[], Vec::new())
            .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to delete from S3",
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
            "invalid S3 storage class: {tier} (valid values: {})",
            VALID_STORAGE_CLASSES.join(", ")
        )))
    }
}

/// Percent-encode an object key, preserving path separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, AWS_ENCODE_SET).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonical query string: pairs sorted by name, values AWS-encoded.
fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(name, value)| {
            (
                utf8_percent_encode(name, AWS_ENCODE_SET).to_string(),
                utf8_percent_encode(value, AWS_ENCODE_SET).to_string(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
    #[serde(default)]
    contents: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
    size: i64,
    last_modified: String,
}

#[cfg(test)]
mod tests {
    use super::{
        canonical_query, derive_signing_key, encode_key, validate_storage_class,
        InitiateMultipartUploadResult, ListBucketResult, S3Backend,
    };
    use serde_json::json;

    async fn backend(config: serde_json::Value) -> S3Backend {
        S3Backend::initialize(config.as_object().expect("object"))
            .await
            .expect("initialize")
    }

    #[tokio::test]
    async fn initialize_requires_bucket_and_credentials() {
        let missing_bucket = json!({
            "access_key_id": "AKIA",
            "secret_access_key": "secret",
        });
        let err = S3Backend::initialize(missing_bucket.as_object().expect("object"))
            .await
            .expect_err("bucket");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("bucket"));
    }

    #[tokio::test]
    async fn initialize_defaults_region_and_storage_class() {
        let backend = backend(json!({
            "bucket": "backups",
            "access_key_id": "AKIA",
            "secret_access_key": "secret",
        }))
        .await;
        assert_eq!(backend.region, "us-east-1");
        assert_eq!(backend.storage_class, "STANDARD");
    }

    #[tokio::test]
    async fn initialize_rejects_bad_storage_tier() {
        let config = json!({
            "bucket": "backups",
            "access_key_id": "AKIA",
            "secret_access_key": "secret",
            "storage_tier": "FROZEN",
        });
        let err = S3Backend::initialize(config.as_object().expect("object"))
            .await
            .expect_err("tier");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn storage_class_validation_is_case_insensitive() {
        assert_eq!(validate_storage_class("glacier").expect("ok"), "GLACIER");
        assert_eq!(
            validate_storage_class("Deep_Archive").expect("ok"),
            "DEEP_ARCHIVE"
        );
        assert!(validate_storage_class("bogus").is_err());
    }

    #[tokio::test]
    async fn object_url_uses_virtual_host_for_aws() {
        let backend = backend(json!({
            "bucket": "backups",
            "region": "eu-west-1",
            "access_key_id": "AKIA",
            "secret_access_key": "secret",
        }))
        .await;
        let (url, uri) = backend.object_url("daily/a b.tar.gz");
        assert_eq!(
            url,
            "https://backups.s3.eu-west-1.amazonaws.com/daily/a%20b.tar.gz"
        );
        assert_eq!(uri, "/daily/a%20b.tar.gz");
    }

    #[tokio::test]
    async fn object_url_uses_path_style_for_custom_endpoint() {
        let backend = backend(json!({
            "bucket": "backups",
            "endpoint": "http://minio.local:9000/",
            "access_key_id": "AKIA",
            "secret_access_key": "secret",
        }))
        .await;
        let (url, uri) = backend.object_url("daily.tar.gz");
        assert_eq!(url, "http://minio.local:9000/backups/daily.tar.gz");
        assert_eq!(uri, "/backups/daily.tar.gz");
        assert_eq!(
            backend.host_for_uri(&url).expect("host"),
            "minio.local:9000"
        );
    }

    #[test]
    fn signing_key_matches_aws_reference_vector() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn canonical_query_sorts_and_encodes() {
        let query = vec![
            ("prefix".to_string(), "a b/c".to_string()),
            ("list-type".to_string(), "2".to_string()),
            ("continuation-token".to_string(), "ab==".to_string()),
        ];
        assert_eq!(
            canonical_query(&query),
            "continuation-token=ab%3D%3D&list-type=2&prefix=a%20b%2Fc"
        );
        assert_eq!(canonical_query(&[]), "");
    }

    #[test]
    fn encode_key_preserves_separators() {
        assert_eq!(encode_key("a/b c/d+e"), "a/b%20c/d%2Be");
        assert_eq!(encode_key(""), "");
    }

    #[tokio::test]
    async fn sign_produces_credential_scoped_authorization() {
        let backend = backend(json!({
            "bucket": "backups",
            "access_key_id": "AKIAEXAMPLE",
            "secret_access_key": "secret",
        }))
        .await;
        let now = chrono::DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .expect("time")
            .with_timezone(&chrono::Utc);
        let headers = backend.sign(
            "GET",
            "/",
            "list-type=2",
            "backups.s3.us-east-1.amazonaws.com",
            &[],
            "payloadhash",
            now,
        );
        let auth = headers
            .iter()
            .find(|(name, _)| name == "Authorization")
            .map(|(_, value)| value.clone())
            .expect("authorization");
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/20250601/us-east-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert!(auth.contains("Signature="));
        assert!(headers.iter().any(|(name, _)| name == "x-amz-date"));
        assert!(!headers.iter().any(|(name, _)| name == "host"));
    }

    #[test]
    fn list_bucket_result_parses() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>backups</Name>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token123</NextContinuationToken>
  <Contents>
    <Key>pre/daily_20250101_000000.tar.gz</Key>
    <LastModified>2025-01-01T00:00:00.000Z</LastModified>
    <Size>1024</Size>
  </Contents>
  <Contents>
    <Key>pre/daily_20250102_000000.tar.gz</Key>
    <LastModified>2025-01-02T00:00:00.000Z</LastModified>
    <Size>2048</Size>
  </Contents>
</ListBucketResult>"#;
        let parsed: ListBucketResult = quick_xml::de::from_str(xml).expect("parse");
        assert!(parsed.is_truncated);
        assert_eq!(parsed.next_continuation_token.as_deref(), Some("token123"));
        assert_eq!(parsed.contents.len(), 2);
        assert_eq!(parsed.contents[0].key, "pre/daily_20250101_000000.tar.gz");
        assert_eq!(parsed.contents[1].size, 2048);
    }

    #[test]
    fn initiate_result_parses() {
        let xml = r#"<InitiateMultipartUploadResult>
  <Bucket>backups</Bucket>
  <Key>daily.tar.gz</Key>
  <UploadId>upload-123</UploadId>
</InitiateMultipartUploadResult>"#;
        let parsed: InitiateMultipartUploadResult = quick_xml::de::from_str(xml).expect("parse");
        assert_eq!(parsed.upload_id, "upload-123");
    }
}
