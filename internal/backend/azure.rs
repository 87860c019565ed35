use super::{
    connection_error, join_prefix, optional_config_str, required_config_str, strip_prefix,
    with_cancel, BackupInfo, StorageBackend, UploadProgressFn, TEST_TIMEOUT_SECS,
};
use crate::errors::{CoreError, CoreResult};
use crate::models::StorageUsage;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::path::Path;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

const API_VERSION: &str = "2021-08-06";
const VALID_ACCESS_TIERS: &[&str] = &["Hot", "Cool", "Cold", "Archive"];

const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug)]
enum AzureAuth {
    SharedKey(Vec<u8>),
    SasToken(Vec<(String, String)>),
}

/// Stores backups in an Azure Blob Storage container.
#[derive(Debug)]
pub struct AzureBackend {
    http: reqwest::Client,
    account: String,
    container: String,
    prefix: String,
    access_tier: Option<String>,
    auth: AzureAuth,
    endpoint: String,
}

impl AzureBackend {
    pub async fn initialize(config: &Map<String, Value>) -> CoreResult<Self> {
        let container = required_config_str(config, "container", "azure")?;
        let prefix = optional_config_str(config, "prefix").unwrap_or_default();
        let access_tier = match optional_config_str(config, "storage_tier") {
            Some(tier) => Some(validate_access_tier(&tier)?),
            None => None,
        };

        let (account, auth) = resolve_credentials(config)?;
        let endpoint = format!("https://{account}.blob.core.windows.net");
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| connection_error("failed to build http client", err))?;

        Ok(Self {
            http,
            account,
            container,
            prefix,
            access_tier,
            auth,
            endpoint,
        })
    }

    fn blob_url(&self, blob: &str, query: &[(String, String)]) -> String {
        let encoded_blob = blob
            .split('/')
            .map(|segment| utf8_percent_encode(segment, QUERY_ENCODE_SET).to_string())
            .collect::<Vec<_>>()
            .join("/");
        let mut url = if encoded_blob.is_empty() {
            format!("{}/{}", self.endpoint, self.container)
        } else {
            format!("{}/{}/{}", self.endpoint, self.container, encoded_blob)
        };

        let mut query_parts: Vec<String> = query
            .iter()
            .map(|(name, value)| {
                format!("{name}={}", utf8_percent_encode(value, QUERY_ENCODE_SET))
            })
            .collect();
        if let AzureAuth::SasToken(sas) = &self.auth {
            // SAS pairs arrive pre-encoded; pass them through untouched.
            query_parts.extend(sas.iter().map(|(name, value)| format!("{name}={value}")));
        }
        if !query_parts.is_empty() {
            url.push('?');
            url.push_str(&query_parts.join("&"));
        }
        url
    }

    async fn send(
        &self,
        cancel: &CancellationToken,
        method: reqwest::Method,
        blob: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        body: Vec<u8>,
    ) -> CoreResult<reqwest::Response> {
        let url = self.blob_url(blob, query);
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date),
            ("x-ms-version".to_string(), API_VERSION.to_string()),
        ];
        headers.extend(extra_headers.iter().cloned());

        if let AzureAuth::SharedKey(key) = &self.auth {
            let authorization = self.shared_key_authorization(
                key,
                method.as_str(),
                blob,
                query,
                &headers,
                body.len(),
            );
            headers.push(("Authorization".to_string(), authorization));
        }

        let mut request = self.http.request(method, &url).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        with_cancel(cancel, async {
            request
                .send()
                .await
                .map_err(|err| connection_error("azure request failed", err))
        })
        .await
    }

    /// SharedKey authorization header over the canonical string-to-sign.
    fn shared_key_authorization(
        &self,
        key: &[u8],
        method: &str,
        blob: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        content_length: usize,
    ) -> String {
        let string_to_sign = build_string_to_sign(
            &self.account,
            &self.container,
            method,
            blob,
            query,
            headers,
            content_length,
        );
        let mut mac =
            Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(string_to_sign.as_bytes());
        let signature = Base64.encode(mac.finalize().into_bytes());
        format!("SharedKey {}:{signature}", self.account)
    }

    async fn list_page(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
        marker: Option<&str>,
    ) -> CoreResult<EnumerationResults> {
        let mut query = vec![
            ("comp".to_string(), "list".to_string()),
            ("restype".to_string(), "container".to_string()),
        ];
        if !prefix.is_empty() {
            query.push(("prefix".to_string(), prefix.to_string()));
        }
        if let Some(marker) = marker {
            query.push(("marker".to_string(), marker.to_string()));
        }
        let response = self
            .send(cancel, reqwest::Method::GET, "", &query, &[], Vec::new())
            .await?;
        if !response.status().is_success() {
            return Err(connection_error("failed to list blobs", response.status()));
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
        let mut marker: Option<String> = None;
        loop {
            let page = self.list_page(cancel, full_prefix, marker.as_deref()).await?;
            for blob in page.blobs.items {
                backups.push(BackupInfo {
                    path: strip_prefix(&self.prefix, &blob.name),
                    size: blob.properties.content_length,
                    last_modified: convert_last_modified(&blob.properties.last_modified),
                    hash: String::new(),
                });
            }
            match page.next_marker.filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(backups)
    }
}

#[async_trait]
impl StorageBackend for AzureBackend {
    async fn test(&self) -> CoreResult<()> {
        let cancel = CancellationToken::new();
        let query = vec![("restype".to_string(), "container".to_string())];
        let properties = self.send(
            &cancel,
            reqwest::Method::GET,
            "",
            &query,
            &[],
            Vec::new(),
        );
        let response = timeout(Duration::from_secs(TEST_TIMEOUT_SECS), properties)
            .await
            .map_err(|_| CoreError::ConnectionFailed("container check timed out".to_string()))??;
        if !response.status().is_success() {
            return Err(connection_error(
                "cannot access container",
                response.status(),
            ));
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
        let blob = join_prefix(&self.prefix, remote_path);
        let body = tokio::fs::read(local_path).await?;
        let total = body.len() as i64;

        let mut headers = vec![("x-ms-blob-type".to_string(), "BlockBlob".to_string())];
        if let Some(tier) = &self.access_tier {
            headers.push(("x-ms-access-tier".to_string(), tier.clone()));
        }
        let response = self
            .send(cancel, reqwest::Method::PUT, &blob, &[], &headers, body)
            .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to upload to Azure",
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
        let blob = join_prefix(&self.prefix, remote_path);
        let response = self
            .send(cancel, reqwest::Method::DELETE, &blob, &[], &[], Vec::new())
            .await?;
        if !response.status().is_success() {
            return Err(connection_error(
                "failed to delete from Azure",
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

/// Accepts an account key, a SAS token, or a connection string.
fn resolve_credentials(config: &Map<String, Value>) -> CoreResult<(String, AzureAuth)> {
    if let Some(connection_string) = optional_config_str(config, "connection_string") {
        return parse_connection_string(&connection_string);
    }

    let account = required_config_str(config, "account_name", "azure")?;
    if let Some(account_key) = optional_config_str(config, "account_key") {
        let key = decode_account_key(&account_key)?;
        return Ok((account, AzureAuth::SharedKey(key)));
    }
    if let Some(sas_token) = optional_config_str(config, "sas_token") {
        return Ok((account, AzureAuth::SasToken(parse_sas_token(&sas_token))));
    }
    Err(CoreError::Validation(
        "azure backend requires one of: account_key, sas_token, or connection_string".to_string(),
    ))
}

fn parse_connection_string(connection_string: &str) -> CoreResult<(String, AzureAuth)> {
    let mut account = None;
    let mut key = None;
    for part in connection_string.split(';') {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        match name.trim() {
            "AccountName" => account = Some(value.trim().to_string()),
            // The value is base64 and may itself contain '='; split_once
            // keeps the remainder intact.
            "AccountKey" => key = Some(value.trim().to_string()),
            _ => {}
        }
    }
    match (account, key) {
        (Some(account), Some(key)) => {
            let key = decode_account_key(&key)?;
            Ok((account, AzureAuth::SharedKey(key)))
        }
        _ => Err(CoreError::Validation(
            "azure connection string must contain AccountName and AccountKey".to_string(),
        )),
    }
}

fn decode_account_key(raw: &str) -> CoreResult<Vec<u8>> {
    Base64
        .decode(raw)
        .map_err(|_| CoreError::Validation("azure account_key must be valid base64".to_string()))
}

fn parse_sas_token(token: &str) -> Vec<(String, String)> {
    token
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn validate_access_tier(tier: &str) -> CoreResult<String> {
    let wanted = tier.to_uppercase();
    for valid in VALID_ACCESS_TIERS {
        if valid.to_uppercase() == wanted {
            return Ok(valid.to_string());
        }
    }
    Err(CoreError::Validation(format!(
        "invalid Azure access tier: {tier} (valid options: {})",
        VALID_ACCESS_TIERS.join(", ")
    )))
}

/// Azure 2015-02-21+ SharedKey string-to-sign for a request without the
/// standard Content-* headers (only Content-Length when a body is present).
fn build_string_to_sign(
    account: &str,
    container: &str,
    method: &str,
    blob: &str,
    query: &[(String, String)],
    headers: &[(String, String)],
    content_length: usize,
) -> String {
    let content_length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut ms_headers: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| name.starts_with("x-ms-"))
        .map(|(name, value)| (name.to_lowercase(), value.clone()))
        .collect();
    ms_headers.sort();
    let canonicalized_headers: String = ms_headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();

    let mut resource = if blob.is_empty() {
        format!("/{account}/{container}")
    } else {
        format!("/{account}/{container}/{blob}")
    };
    let mut params: Vec<(String, String)> = query
        .iter()
        .map(|(name, value)| (name.to_lowercase(), value.clone()))
        .collect();
    params.sort();
    for (name, value) in params {
        resource.push_str(&format!("\n{name}:{value}"));
    }

    format!(
        "{method}\n\n\n{content_length}\n\n\n\n\n\n\n\n\n{canonicalized_headers}{resource}"
    )
}

/// Azure reports RFC1123 timestamps; listings expose RFC3339.
fn convert_last_modified(raw: &str) -> String {
    match chrono::DateTime::parse_from_rfc2822(raw) {
        Ok(parsed) => parsed.with_timezone(&Utc).to_rfc3339(),
        Err(_) => raw.to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(default, rename = "Blob")]
    items: Vec<BlobEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobEntry {
    name: String,
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Last-Modified")]
    last_modified: String,
    #[serde(rename = "Content-Length")]
    content_length: i64,
}

#[cfg(test)]
mod tests {
    use super::{
        build_string_to_sign, convert_last_modified, parse_sas_token, validate_access_tier,
        AzureAuth, AzureBackend, EnumerationResults,
    };
    use serde_json::json;

    async fn backend(config: serde_json::Value) -> AzureBackend {
        AzureBackend::initialize(config.as_object().expect("object"))
            .await
            .expect("initialize")
    }

    fn shared_key_config() -> serde_json::Value {
        json!({
            "container": "backups",
            "account_name": "acct",
            "account_key": base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                b"supersecretkey",
            ),
        })
    }

    #[tokio::test]
    async fn initialize_requires_container_and_credentials() {
        let missing_container = json!({ "account_name": "acct" });
        let err = AzureBackend::initialize(missing_container.as_object().expect("object"))
            .await
            .expect_err("container");
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let missing_creds = json!({ "container": "backups", "account_name": "acct" });
        let err = AzureBackend::initialize(missing_creds.as_object().expect("object"))
            .await
            .expect_err("credentials");
        assert!(err.to_string().contains("account_key"));
    }

    #[tokio::test]
    async fn initialize_accepts_connection_string() {
        let key = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"key");
        let backend = backend(json!({
            "container": "backups",
            "connection_string": format!(
                "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey={key};EndpointSuffix=core.windows.net"
            ),
        }))
        .await;
        assert_eq!(backend.account, "acct");
        assert!(matches!(backend.auth, AzureAuth::SharedKey(_)));
        assert_eq!(backend.endpoint, "https://acct.blob.core.windows.net");
    }

    #[tokio::test]
    async fn initialize_accepts_sas_token() {
        let backend = backend(json!({
            "container": "backups",
            "account_name": "acct",
            "sas_token": "?sv=2021-08-06&sig=abc%3D",
        }))
        .await;
        match &backend.auth {
            AzureAuth::SasToken(params) => {
                assert_eq!(params.len(), 2);
                assert_eq!(params[0], ("sv".to_string(), "2021-08-06".to_string()));
            }
            _ => panic!("expected sas auth"),
        }
        let url = backend.blob_url("daily.tar.gz", &[]);
        assert!(url.contains("sv=2021-08-06"));
        assert!(url.contains("sig=abc%3D"));
    }

    #[tokio::test]
    async fn initialize_validates_access_tier() {
        let mut config = shared_key_config();
        config["storage_tier"] = json!("Frozen");
        let err = AzureBackend::initialize(config.as_object().expect("object"))
            .await
            .expect_err("tier");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn access_tier_normalizes_case() {
        assert_eq!(validate_access_tier("hot").expect("ok"), "Hot");
        assert_eq!(validate_access_tier("ARCHIVE").expect("ok"), "Archive");
        assert!(validate_access_tier("warm").is_err());
    }

    #[test]
    fn sas_token_parsing_strips_question_mark() {
        let params = parse_sas_token("?a=1&b=2");
        assert_eq!(
            params,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn string_to_sign_shape_matches_shared_key_contract() {
        let headers = vec![
            ("x-ms-version".to_string(), "2021-08-06".to_string()),
            ("x-ms-date".to_string(), "Mon, 02 Jun 2025 00:00:00 GMT".to_string()),
            ("x-ms-blob-type".to_string(), "BlockBlob".to_string()),
        ];
        let sts = build_string_to_sign(
            "acct",
            "backups",
            "PUT",
            "daily.tar.gz",
            &[],
            &headers,
            128,
        );
        let lines: Vec<&str> = sts.split('\n').collect();
        assert_eq!(lines[0], "PUT");
        assert_eq!(lines[3], "128");
        // x-ms headers sorted by name.
        assert_eq!(lines[12], "x-ms-blob-type:BlockBlob");
        assert_eq!(lines[13], "x-ms-date:Mon, 02 Jun 2025 00:00:00 GMT");
        assert_eq!(lines[14], "x-ms-version:2021-08-06");
        assert_eq!(lines[15], "/acct/backups/daily.tar.gz");
    }

    #[test]
    fn string_to_sign_appends_sorted_query_params() {
        let sts = build_string_to_sign(
            "acct",
            "backups",
            "GET",
            "",
            &[
                ("restype".to_string(), "container".to_string()),
                ("comp".to_string(), "list".to_string()),
            ],
            &[],
            0,
        );
        assert!(sts.ends_with("/acct/backups\ncomp:list\nrestype:container"));
        // Zero-length bodies canonicalize to an empty Content-Length.
        assert_eq!(sts.split('\n').nth(3), Some(""));
    }

    #[test]
    fn enumeration_results_parse_and_convert_timestamps() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="backups">
  <Blobs>
    <Blob>
      <Name>pre/daily.tar.gz</Name>
      <Properties>
        <Last-Modified>Wed, 01 Jan 2025 00:00:00 GMT</Last-Modified>
        <Content-Length>512</Content-Length>
      </Properties>
    </Blob>
  </Blobs>
  <NextMarker>marker2</NextMarker>
</EnumerationResults>"#;
        let parsed: EnumerationResults = quick_xml::de::from_str(xml).expect("parse");
        assert_eq!(parsed.blobs.items.len(), 1);
        assert_eq!(parsed.blobs.items[0].name, "pre/daily.tar.gz");
        assert_eq!(parsed.blobs.items[0].properties.content_length, 512);
        assert_eq!(parsed.next_marker.as_deref(), Some("marker2"));

        let converted =
            convert_last_modified(&parsed.blobs.items[0].properties.last_modified);
        assert_eq!(converted, "2025-01-01T00:00:00+00:00");
    }
}
