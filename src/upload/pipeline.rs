//! Object-storage upload: probe, materialize, ticket, apply, transfer, commit.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use rand::Rng;
use reqwest::{header, Client, Url};
use serde_json::{json, Value};

use super::AssetUploader;
use crate::config::{UploadConfig, UpstreamConfig};
use crate::error::{JimengError, Result};
use crate::job::{AssetRole, AssetSource};
use crate::signing::{sigv4, Credentials, SigningScope};
use crate::upstream::{ApiCall, ControlPlane, UPLOAD_TOKEN_URI};

/// Storage API version
const STORAGE_API_VERSION: &str = "2018-08-01";

/// Commit status meaning "stored"
const URI_STATUS_OK: i64 = 2000;

/// Short-lived credentials for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token
    pub session_token: String,
    /// Storage service id
    pub service_id: String,
}

impl UploadTicket {
    /// Parse the `get_upload_token` response data.
    pub fn from_data(data: &Value, fallback_service_id: &str) -> Result<Self> {
        let field = |name: &str| {
            data.get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        match (
            field("access_key_id"),
            field("secret_access_key"),
            field("session_token"),
        ) {
            (Some(access_key_id), Some(secret_access_key), Some(session_token)) => Ok(Self {
                access_key_id,
                secret_access_key,
                session_token,
                service_id: field("service_id").unwrap_or_else(|| fallback_service_id.to_string()),
            }),
            _ => Err(JimengError::UploadFailed(
                "upload token response is missing credentials".to_string(),
            )),
        }
    }

    fn credentials(&self) -> Credentials<'_> {
        Credentials {
            access_key_id: &self.access_key_id,
            secret_access_key: &self.secret_access_key,
            session_token: Some(&self.session_token),
        }
    }
}

/// Where and how to send the bytes, from `ApplyImageUpload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAddress {
    /// Object key
    pub store_uri: String,
    /// Per-object authorization for the transfer
    pub auth: String,
    /// Host to send the bytes to
    pub upload_host: String,
    /// Session key for the commit
    pub session_key: String,
}

fn metadata_error(body: &Value) -> Option<String> {
    body.pointer("/ResponseMetadata/Error")
        .filter(|e| !e.is_null())
        .map(Value::to_string)
}

/// Parse an `ApplyImageUpload` response.
pub fn parse_apply_response(body: &Value) -> Result<UploadAddress> {
    if let Some(err) = metadata_error(body) {
        return Err(JimengError::UploadFailed(format!("apply rejected: {err}")));
    }
    let address = body
        .pointer("/Result/UploadAddress")
        .ok_or_else(|| JimengError::UploadFailed("apply response has no UploadAddress".to_string()))?;
    let text = |pointer: &str| {
        address
            .pointer(pointer)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match (
        text("/StoreInfos/0/StoreUri"),
        text("/StoreInfos/0/Auth"),
        text("/UploadHosts/0"),
        text("/SessionKey"),
    ) {
        (Some(store_uri), Some(auth), Some(upload_host), Some(session_key)) => Ok(UploadAddress {
            store_uri,
            auth,
            upload_host,
            session_key,
        }),
        _ => Err(JimengError::UploadFailed(
            "apply response is missing store info, upload host or session key".to_string(),
        )),
    }
}

/// Parse a `CommitImageUpload` response into the logical URI.
pub fn parse_commit_response(body: &Value) -> Result<String> {
    if let Some(err) = metadata_error(body) {
        return Err(JimengError::UploadFailed(format!("commit rejected: {err}")));
    }
    let result = body
        .pointer("/Result/Results/0")
        .ok_or_else(|| JimengError::UploadFailed("commit response has no results".to_string()))?;

    let status = result.get("UriStatus").and_then(Value::as_i64);
    if status != Some(URI_STATUS_OK) {
        return Err(JimengError::UploadFailed(format!(
            "commit returned UriStatus {}",
            status.map_or_else(|| "missing".to_string(), |s| s.to_string())
        )));
    }

    body.pointer("/Result/PluginResult/0/ImageUri")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| result.get("Uri").and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| JimengError::UploadFailed("commit response has no uri".to_string()))
}

/// Decode a `data:<mime>;base64,<payload>` URI.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let (_, payload) = uri
        .split_once(";base64,")
        .ok_or_else(|| JimengError::UploadFailed("inline asset is not base64 data".to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.decode(payload.trim())?)
}

/// CRC32 of `data` as 8 lowercase hex digits.
pub fn crc32_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// Reject sizes over `max`.
pub fn check_size(size: u64, max: u64) -> Result<()> {
    if size > max {
        return Err(JimengError::UploadFailed(format!(
            "file is {size} bytes, limit is {max}"
        )));
    }
    Ok(())
}

fn random_nonce() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Transfer target for `host` and `store_uri`, using the storage API's scheme
/// unless the host already names one.
pub fn transfer_url(storage: &Url, host: &str, store_uri: &str) -> String {
    if host.contains("://") {
        format!("{}/upload/v1/{store_uri}", host.trim_end_matches('/'))
    } else {
        format!("{}://{host}/upload/v1/{store_uri}", storage.scheme())
    }
}

/// Moves reference assets into upstream storage.
pub struct UploadPipeline {
    http: Client,
    control: Arc<dyn ControlPlane>,
    storage_url: Url,
    fallback_service_id: String,
    config: UploadConfig,
}

impl UploadPipeline {
    /// Build a pipeline that fetches tickets through `control`.
    pub fn new(
        http: Client,
        control: Arc<dyn ControlPlane>,
        upstream: &UpstreamConfig,
        config: UploadConfig,
    ) -> Result<Self> {
        let storage_url = Url::parse(&upstream.storage_url)
            .map_err(|e| JimengError::Config(format!("invalid storage url: {e}")))?;
        Ok(Self {
            http,
            control,
            storage_url,
            fallback_service_id: upstream.fallback_service_id.clone(),
            config,
        })
    }

    /// HEAD-probe a remote URL before downloading it.
    async fn probe(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .head(url)
            .timeout(Duration::from_secs(self.config.probe_timeout_secs))
            .send()
            .await
            .map_err(|e| JimengError::UploadFailed(format!("probe of {url} failed: {e}")))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(JimengError::UploadFailed(format!(
                "file {url} is not valid: [{status}]"
            )));
        }
        if let Some(length) = declared_length(response.headers()) {
            check_size(length, self.config.max_file_size)?;
        }
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Bytes> {
        let mut response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(self.config.transfer_timeout_secs))
            .send()
            .await
            .map_err(|e| JimengError::UploadFailed(format!("download of {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(JimengError::UploadFailed(format!(
                "download of {url} failed: [{}]",
                response.status()
            )));
        }
        if let Some(length) = response.content_length() {
            check_size(length, self.config.max_file_size)?;
        }

        // Chunked bodies carry no length; stop reading once the cap is crossed.
        let mut buf = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| JimengError::UploadFailed(format!("download of {url} failed: {e}")))?
        {
            check_size((buf.len() + chunk.len()) as u64, self.config.max_file_size)?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    async fn materialize(&self, source: &AssetSource) -> Result<Bytes> {
        match source {
            AssetSource::Inline(data) => {
                let bytes = decode_data_uri(data)?;
                check_size(bytes.len() as u64, self.config.max_file_size)?;
                Ok(Bytes::from(bytes))
            },
            AssetSource::Remote(url) => {
                self.probe(url).await?;
                self.download(url).await
            },
        }
    }

    async fn ticket(&self) -> Result<UploadTicket> {
        let data = self
            .control
            .call(ApiCall::post(UPLOAD_TOKEN_URI, json!({ "scene": 2 })))
            .await?;
        UploadTicket::from_data(&data, &self.fallback_service_id)
    }

    fn storage_call(&self, action: &str, ticket: &UploadTicket, extra: &[(&str, String)]) -> Url {
        let mut url = self.storage_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("Action", action)
                .append_pair("Version", STORAGE_API_VERSION)
                .append_pair("ServiceId", &ticket.service_id);
            for (name, value) in extra {
                query.append_pair(name, value);
            }
        }
        url
    }

    async fn signed_json(
        &self,
        method: &str,
        url: &Url,
        ticket: &UploadTicket,
        body: Option<Vec<u8>>,
    ) -> Result<Value> {
        let signed = sigv4::sign(
            method,
            url,
            &sigv4::timestamp_now(),
            ticket.credentials(),
            body.as_deref(),
            SigningScope::IMAGEX,
        );

        let mut request = match method {
            "POST" => self.http.post(url.clone()),
            _ => self.http.get(url.clone()),
        };
        for (name, value) in signed.headers() {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request
                .header(header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| JimengError::UploadFailed(format!("storage call failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| JimengError::UploadFailed(format!("storage call failed: {e}")))?;
        if !status.is_success() {
            return Err(JimengError::UploadFailed(format!(
                "storage call returned {status}: {text}"
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| JimengError::UploadFailed(format!("storage returned invalid JSON: {e}")))
    }

    async fn transfer(&self, address: &UploadAddress, bytes: Bytes, crc: &str) -> Result<()> {
        let url = transfer_url(&self.storage_url, &address.upload_host, &address.store_uri);
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.config.transfer_timeout_secs))
            .header(header::AUTHORIZATION, address.auth.as_str())
            .header("content-crc32", crc)
            .header(header::CONTENT_DISPOSITION, r#"attachment; filename="undefined""#)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| JimengError::UploadFailed(format!("transfer failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(JimengError::UploadFailed(format!(
                "transfer returned {status}: {text}"
            )));
        }
        Ok(())
    }

    /// Run every step for one source.
    pub async fn upload_source(&self, source: &AssetSource) -> Result<String> {
        let bytes = self.materialize(source).await?;
        let ticket = self.ticket().await?;
        let crc = crc32_hex(&bytes);
        let size = bytes.len();
        tracing::debug!(size, %crc, service_id = %ticket.service_id, "uploading reference");

        let apply_url = self.storage_call(
            "ApplyImageUpload",
            &ticket,
            &[("FileSize", size.to_string()), ("s", random_nonce())],
        );
        let apply = self.signed_json("GET", &apply_url, &ticket, None).await?;
        let address = parse_apply_response(&apply)?;

        self.transfer(&address, bytes, &crc).await?;

        let commit_url = self.storage_call("CommitImageUpload", &ticket, &[]);
        let payload = serde_json::to_vec(&json!({
            "SessionKey": address.session_key,
            "SuccessActionStatus": "200",
        }))?;
        let commit = self
            .signed_json("POST", &commit_url, &ticket, Some(payload))
            .await?;
        let uri = parse_commit_response(&commit)?;
        tracing::info!(%uri, "reference uploaded");
        Ok(uri)
    }
}

fn declared_length(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

impl AssetUploader for UploadPipeline {
    fn upload<'a>(&'a self, source: &'a AssetSource, role: AssetRole) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            tracing::debug!(source = %source.describe(), ?role, "upload requested");
            self.upload_source(source).await.map_err(|err| match err {
                err @ JimengError::UploadFailed(_) => err,
                other => JimengError::UploadFailed(other.to_string()),
            })
        })
    }
}
