//! HTTP client for the generation API.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{header, Client, StatusCode};
use serde_json::{json, Value};

use super::{check_envelope, ApiCall, ControlPlane};
use crate::config::{DeviceIdentity, UpstreamConfig};
use crate::error::{JimengError, Result};
use crate::signing::{device_sign, session_cookie};

/// Browser headers sent with every control-plane call.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept", "application/json, text/plain, */*"),
    ("accept-language", "zh-CN,zh;q=0.9"),
    ("cache-control", "no-cache"),
    ("last-event-id", "undefined"),
    ("pragma", "no-cache"),
    ("priority", "u=1, i"),
    (
        "sec-ch-ua",
        r#""Google Chrome";v="131", "Chromium";v="131", "Not_A Brand";v="24""#,
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", r#""Windows""#),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
];

/// User agent of the emulated browser.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                              (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Origin of the upstream web app.
const WEB_ORIGIN: &str = "https://jimeng.jianying.com";

/// Shared HTTP client, cheap to clone.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: Client,
    config: Arc<UpstreamConfig>,
    identity: Arc<DeviceIdentity>,
}

impl UpstreamClient {
    /// Build a client for `config` presenting `identity`.
    pub fn new(config: UpstreamConfig, identity: Arc<DeviceIdentity>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()
            .map_err(|e| JimengError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            config: Arc::new(config),
            identity,
        })
    }

    /// Underlying reqwest client, shared with the upload pipeline.
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Upstream configuration.
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Bind to a session token.
    pub fn session(&self, token: impl Into<String>) -> UpstreamSession {
        UpstreamSession {
            client: self.clone(),
            token: token.into(),
        }
    }

    fn common_params(&self) -> Vec<(String, String)> {
        vec![
            ("aid".to_string(), self.config.app_id.clone()),
            ("device_platform".to_string(), "web".to_string()),
            ("region".to_string(), "CN".to_string()),
            ("web_id".to_string(), self.identity.web_id.to_string()),
        ]
    }

    fn prepare_body(&self, call: &ApiCall) -> Value {
        let mut body = call.body.clone();
        if call.common_info {
            if let Value::Object(map) = &mut body {
                let aid: u64 = self.config.app_id.parse().unwrap_or_default();
                map.insert("http_common_info".to_string(), json!({ "aid": aid }));
            }
        }
        body
    }

    async fn send_once(&self, token: &str, call: &ApiCall, body: &Value) -> Result<(StatusCode, Value)> {
        let now = chrono::Utc::now().timestamp();
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), call.uri);

        let mut request = self
            .http
            .post(&url)
            .query(&self.common_params())
            .query(&call.params)
            .header("appid", self.config.app_id.as_str())
            .header("appvr", self.config.version_code.as_str())
            .header("pf", self.config.platform_code.as_str())
            .header(header::ORIGIN, WEB_ORIGIN)
            .header(
                header::REFERER,
                call.referer.as_deref().unwrap_or(WEB_ORIGIN),
            )
            .header(header::COOKIE, session_cookie(token, &self.identity, now))
            .header("device-time", now.to_string())
            .header(
                "sign",
                device_sign(
                    &call.uri,
                    &self.config.platform_code,
                    &self.config.version_code,
                    now,
                ),
            )
            .header("sign-ver", "1")
            .json(body);
        for (name, value) in BROWSER_HEADERS {
            request = request.header(*name, *value);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                JimengError::UpstreamCallFailed(format!(
                    "{} returned non-JSON body ({status}): {e}",
                    call.uri
                ))
            })?
        };
        Ok((status, value))
    }

    /// Send `call` with per-call retries, then unwrap the envelope.
    ///
    /// Transport errors and HTTP statuses ≥400 are retried up to
    /// `max_call_retries` times with a linear `1s * retry` backoff. Envelope
    /// errors are returned as-is.
    pub async fn send(&self, token: &str, call: ApiCall) -> Result<Value> {
        let body = self.prepare_body(&call);
        let max_retries = self.config.max_call_retries;
        let mut retry = 0u32;

        loop {
            if retry > 0 {
                tokio::time::sleep(Duration::from_secs(u64::from(retry))).await;
            }

            let err = match self.send_once(token, &call, &body).await {
                Ok((status, value)) if status.as_u16() < 400 => {
                    tracing::debug!(uri = %call.uri, %status, "upstream call succeeded");
                    return check_envelope(value);
                },
                Ok((status, value)) => JimengError::UpstreamCallFailed(format!(
                    "{} returned HTTP {status}: {}",
                    call.uri,
                    truncate(&value.to_string(), 200)
                )),
                Err(err @ JimengError::UpstreamCallFailed(_)) => err,
                Err(err) => return Err(err),
            };

            if retry >= max_retries {
                tracing::warn!(uri = %call.uri, retries = retry, error = %err, "upstream call failed");
                return Err(err);
            }
            retry += 1;
            tracing::debug!(uri = %call.uri, retry, error = %err, "retrying upstream call");
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// An [`UpstreamClient`] bound to one session token.
#[derive(Debug, Clone)]
pub struct UpstreamSession {
    client: UpstreamClient,
    token: String,
}

impl UpstreamSession {
    /// The owning client.
    pub fn client(&self) -> &UpstreamClient {
        &self.client
    }
}

impl ControlPlane for UpstreamSession {
    fn call(&self, call: ApiCall) -> BoxFuture<'_, Result<Value>> {
        Box::pin(self.client.send(&self.token, call))
    }
}
