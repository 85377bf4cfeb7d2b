//! Server state and per-request sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};
use rand::seq::SliceRandom;
use reqwest::Client;

use crate::config::Config;
use crate::error::{JimengError, Result};
use crate::generation::{GenerationSettings, Generator};
use crate::upload::{AssetUploader, UploadPipeline};
use crate::upstream::{ControlPlane, UpstreamClient};

/// What one request needs to talk upstream on behalf of a token.
#[derive(Clone)]
pub struct Session {
    /// Control plane bound to the token
    pub control: Arc<dyn ControlPlane>,
    /// Uploader using the same token
    pub uploader: Arc<dyn AssetUploader>,
}

/// Opens sessions for tokens.
pub trait Backend: Send + Sync {
    /// Session for `token`.
    fn session(&self, token: &str) -> Result<Session>;
}

/// Backend talking to the real upstream.
pub struct UpstreamBackend {
    client: UpstreamClient,
    config: Config,
}

impl UpstreamBackend {
    /// Backend sharing one HTTP client across sessions.
    pub fn new(client: UpstreamClient, config: Config) -> Self {
        Self { client, config }
    }
}

impl Backend for UpstreamBackend {
    fn session(&self, token: &str) -> Result<Session> {
        let control: Arc<dyn ControlPlane> = Arc::new(self.client.session(token));
        let pipeline = UploadPipeline::new(
            self.client.http().clone(),
            Arc::clone(&control),
            &self.config.upstream,
            self.config.upload.clone(),
        )?;
        Ok(Session {
            control,
            uploader: Arc::new(pipeline),
        })
    }
}

/// Application state shared across handlers
pub struct AppState {
    /// Session factory
    pub backend: Arc<dyn Backend>,
    /// Timing knobs for generation
    pub settings: Arc<GenerationSettings>,
    /// Client for fetching results as base64
    pub http: Client,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(backend: Arc<dyn Backend>, settings: GenerationSettings, http: Client) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
            http,
            start_time: Instant::now(),
        }
    }

    /// Get server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Generator for one of the caller's tokens, picked at random.
    pub fn generator(&self, headers: &HeaderMap) -> Result<Generator> {
        let tokens = bearer_tokens(headers)?;
        let token = pick_token(&tokens)?;
        let session = self.backend.session(token)?;
        Ok(Generator::new(
            session.control,
            session.uploader,
            Arc::clone(&self.settings),
        ))
    }
}

/// Split `Authorization: Bearer t1,t2` into tokens.
pub fn bearer_tokens(headers: &HeaderMap) -> Result<Vec<String>> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| JimengError::Validation("missing authorization header".to_string()))?;

    let raw = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value);
    let tokens: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    if tokens.is_empty() {
        return Err(JimengError::Validation("no token in authorization header".to_string()));
    }
    Ok(tokens)
}

/// Random choice spreads load over the caller's accounts.
pub fn pick_token(tokens: &[String]) -> Result<&str> {
    tokens
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
        .ok_or_else(|| JimengError::Validation("no token available".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_tokens_split() {
        let tokens = bearer_tokens(&headers("Bearer aaa, bbb,,ccc ")).unwrap();
        assert_eq!(tokens, vec!["aaa", "bbb", "ccc"]);
    }

    #[test]
    fn test_missing_or_empty_authorization() {
        assert!(matches!(bearer_tokens(&HeaderMap::new()), Err(JimengError::Validation(_))));
        assert!(matches!(bearer_tokens(&headers("Bearer  ,")), Err(JimengError::Validation(_))));
    }

    #[test]
    fn test_pick_token_from_list() {
        let tokens = vec!["a".to_string(), "b".to_string()];
        for _ in 0..20 {
            assert!(["a", "b"].contains(&pick_token(&tokens).unwrap()));
        }
        assert!(pick_token(&[]).is_err());
    }
}
