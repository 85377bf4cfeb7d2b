//! OpenAI-compatible HTTP server.
//!
//! Routes:
//! - `GET  /health`, `GET /v1/models`
//! - `POST /v1/chat/completions` (JSON or SSE)
//! - `POST /v1/images/generations`, `POST /v1/images/compositions`
//! - `POST /v1/videos/generations`
//! - `POST /token/check`, `POST /token/points`
//!
//! Every generation route reads `Authorization: Bearer t1,t2,...` and runs the
//! job on one token picked at random.
//!
//! # Example
//!
//! ```rust,ignore
//! use jimeng::{config::Config, server::Server};
//!
//! let server = Server::new(Config::default())?;
//! server.run().await?;
//! ```

mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, DeviceIdentity};
use crate::error::{JimengError, Result};
use crate::generation::GenerationSettings;
use crate::upstream::UpstreamClient;

pub use handlers::{health_check, ApiError};
pub use state::{bearer_tokens, pick_token, AppState, Backend, Session, UpstreamBackend};

/// Create the API router
pub fn create_router(state: Arc<AppState>, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ping", get(handlers::health_check))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/images/generations", post(handlers::image_generations))
        .route("/v1/images/compositions", post(handlers::image_compositions))
        .route("/v1/videos/generations", post(handlers::video_generations))
        .route("/token/check", post(handlers::token_check))
        .route("/token/points", post(handlers::token_points))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Gateway server bound to the real upstream.
pub struct Server {
    config: Config,
    state: Arc<AppState>,
}

impl Server {
    /// Build the upstream client, a fresh device identity and the state.
    pub fn new(config: Config) -> Result<Self> {
        let identity = Arc::new(DeviceIdentity::generate());
        let client = UpstreamClient::new(config.upstream.clone(), identity)?;
        let http = client.http().clone();
        let backend = Arc::new(UpstreamBackend::new(client, config.clone()));
        let state = Arc::new(AppState::new(backend, GenerationSettings::from(&config), http));
        Ok(Self { config, state })
    }

    /// Router with all routes and layers.
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), self.config.server.max_body_size)
    }

    /// Serve until the process is stopped.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.server.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| JimengError::Config(format!("Failed to bind {addr}: {e}")))?;

        tracing::info!(%addr, upstream = %self.config.upstream.base_url, "jimeng gateway listening");
        axum::serve(listener, self.router())
            .await
            .map_err(JimengError::Io)
    }
}
