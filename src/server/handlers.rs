//! HTTP request handlers.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::state::{bearer_tokens, AppState};
use crate::draft::{all_models, is_video_model, DEFAULT_IMAGE_MODEL, DEFAULT_VIDEO_MODEL};
use crate::error::{JimengError, Result};
use crate::generation::{expected_assets, parse_model, prompt_from_messages};
use crate::job::{JobKind, JobRequest, ReferenceAsset};
use crate::stream::{event_stream, StreamHeader};
use crate::upstream::{get_credit, token_live};

/// Default composition size
const COMPOSITION_WIDTH: u32 = 2560;
const COMPOSITION_HEIGHT: u32 = 1440;

/// Error rendered in the OpenAI error shape.
pub struct ApiError(pub JimengError);

impl From<JimengError> for ApiError {
    fn from(err: JimengError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "request failed");
        } else {
            tracing::debug!(kind = self.0.kind(), error = %self.0, "request rejected");
        }
        (
            status,
            Json(json!({
                "error": {
                    "message": self.0.to_string(),
                    "type": self.0.kind(),
                    "correlation_id": self.0.correlation_id(),
                }
            })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| JimengError::Validation(format!("invalid request body: {e}")))
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
    /// Seconds since start
    pub uptime_secs: u64,
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime().as_secs(),
    })
}

/// Model list in the OpenAI shape.
pub async fn list_models() -> impl IntoResponse {
    let data: Vec<Value> = all_models()
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "jimeng-gateway"}))
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// Chat completion request
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Model, optionally `name:WxH`
    #[serde(default)]
    pub model: Option<String>,
    /// Conversation; the last message is the prompt
    pub messages: Vec<Value>,
    /// Stream the answer as SSE
    #[serde(default)]
    pub stream: bool,
}

/// Chat completions: the last message becomes an image or video prompt.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let req: ChatRequest = parse_body(&body)?;
    let model = req.model.unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());
    let spec = parse_model(&model);
    let prompt = prompt_from_messages(&req.messages)?;

    let kind = if is_video_model(&spec.name) {
        JobKind::Video
    } else {
        JobKind::Image
    };
    let mut request = JobRequest::new(kind, spec.name.clone(), prompt).with_size(spec.width, spec.height);
    if kind == JobKind::Image {
        request.expected_assets = expected_assets(&spec.name, &request.prompt);
    }

    let generator = state.generator(&headers)?;

    if req.stream {
        let chunks = generator.generate_stream(request);
        let stream = event_stream(StreamHeader::new(model), chunks);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(stream))
            .map_err(|e| ApiError(JimengError::Config(format!("failed to build stream response: {e}"))));
    }

    let result = generator.generate(request).await?;
    Ok(Json(json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "model": model,
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": result.markdown()},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
        "created": unix_now(),
    }))
    .into_response())
}

/// Image generation request
#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    /// Model name
    #[serde(default)]
    pub model: Option<String>,
    /// Prompt text
    pub prompt: String,
    /// Negative prompt
    #[serde(default)]
    pub negative_prompt: Option<String>,
    /// Target width
    #[serde(default)]
    pub width: Option<u32>,
    /// Target height
    #[serde(default)]
    pub height: Option<u32>,
    /// Sample strength
    #[serde(default)]
    pub sample_strength: Option<f64>,
    /// `url` or `b64_json`
    #[serde(default)]
    pub response_format: Option<String>,
}

/// Composition request: an image request plus input images.
#[derive(Debug, Deserialize)]
pub struct CompositionRequest {
    /// Shared image fields
    #[serde(flatten)]
    pub image: ImageRequest,
    /// URL strings or `{"url": ...}` objects
    pub images: Vec<Value>,
}

/// Video generation request
#[derive(Debug, Deserialize)]
pub struct VideoRequest {
    /// Model name
    #[serde(default)]
    pub model: Option<String>,
    /// Prompt text
    pub prompt: String,
    /// Target width
    #[serde(default)]
    pub width: Option<u32>,
    /// Target height
    #[serde(default)]
    pub height: Option<u32>,
    /// `720p` or `1080p`
    #[serde(default)]
    pub resolution: Option<String>,
    /// Frame sources
    #[serde(default)]
    pub file_paths: Vec<String>,
    /// Frame sources, camel case
    #[serde(default, rename = "filePaths")]
    pub file_paths_camel: Vec<String>,
    /// Frame URLs
    #[serde(default)]
    pub images_urls: Vec<String>,
    /// Frame URLs, camel case
    #[serde(default, rename = "imagesUrls")]
    pub images_urls_camel: Vec<String>,
    /// `url` or `b64_json`
    #[serde(default)]
    pub response_format: Option<String>,
}

impl VideoRequest {
    /// Frame inputs in precedence order: image URLs, then file paths.
    pub fn frames(&self) -> &[String] {
        [
            &self.images_urls_camel,
            &self.images_urls,
            &self.file_paths_camel,
            &self.file_paths,
        ]
        .into_iter()
        .find(|list| !list.is_empty())
        .map(Vec::as_slice)
        .unwrap_or_default()
    }
}

fn wants_b64(format: Option<&str>) -> bool {
    format == Some("b64_json")
}

/// Fetch an asset and encode it for `b64_json` responses.
async fn fetch_base64(http: &reqwest::Client, url: &str) -> Result<String> {
    let response = http.get(url).send().await?;
    if !response.status().is_success() {
        return Err(JimengError::UpstreamCallFailed(format!(
            "fetching {url} returned {}",
            response.status()
        )));
    }
    let bytes = response.bytes().await?;
    Ok(base64::engine::general_purpose::STANDARD.encode(&bytes))
}

async fn asset_entries(state: &AppState, assets: &[String], format: Option<&str>) -> Result<Vec<Value>> {
    if wants_b64(format) {
        let encoded =
            try_join_all(assets.iter().map(|url| fetch_base64(&state.http, url))).await?;
        return Ok(encoded.into_iter().map(|b64| json!({ "b64_json": b64 })).collect());
    }
    Ok(assets.iter().map(|url| json!({ "url": url })).collect())
}

fn image_job(kind: JobKind, req: &ImageRequest, default_size: (u32, u32)) -> JobRequest {
    let model = req.model.clone().unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());
    let width = req.width.unwrap_or(default_size.0);
    let height = req.height.unwrap_or(default_size.1);
    let mut job = JobRequest::new(kind, model, req.prompt.clone()).with_size(width, height);
    if let Some(negative) = &req.negative_prompt {
        job.negative_prompt.clone_from(negative);
    }
    if let Some(strength) = req.sample_strength {
        job.sample_strength = strength;
    }
    job
}

/// Text to image.
pub async fn image_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let req: ImageRequest = parse_body(&body)?;
    let mut job = image_job(JobKind::Image, &req, (1024, 1024));
    job.expected_assets = expected_assets(&job.model, &job.prompt);

    let result = state.generator(&headers)?.generate(job).await?;
    let data = asset_entries(&state, &result.assets, req.response_format.as_deref()).await?;
    Ok(Json(json!({ "created": unix_now(), "data": data })))
}

/// Read composition inputs, which may be strings or `{url}` objects.
fn composition_inputs(images: &[Value]) -> Result<Vec<String>> {
    images
        .iter()
        .enumerate()
        .map(|(i, image)| match image {
            Value::String(url) => Ok(url.clone()),
            Value::Object(map) => map
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| JimengError::Validation(format!("image {} has no url field", i + 1))),
            _ => Err(JimengError::Validation(format!(
                "image {} must be a URL string or an object with a url field",
                i + 1
            ))),
        })
        .collect()
}

/// Blend several input images.
pub async fn image_compositions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let req: CompositionRequest = parse_body(&body)?;
    let inputs = composition_inputs(&req.images)?;
    let job = image_job(JobKind::Composition, &req.image, (COMPOSITION_WIDTH, COMPOSITION_HEIGHT))
        .with_references(ReferenceAsset::from_inputs(&inputs));

    let result = state.generator(&headers)?.generate(job).await?;
    let data = asset_entries(&state, &result.assets, req.image.response_format.as_deref()).await?;
    Ok(Json(json!({
        "created": unix_now(),
        "data": data,
        "input_images": inputs.len(),
        "composition_type": "multi_image_synthesis",
    })))
}

/// Text or frames to video.
pub async fn video_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let req: VideoRequest = parse_body(&body)?;
    let model = req.model.clone().unwrap_or_else(|| DEFAULT_VIDEO_MODEL.to_string());
    let mut job = JobRequest::new(JobKind::Video, model, req.prompt.clone())
        .with_size(req.width.unwrap_or(1024), req.height.unwrap_or(1024))
        .with_references(ReferenceAsset::from_inputs(req.frames()));
    if let Some(resolution) = &req.resolution {
        job.resolution.clone_from(resolution);
    }

    let result = state.generator(&headers)?.generate(job).await?;
    let mut data = asset_entries(&state, &result.assets, req.response_format.as_deref()).await?;
    for entry in &mut data {
        entry["revised_prompt"] = json!(req.prompt);
    }
    Ok(Json(json!({ "created": unix_now(), "data": data })))
}

/// Token check request
#[derive(Debug, Deserialize)]
pub struct TokenCheckRequest {
    /// Session token to probe
    pub token: String,
}

/// Whether a token is still accepted upstream.
pub async fn token_check(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let req: TokenCheckRequest = parse_body(&body)?;
    let session = state.backend.session(&req.token)?;
    let live = token_live(session.control.as_ref()).await?;
    Ok(Json(json!({ "live": live })))
}

/// Credit balance of every token in the authorization header.
pub async fn token_points(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let tokens = bearer_tokens(&headers)?;
    let lookups = tokens.iter().map(|token| {
        let state = &state;
        async move {
            let session = state.backend.session(token)?;
            let credit = get_credit(session.control.as_ref()).await?;
            Ok::<_, JimengError>(json!({
                "token": token,
                "points": {
                    "gift_credit": credit.gift_credit,
                    "purchase_credit": credit.purchase_credit,
                    "vip_credit": credit.vip_credit,
                    "total_credit": credit.total(),
                },
            }))
        }
    });
    let points = try_join_all(lookups).await?;
    Ok(Json(Value::Array(points)))
}
