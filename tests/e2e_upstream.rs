//! End-to-end tests against a local fake upstream.
//!
//! The fake answers both the control plane and the object-storage API from a
//! routing table and records every request, so these tests drive the real
//! HTTP client, signer and upload pipeline over actual sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use jimeng::config::{DeviceIdentity, PollPresets, RetryPolicy, UploadConfig, UpstreamConfig};
use jimeng::job::AssetSource;
use jimeng::upload::UploadPipeline;
use jimeng::upstream::{get_credit, ControlPlane, UpstreamClient};
use jimeng::{GenerationSettings, Generator, JimengError, JobKind, JobRequest};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
struct Recorded {
    key: String,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
}

#[derive(Default)]
struct Fake {
    routes: HashMap<String, (u16, Value)>,
    log: Mutex<Vec<Recorded>>,
}

impl Fake {
    fn route(mut self, key: &str, status: u16, body: Value) -> Self {
        self.routes.insert(key.to_string(), (status, body));
        self
    }

    fn requests(&self, key: &str) -> Vec<Recorded> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.key == key)
            .cloned()
            .collect()
    }
}

/// Storage calls are keyed by `Action`, everything else by path.
async fn answer(
    State(fake): State<Arc<Fake>>,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let key = query
        .get("Action")
        .cloned()
        .unwrap_or_else(|| uri.path().to_string());
    fake.log.lock().unwrap().push(Recorded {
        key: key.clone(),
        headers,
        query,
        body,
    });
    match fake.routes.get(&key) {
        Some((status, value)) => (
            StatusCode::from_u16(*status).unwrap(),
            Json(value.clone()),
        ),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": key}))),
    }
}

/// Bind first so the routing table can refer to the fake's own address.
async fn start_with(build: impl FnOnce(&str) -> Fake) -> (String, Arc<Fake>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let fake = Arc::new(build(&base));
    let router = Router::new().fallback(answer).with_state(Arc::clone(&fake));
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (base, fake)
}

async fn start(fake: Fake) -> (String, Arc<Fake>) {
    start_with(|_| fake).await
}

fn ok(data: Value) -> Value {
    json!({"ret": "0", "errmsg": "success", "data": data})
}

fn identity() -> Arc<DeviceIdentity> {
    Arc::new(DeviceIdentity {
        device_id: 7_300_000_000_000_000_001,
        web_id: 7_300_000_000_000_000_002,
        user_id: "0123456789abcdef0123456789abcdef".to_string(),
    })
}

fn client(base: &str, max_call_retries: u32) -> UpstreamClient {
    let config = UpstreamConfig {
        base_url: base.to_string(),
        storage_url: format!("{base}/"),
        timeout_secs: 5,
        max_call_retries,
        ..UpstreamConfig::default()
    };
    UpstreamClient::new(config, identity()).unwrap()
}

fn credit(total: i64) -> Value {
    ok(json!({"credit": {"gift_credit": total, "purchase_credit": 0, "vip_credit": 0}}))
}

#[tokio::test]
async fn test_control_plane_call_is_signed() {
    let (base, fake) = start(Fake::default().route(
        "/commerce/v1/benefits/user_credit",
        200,
        credit(12),
    ))
    .await;

    let session = client(&base, 0).session("tok-123");
    let balance = get_credit(&session).await.unwrap();
    assert_eq!(balance.total(), 12);

    let seen = fake.requests("/commerce/v1/benefits/user_credit");
    assert_eq!(seen.len(), 1);
    let request = &seen[0];

    assert_eq!(request.query.get("aid").map(String::as_str), Some("513695"));
    assert_eq!(request.query.get("device_platform").map(String::as_str), Some("web"));
    assert_eq!(request.query.get("region").map(String::as_str), Some("CN"));
    assert_eq!(
        request.query.get("web_id").map(String::as_str),
        Some("7300000000000000002")
    );

    let sign = request.headers.get("sign").unwrap().to_str().unwrap();
    assert_eq!(sign.len(), 32);
    assert!(sign.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(request.headers.get("sign-ver").unwrap(), "1");
    assert!(request.headers.get("device-time").is_some());

    let cookie = request.headers.get("cookie").unwrap().to_str().unwrap();
    assert!(cookie.contains("sessionid=tok-123"));
    assert!(cookie.contains("_tea_web_id=7300000000000000002"));
}

#[tokio::test]
async fn test_insufficient_credit_envelope() {
    let (base, _fake) = start(Fake::default().route(
        "/mweb/v1/aigc_draft/generate",
        200,
        json!({"ret": "5000", "errmsg": "credit not enough"}),
    ))
    .await;

    let session = client(&base, 0).session("tok");
    let call = jimeng::ApiCall::post("/mweb/v1/aigc_draft/generate", json!({}));
    let err = session.call(call).await.unwrap_err();
    assert!(matches!(err, JimengError::InsufficientCredit(ref msg) if msg.contains("credit not enough")));
}

#[tokio::test]
async fn test_http_errors_are_retried_per_call() {
    let (base, fake) = start(Fake::default().route(
        "/mweb/v1/get_history_by_ids",
        500,
        json!({"message": "busy"}),
    ))
    .await;

    let session = client(&base, 1).session("tok");
    let call = jimeng::ApiCall::post("/mweb/v1/get_history_by_ids", json!({}));
    let err = session.call(call).await.unwrap_err();

    assert!(matches!(err, JimengError::UpstreamCallFailed(_)));
    assert_eq!(fake.requests("/mweb/v1/get_history_by_ids").len(), 2);
}

fn fast_settings() -> Arc<GenerationSettings> {
    let mut poll = PollPresets::default();
    poll.image.initial_delay_ms = 0;
    poll.image.max_attempts = 5;
    Arc::new(GenerationSettings {
        poll,
        retry: RetryPolicy::none(),
        ..GenerationSettings::default()
    })
}

#[tokio::test]
async fn test_image_flow_over_http() {
    let (base, fake) = start(
        Fake::default()
            .route("/commerce/v1/benefits/user_credit", 200, credit(5))
            .route(
                "/mweb/v1/aigc_draft/generate",
                200,
                ok(json!({"aigc_data": {"history_record_id": "77"}})),
            )
            .route(
                "/mweb/v1/get_history_by_ids",
                200,
                ok(json!({"77": {"status": 10, "item_list": [
                    {"image": {"large_images": [{"image_url": "https://p/cat.webp"}]}}
                ]}})),
            ),
    )
    .await;

    let upstream = client(&base, 0);
    let control: Arc<dyn ControlPlane> = Arc::new(upstream.session("tok"));
    let uploader = UploadPipeline::new(
        upstream.http().clone(),
        Arc::clone(&control),
        upstream.config(),
        UploadConfig::default(),
    )
    .unwrap();
    let generator = Generator::new(control, Arc::new(uploader), fast_settings());

    let request = JobRequest::new(JobKind::Image, "jimeng-4.0", "a cat").with_size(1024, 1024);
    let result = generator.generate(request).await.unwrap();

    assert_eq!(result.correlation_id, "77");
    assert_eq!(result.assets, vec!["https://p/cat.webp"]);

    let submit = &fake.requests("/mweb/v1/aigc_draft/generate")[0];
    let body: Value = serde_json::from_slice(&submit.body).unwrap();
    assert_eq!(body["http_common_info"]["aid"], 513695);
    assert!(body["draft_content"].as_str().unwrap().contains("a cat"));
    assert!(submit.query.contains_key("babi_param"));
}

#[tokio::test]
async fn test_inline_reference_upload() {
    let (base, fake) = start_with(|base| {
        let host = base.trim_start_matches("http://").to_string();
        Fake::default()
            .route(
                "/mweb/v1/get_upload_token",
                200,
                ok(json!({
                    "access_key_id": "AKTEST",
                    "secret_access_key": "secret",
                    "session_token": "sts-token",
                    "service_id": "svc1"
                })),
            )
            .route(
                "ApplyImageUpload",
                200,
                json!({"Result": {"UploadAddress": {
                    "StoreInfos": [{"StoreUri": "tos-test/obj1", "Auth": "store-auth"}],
                    "UploadHosts": [host],
                    "SessionKey": "sess-1"
                }}}),
            )
            .route("/upload/v1/tos-test/obj1", 200, json!({"code": 2000}))
            .route(
                "CommitImageUpload",
                200,
                json!({"Result": {
                    "Results": [{"Uri": "tos-test/obj1", "UriStatus": 2000}],
                    "PluginResult": [{"ImageUri": "tos-test/obj1-final"}]
                }}),
            )
    })
    .await;

    let upstream = client(&base, 0);
    let control: Arc<dyn ControlPlane> = Arc::new(upstream.session("tok"));
    let pipeline = UploadPipeline::new(
        upstream.http().clone(),
        control,
        upstream.config(),
        UploadConfig::default(),
    )
    .unwrap();

    // "hello" in base64
    let source = AssetSource::parse("data:image/png;base64,aGVsbG8=");
    let uri = pipeline.upload_source(&source).await.unwrap();
    assert_eq!(uri, "tos-test/obj1-final");

    let apply = &fake.requests("ApplyImageUpload")[0];
    assert_eq!(apply.query.get("ServiceId").map(String::as_str), Some("svc1"));
    assert_eq!(apply.query.get("FileSize").map(String::as_str), Some("5"));
    let auth = apply.headers.get("authorization").unwrap().to_str().unwrap();
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKTEST/"));
    assert!(auth.contains("/cn-north-1/imagex/aws4_request"));
    assert_eq!(apply.headers.get("x-amz-security-token").unwrap(), "sts-token");

    let transfer = &fake.requests("/upload/v1/tos-test/obj1")[0];
    assert_eq!(&transfer.body[..], b"hello");
    assert_eq!(transfer.headers.get("authorization").unwrap(), "store-auth");
    assert_eq!(
        transfer.headers.get("content-crc32").unwrap().to_str().unwrap(),
        format!("{:08x}", crc32fast::hash(b"hello"))
    );

    let commit = &fake.requests("CommitImageUpload")[0];
    let body: Value = serde_json::from_slice(&commit.body).unwrap();
    assert_eq!(body["SessionKey"], "sess-1");
    assert!(commit.headers.get("x-amz-content-sha256").is_some());
}

#[tokio::test]
async fn test_storage_rejection_is_upload_failure() {
    let (base, _fake) = start(
        Fake::default()
            .route(
                "/mweb/v1/get_upload_token",
                200,
                ok(json!({
                    "access_key_id": "AKTEST",
                    "secret_access_key": "secret",
                    "session_token": "sts-token"
                })),
            )
            .route(
                "ApplyImageUpload",
                200,
                json!({"ResponseMetadata": {"Error": {"Code": "SignatureDoesNotMatch"}}}),
            ),
    )
    .await;

    let upstream = client(&base, 0);
    let pipeline = UploadPipeline::new(
        upstream.http().clone(),
        Arc::new(upstream.session("tok")),
        upstream.config(),
        UploadConfig::default(),
    )
    .unwrap();

    let source = AssetSource::parse("data:image/png;base64,aGVsbG8=");
    let err = pipeline.upload_source(&source).await.unwrap_err();
    assert!(matches!(err, JimengError::UploadFailed(ref msg) if msg.contains("SignatureDoesNotMatch")));
}

const CHUNK: usize = 64 * 1024;
const CHUNKS: usize = 1024;

#[tokio::test]
async fn test_chunked_download_stops_at_size_limit() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    // No Content-Length: the body is a stream of chunks.
    let router = Router::new().route(
        "/big.png",
        get(move || {
            let counter = Arc::clone(&counter);
            async move {
                let chunks = futures::stream::iter(0..CHUNKS).map(move |_| {
                    counter.fetch_add(CHUNK, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(Bytes::from(vec![0u8; CHUNK]))
                });
                Body::from_stream(chunks)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/big.png", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let (base, fake) = start(Fake::default()).await;
    let upstream = client(&base, 0);
    let pipeline = UploadPipeline::new(
        upstream.http().clone(),
        Arc::new(upstream.session("tok")),
        upstream.config(),
        UploadConfig {
            max_file_size: 1024,
            ..UploadConfig::default()
        },
    )
    .unwrap();

    let err = pipeline
        .upload_source(&AssetSource::Remote(url))
        .await
        .unwrap_err();
    assert!(matches!(err, JimengError::UploadFailed(ref msg) if msg.contains("limit is 1024")));
    // Never got as far as asking for an upload ticket.
    assert!(fake.requests("/mweb/v1/get_upload_token").is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(served.load(Ordering::SeqCst) < CHUNK * CHUNKS);
}
