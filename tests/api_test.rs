use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use futures::{stream::BoxStream, StreamExt};
use prompt_gateway::{
    api::{self, AppState},
    clock::ManualClock,
    gateway::{BackendError, CompletionBackend, CompletionRequest, Gateway},
    registry::{ApiKeyRegistry, QuotaPolicy},
    store::MemoryQuotaStore,
};
use serde_json::{json, Value};
use tower::ServiceExt;

const START: i64 = 1_700_000_000;

struct ScriptedBackend {
    fragments: Vec<&'static str>,
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn stream_completion(
        &self,
        _request: &CompletionRequest,
    ) -> Result<BoxStream<'static, String>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fragments: Vec<String> = self.fragments.iter().map(|f| f.to_string()).collect();
        Ok(futures::stream::iter(fragments).boxed())
    }
}

struct TestApp {
    app: Router,
    backend: Arc<ScriptedBackend>,
    clock: ManualClock,
}

fn setup(limit: u64) -> TestApp {
    let clock = ManualClock::new(START);
    let policy = QuotaPolicy {
        refresh_interval_seconds: 3600,
        default_usage_limit: limit,
    };
    let registry = Arc::new(ApiKeyRegistry::with_clock(
        Arc::new(MemoryQuotaStore::new()),
        Arc::new(clock.clone()),
        policy,
    ));
    let backend = Arc::new(ScriptedBackend {
        fragments: vec!["Here is ", "<pro", "mpt>Hello ", "Wor", "ld</pro", "mpt> done"],
        calls: AtomicUsize::new(0),
    });
    let gateway = Arc::new(Gateway::new(registry.clone(), backend.clone()));

    let app = api::router(Arc::new(AppState { registry })).merge(api::gateway_router(gateway));
    TestApp {
        app,
        backend,
        clock,
    }
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_key(app: &Router, body: Value) -> String {
    let (status, value) = send(app, Method::POST, "/keys", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    value["data"]["api_keys"][0].as_str().unwrap().to_string()
}

fn prompt_request(api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/v1/prompt/stream")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = api_key {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
    }
    let body = json!({
        "model": "test-model",
        "messages": [{ "role": "user", "content": "write me a prompt" }],
    });
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_create_and_list_keys() {
    println!("🧪 Testing key creation endpoint...");

    let test = setup(100);
    let (status, value) = send(
        &test.app,
        Method::POST,
        "/keys",
        Some(json!({ "days": 0, "hours": 1, "numbers": 3 })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["success"], true);
    assert_eq!(value["data"]["expiration_seconds"], 3600);
    let keys = value["data"]["api_keys"].as_array().unwrap();
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(|k| k.as_str().unwrap().starts_with("sj_")));

    let (status, value) = send(&test.app, Method::GET, "/keys", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["count"], 3);
    assert_eq!(value["data"]["api_keys"][0]["status"], "inactive");
    assert_eq!(value["data"]["api_keys"][0]["usage_limit"], 100);

    println!("✅ Keys created and listed");
}

#[tokio::test]
async fn test_usage_endpoint_enforces_limit() {
    let test = setup(100);
    let key = create_key(&test.app, json!({ "usage_limit": 2 })).await;
    let usage_uri = format!("/keys/{key}/usage");

    let (status, value) = send(&test.app, Method::POST, &usage_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["current_period_usage"], 1);

    test.clock.advance(600);
    let (status, _) = send(&test.app, Method::POST, &usage_uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method(Method::POST)
        .uri(&usage_uri)
        .body(Body::empty())
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "3000");

    let (status, value) = send(&test.app, Method::GET, &usage_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["total_usage"], 2);
    assert_eq!(value["data"]["current_period_usage"], 2);
}

#[tokio::test]
async fn test_activate_and_info() {
    let test = setup(100);
    let key = create_key(&test.app, json!({ "days": 0, "minutes": 10 })).await;

    let (status, value) = send(&test.app, Method::POST, &format!("/keys/{key}/activate"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["newly_activated"], true);
    assert_eq!(value["data"]["expires_at"], START + 600);

    test.clock.advance(30);
    let (_, value) = send(&test.app, Method::POST, &format!("/keys/{key}/activate"), None).await;
    assert_eq!(value["data"]["newly_activated"], false);
    assert_eq!(value["data"]["activated_at"], START);

    let (status, value) = send(&test.app, Method::GET, &format!("/keys/{key}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["status"], "active");

    test.clock.advance(600);
    let (_, value) = send(&test.app, Method::GET, &format!("/keys/{key}/validate"), None).await;
    assert_eq!(value["data"]["is_valid"], false);
}

#[tokio::test]
async fn test_update_and_delete_errors() {
    let test = setup(100);
    let key = create_key(&test.app, json!({})).await;
    let key_uri = format!("/keys/{key}");

    let (status, value) = send(&test.app, Method::PUT, &key_uri, Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["success"], false);

    let (status, value) = send(&test.app, Method::PUT, &key_uri, Some(json!({ "usage_limit": 7 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["usage_limit"], 7);

    let (status, _) = send(&test.app, Method::DELETE, &key_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&test.app, Method::DELETE, &key_uri, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&test.app, Method::GET, "/keys/sj_not_a_real_key", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, value) = send(&test.app, Method::GET, "/keys", None).await;
    assert_eq!(value["data"]["count"], 0);
    let (_, value) = send(&test.app, Method::GET, "/keys?include_deleted=true", None).await;
    assert_eq!(value["data"]["count"], 1);
}

#[tokio::test]
async fn test_batch_delete_reports_per_key() {
    let test = setup(100);
    let key = create_key(&test.app, json!({})).await;

    let (status, value) = send(
        &test.app,
        Method::POST,
        "/keys/batch-delete",
        Some(json!({ "api_keys": [key, "sj_unknown"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"][0]["success"], true);
    assert_eq!(value["data"][1]["success"], false);
}

#[tokio::test]
async fn test_prompt_stream_returns_payload_only() {
    println!("🧪 Testing streamed prompt extraction...");

    let test = setup(100);
    let key = create_key(&test.app, json!({})).await;

    let response = test.app.clone().oneshot(prompt_request(Some(&key))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"Hello World");
    assert_eq!(test.backend.calls.load(Ordering::SeqCst), 1);

    let (_, value) = send(&test.app, Method::GET, &format!("/keys/{key}"), None).await;
    assert_eq!(value["data"]["activated"], true);
    assert_eq!(value["data"]["total_usage"], 1);

    println!("✅ Only the delimited payload reached the caller");
}

#[tokio::test]
async fn test_rejected_keys_never_reach_backend() {
    let test = setup(1);

    let response = test.app.clone().oneshot(prompt_request(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = test
        .app
        .clone()
        .oneshot(prompt_request(Some("sj_forged_key")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let key = create_key(&test.app, json!({})).await;
    send(&test.app, Method::DELETE, &format!("/keys/{key}"), None).await;
    let response = test.app.clone().oneshot(prompt_request(Some(&key))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(test.backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_prompt_stream_quota_exhaustion() {
    let test = setup(1);
    let key = create_key(&test.app, json!({})).await;

    let response = test.app.clone().oneshot(prompt_request(Some(&key))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = test.app.clone().oneshot(prompt_request(Some(&key))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "3600");
    assert_eq!(test.backend.calls.load(Ordering::SeqCst), 1);
}
