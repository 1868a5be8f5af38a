//! Integration tests for admissibility gating of dispatch

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    middleware,
    routing::{get, post},
};
use modelrelay::{
    config::Config,
    endpoint::EndpointId,
    handlers::AppState,
    middleware::request_id_middleware,
    store::{LatencyOutcome, LatencySample, MemoryStore, SampleStore, now_ms},
};
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn app_with_store(toml: &str) -> (Router, Arc<MemoryStore>) {
    let config = Arc::new(Config::from_str(toml).expect("config should parse"));
    let store = Arc::new(MemoryStore::new(1000));
    let state = AppState::new(config, store.clone()).expect("state");
    let app = Router::new()
        .route(
            "/v1/chat/completions",
            post(modelrelay::handlers::chat::handler),
        )
        .route("/health", get(modelrelay::handlers::health::handler))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware));
    (app, store)
}

fn chat_request() -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"model": "openai/gpt-4", "messages": [{"role": "user", "content": "hi"}]}"#,
        ))
        .expect("request")
}

/// Seed `count` success latency samples ending at `t_last_ms`
async fn seed_slow_window(store: &MemoryStore, endpoint: &EndpointId, t_last_ms: i64, count: i64) {
    for i in 0..count {
        store
            .append_latency(
                endpoint,
                LatencySample {
                    timestamp_ms: t_last_ms - (count - 1 - i) * 10,
                    seconds: 0.6,
                    outcome: LatencyOutcome::Success,
                },
            )
            .await
            .expect("append");
    }
}

#[tokio::test]
async fn test_slow_endpoint_denied_preflight_surfaces_all_failed() {
    let toml = r#"
models = ["openai/gpt-4"]

[[clients]]
url = "https://api.openai.com/v1/chat/completions"
[clients.headers]
Authorization = "Bearer sk-test"

[model_latency."openai/gpt-4"]
threshold_seconds = 0.35
window_size = 5
recovery_seconds = 0.1
"#;
    let (app, store) = app_with_store(toml);

    let endpoint = EndpointId::parse("openai/gpt-4").expect("parse");
    seed_slow_window(&store, &endpoint, now_ms(), 5).await;

    let response = app.oneshot(chat_request()).await.expect("send");

    // The only candidate is inadmissible, so the dispatch exhausts without a
    // single upstream call.
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body_str = String::from_utf8_lossy(&body);
    assert!(
        body_str.contains("not admissible"),
        "expected admissibility error, got: {}",
        body_str
    );

    // Pre-flight denial records no new samples
    assert_eq!(
        store
            .recent_latencies(&endpoint, 10)
            .await
            .expect("query")
            .len(),
        5
    );
}

#[tokio::test]
async fn test_slow_endpoint_admitted_after_recovery_elapsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let toml = format!(
        r#"
models = ["openai/gpt-4"]

[[clients]]
url = "{}/v1/chat/completions"
provider = "openai"
[clients.headers]
Authorization = "Bearer sk-test"

[model_latency."openai/gpt-4"]
threshold_seconds = 0.35
window_size = 5
recovery_seconds = 0.1
"#,
        server.uri()
    );
    let (app, store) = app_with_store(&toml);

    // Same slow window, but its newest sample is twice the recovery in the
    // past, so the oracle admits the endpoint.
    let endpoint = EndpointId::parse("openai/gpt-4").expect("parse");
    seed_slow_window(&store, &endpoint, now_ms() - 200, 5).await;

    let response = app.oneshot(chat_request()).await.expect("send");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_slow_endpoint_skipped_in_favor_of_next_candidate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"from": 2})))
        .expect(1)
        .mount(&server)
        .await;

    let toml = format!(
        r#"
models = ["openai/gpt-4", "azure/gpt-4"]

[[clients]]
url = "https://api.openai.com/v1/chat/completions"
[clients.headers]
Authorization = "Bearer sk-test"

[[clients]]
url = "{}/base"
provider = "azure"
[clients.headers]
api-key = "k"

[model_latency."openai/gpt-4"]
threshold_seconds = 0.35
window_size = 5
recovery_seconds = 100.0
"#,
        server.uri()
    );
    let (app, store) = app_with_store(&toml);

    let endpoint = EndpointId::parse("openai/gpt-4").expect("parse");
    seed_slow_window(&store, &endpoint, now_ms(), 5).await;

    let response = app.oneshot(chat_request()).await.expect("send");
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(&body[..], br#"{"from":2}"#);
}

#[tokio::test]
async fn test_health_endpoint_reports_unhealthy_reason() {
    let toml = r#"
models = ["openai/gpt-4"]

[[clients]]
url = "https://api.openai.com/v1/chat/completions"
[clients.headers]
Authorization = "Bearer sk-test"

[model_latency."openai/gpt-4"]
threshold_seconds = 0.35
window_size = 5
recovery_seconds = 100.0
"#;
    let (app, store) = app_with_store(toml);

    let endpoint = EndpointId::parse("openai/gpt-4").expect("parse");
    seed_slow_window(&store, &endpoint, now_ms(), 5).await;

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("send");
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");

    assert_eq!(parsed["status"], "ok");
    assert_eq!(parsed["endpoints"][0]["endpoint"], "openai/gpt-4");
    assert_eq!(parsed["endpoints"][0]["admissible"], false);
    assert!(
        parsed["endpoints"][0]["reason"]
            .as_str()
            .expect("reason")
            .contains("latency")
    );
}
