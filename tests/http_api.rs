//! HTTP API tests against the in-memory backend.
//!
//! The router is driven with `tower::ServiceExt::oneshot`; no socket is
//! bound and no outbound request is made.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use ragflow_slim::auth::ApiKey;
use ragflow_slim::config::{Config, Environment};
use ragflow_slim::server::{router, AppState};
use ragflow_slim::state::{Backends, Services};

const KEY: &str = "t3st-k3y-9f8e7d6c5b4a3f2e1d0c";

fn test_config() -> Config {
    let mut config = Config::default();
    config.llm.provider = "ollama".into();
    config.embedding.dims = 512;
    config.crawl.max_concurrent_jobs = 2;
    config
}

async fn app_with(config: Config) -> Router {
    let services = Services::build(config, Backends::in_memory()).await.unwrap();
    let key = ApiKey::resolve(Some(KEY), Environment::Development).unwrap();
    router(AppState::new(services, key))
}

async fn app() -> Router {
    app_with(test_config()).await
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", KEY)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-api-key", KEY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn health_needs_no_key() {
    let app = app().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["backend"], "memory");
    assert_eq!(body["graph_available"], false);
    assert_eq!(body["llm"]["provider"], "ollama");
}

#[tokio::test]
async fn security_headers_are_set() {
    let app = app().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["content-security-policy"], "default-src 'self'");
    assert!(headers["strict-transport-security"]
        .to_str()
        .unwrap()
        .starts_with("max-age=31536000"));
}

#[tokio::test]
async fn missing_or_wrong_key_is_unauthorized() {
    let app = app().await;

    let request = Request::builder().uri("/crawl/stats").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let request = Request::builder()
        .uri("/crawl/stats")
        .header("x-api-key", "not-the-right-key-at-all")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ingested_text_is_retrieved_first() {
    let app = app().await;

    for (title, text) in [
        ("rust", "Tokio schedules async tasks across worker threads"),
        ("bread", "Sourdough bread needs flour water salt and patience"),
    ] {
        let (status, body) = send(
            &app,
            post_json("/ingest", json!({ "text": text, "title": title })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "success");
        assert_eq!(body["embedded"], true);
        assert_eq!(body["graph"]["status"], "skipped");
    }

    let (status, body) = send(
        &app,
        post_json("/retrieval", json!({ "query": "async tasks on tokio", "top_k": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let hits = body["vector_results"].as_array().unwrap();
    assert!(!hits.is_empty() && hits.len() <= 2);
    assert_eq!(hits[0]["metadata"]["title"], "rust");
    assert!(body["graph_results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn multipart_upload_is_ingested() {
    let app = app().await;
    let boundary = "ragflow-test-boundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
         Content-Type: text/plain\r\n\r\nquarterly release checklist\r\n--{b}--\r\n",
        b = boundary
    );
    let request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("x-api-key", KEY)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (_, body) = send(
        &app,
        post_json(
            "/retrieval",
            json!({ "query": "release checklist", "metadata": { "filename": "notes.txt" } }),
        ),
    )
    .await;
    let hits = body["vector_results"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["filename"], "notes.txt");
}

#[tokio::test]
async fn unsupported_upload_type_is_rejected() {
    let app = app().await;
    let boundary = "b";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"run.exe\"\r\n\r\nMZ\r\n--{b}--\r\n",
        b = boundary
    );
    let request = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("x-api-key", KEY)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"]["message"],
        "Unsupported file type. Only .txt and .pdf allowed."
    );
}

#[tokio::test]
async fn empty_inputs_are_bad_requests() {
    let app = app().await;

    let (status, body) = send(&app, post_json("/retrieval", json!({ "query": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Query is required.");

    let (status, body) = send(&app, post_json("/completion", json!({ "prompt": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Prompt is required.");

    let (status, _) = send(&app, post_json("/ingest", json!({ "text": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/retrieval")
        .header("x-api-key", KEY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn graph_routes_report_unavailable() {
    let app = app().await;
    let (status, body) = send(&app, post_json("/graph/search", json!({ "query": "x" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "unavailable");

    let (status, _) = send(
        &app,
        post_json("/graph/temporal", json!({ "entity_name": "Acme" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unsafe_crawl_urls_are_rejected() {
    let app = app().await;
    for url in [
        "http://127.0.0.1/admin",
        "http://169.254.169.254/latest/meta-data",
        "file:///etc/passwd",
        "http://10.0.0.5/",
    ] {
        let (status, body) = send(&app, post_json("/crawl", json!({ "url": url }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{url}: {body}");
    }

    let (status, body) = send(&app, post_json("/crawl", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "url is required.");
}

#[tokio::test]
async fn deferred_job_lifecycle() {
    let app = app().await;

    let (status, job) = send(
        &app,
        post_json("/crawl", json!({ "url": "http://93.184.216.34/", "start": false })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{job}");
    assert_eq!(job["status"], "pending");
    let id = job["id"].as_str().unwrap().to_string();

    let (status, fetched) = send(&app, get(&format!("/crawl/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["url"], "http://93.184.216.34/");

    let (status, body) = send(&app, post_json(&format!("/crawl/{}/cancel", id), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["status"], "cancelled");

    let (status, _) = send(&app, post_json(&format!("/crawl/{}/start", id), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send(&app, post_json(&format!("/crawl/{}/cancel", id), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, list) = send(&app, get("/crawl?status=cancelled")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["count"], 1);
}

#[tokio::test]
async fn crawl_lookup_and_listing_validation() {
    let app = app().await;

    let (status, body) = send(&app, get("/crawl/2b1e8a52-5f8c-4d0e-9c43-0d1f5b1a7e10")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["message"], "Job not found");

    let (status, _) = send(&app, get("/crawl/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get("/crawl?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, get("/crawl?limit=101")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, get("/crawl?status=sleeping")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, get("/crawl")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);

    let (status, stats) = send(&app, get("/crawl/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["workers"]["max_concurrent_jobs"], 2);
}

/// Request to `/crawl/stats` arriving from socket address `peer`.
fn stats_from(peer: &str, forwarded_for: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri("/crawl/stats").header("x-api-key", KEY);
    if let Some(ip) = forwarded_for {
        builder = builder.header("x-forwarded-for", ip);
    }
    let mut request = builder.body(Body::empty()).unwrap();
    let peer: SocketAddr = format!("{}:50000", peer).parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

#[tokio::test]
async fn rate_limit_applies_per_client() {
    let mut config = test_config();
    config.rate_limit.requests_per_hour = 2;
    let app = app_with(config).await;

    for expected_remaining in ["1", "0"] {
        let response = app.clone().oneshot(stats_from("203.0.113.1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], expected_remaining);
    }

    let response = app.clone().oneshot(stats_from("203.0.113.1", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    let response = app.clone().oneshot(stats_from("203.0.113.2", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unauthenticated requests never reach the limiter.
    let mut request = Request::builder()
        .uri("/crawl/stats")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo("203.0.113.2:50000".parse::<SocketAddr>().unwrap()));
    assert_eq!(
        app.clone().oneshot(request).await.unwrap().status(),
        StatusCode::UNAUTHORIZED
    );
    let response = app.oneshot(stats_from("203.0.113.2", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rotating_forwarded_for_does_not_reset_quota() {
    let mut config = test_config();
    config.rate_limit.requests_per_hour = 2;
    let app = app_with(config).await;

    let mut statuses = Vec::new();
    for n in 0..20 {
        let spoofed = format!("198.51.100.{}", n);
        let response = app
            .clone()
            .oneshot(stats_from("203.0.113.9", Some(&spoofed)))
            .await
            .unwrap();
        statuses.push(response.status());
    }
    let allowed = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    assert_eq!(allowed, 2);
    assert_eq!(statuses[2], StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn trusted_proxy_forwards_client_address() {
    let mut config = test_config();
    config.rate_limit.requests_per_hour = 1;
    config.server.trusted_proxies = vec!["10.0.0.1".parse().unwrap()];
    let app = app_with(config).await;

    let via_proxy = |client: &str| stats_from("10.0.0.1", Some(client));
    assert_eq!(
        app.clone().oneshot(via_proxy("203.0.113.1")).await.unwrap().status(),
        StatusCode::OK
    );
    assert_eq!(
        app.clone().oneshot(via_proxy("203.0.113.1")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        app.oneshot(via_proxy("203.0.113.2")).await.unwrap().status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn config_files_are_served_per_app() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("global.toml"), "level = 1").unwrap();
    std::fs::create_dir(dir.path().join("billing")).unwrap();
    std::fs::write(dir.path().join("billing/app.json"), "{}").unwrap();

    let mut config = test_config();
    config.server.config_dir = dir.path().to_path_buf();
    let app = app_with(config).await;

    let request = Request::builder()
        .uri("/config")
        .header("x-api-key", KEY)
        .header("x-app", "billing")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["configs"]["global.toml"], "level = 1");
    assert_eq!(body["configs"]["billing/app.json"], "{}");

    let (status, body) = send(&app, get("/config?file=missing.yaml")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let mut config = test_config();
    config.server.max_upload_bytes = 1024;
    let app = app_with(config).await;

    let text = "a".repeat(4096);
    let (status, body) = send(&app, post_json("/ingest", json!({ "text": text }))).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["code"], "payload_too_large");
}
