//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Status, version, provider info (no auth) |
//! | `GET`  | `/config` | Bootstrap config files for an app |
//! | `POST` | `/completion` | Forward a prompt to the LLM provider |
//! | `POST` | `/ingest` | Store a document (multipart file or JSON text) |
//! | `POST` | `/retrieval` | Vector search plus graph facts |
//! | `POST` | `/graph/search` | Knowledge-graph search |
//! | `POST` | `/graph/temporal` | Facts about an entity within a time range |
//! | `POST` | `/crawl` | Create a crawl job |
//! | `GET`  | `/crawl` | List crawl jobs |
//! | `GET`  | `/crawl/stats` | Dedup, domain throttle and worker stats |
//! | `GET`  | `/crawl/{job_id}` | Job status and result |
//! | `POST` | `/crawl/{job_id}/start` | Start a deferred job |
//! | `POST` | `/crawl/{job_id}/cancel` | Cancel a job |
//!
//! Every route except `/health` requires `X-API-KEY`. Every authenticated
//! route except `/config` is also subject to the per-client rate limit,
//! checked after authentication.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Query is required." } }
//! ```

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ConnectInfo, DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{require_api_key, ApiKey, API_KEY_HEADER};
use crate::bootstrap;
use crate::config::{Config, ServerConfig};
use crate::crawl::service::{CrawlJobRequest, ListQuery};
use crate::error::ServiceError;
use crate::extract::{self, sanitize_filename};
use crate::graph;
use crate::ingest::IngestRequest;
use crate::llm::ProviderInfo;
use crate::logging::log_route_access;
use crate::retrieval::RetrievalRequest;
use crate::state::{Backends, Services};

const APP_HEADER: &str = "x-app";
const MAX_GRAPH_RESULTS: usize = 50;
const DEFAULT_GRAPH_RESULTS: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub api_key: ApiKey,
}

impl AppState {
    pub fn new(services: Services, api_key: ApiKey) -> Self {
        Self { services, api_key }
    }

    fn body_limit(&self) -> usize {
        self.services.config.server.max_upload_bytes
    }
}

/// Resolve the key, connect the backends, recover unfinished crawl jobs and
/// serve until Ctrl-C.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let api_key = ApiKey::resolve(config.server.api_key.as_deref(), config.server.environment)?;
    let bind_addr = config.server.bind.clone();
    let environment = config.server.environment;

    let backends = Backends::from_config(&config).await?;
    let services = Services::build(config, backends).await?;
    services.crawl.manager().resume_unfinished().await?;

    let app = router(AppState::new(services.clone(), api_key));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, %environment, "RAGFlow Slim listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    services.crawl.manager().shutdown();
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = server
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(API_KEY_HEADER)])
}

fn security_headers() -> [(HeaderName, HeaderValue); 5] {
    [
        (
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        (header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY")),
        (
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ),
        (
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ),
        (
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'self'"),
        ),
    ]
}

/// Build the full router. Connection info is optional: without it every
/// client shares one rate-limit key.
pub fn router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/completion", post(handle_completion))
        .route("/ingest", post(handle_ingest))
        .route("/retrieval", post(handle_retrieval))
        .route("/graph/search", post(handle_graph_search))
        .route("/graph/temporal", post(handle_graph_temporal))
        .route("/crawl", post(handle_create_crawl).get(handle_list_crawls))
        .route("/crawl/stats", get(handle_crawl_stats))
        .route("/crawl/{job_id}", get(handle_get_crawl))
        .route("/crawl/{job_id}/start", post(handle_start_crawl))
        .route("/crawl/{job_id}/cancel", post(handle_cancel_crawl))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ));

    let protected = Router::new()
        .route("/config", get(handle_config))
        .merge(limited)
        .route_layer(middleware::from_fn_with_state(
            state.api_key.clone(),
            require_api_key,
        ));

    let mut app = Router::new()
        .route("/health", get(handle_health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.body_limit()));
    for (name, value) in security_headers() {
        app = app.layer(SetResponseHeaderLayer::overriding(name, value));
    }

    app.layer(cors_layer(&state.services.config.server))
        .layer(middleware::from_fn(log_route_access))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Rate limiting ============

/// Client address from `X-Forwarded-For`: the rightmost hop that is not a
/// trusted proxy. A malformed chain is ignored as a whole.
fn forwarded_for(headers: &HeaderMap, trusted: &[IpAddr]) -> Option<IpAddr> {
    let chain = headers
        .get_all("x-forwarded-for")
        .iter()
        .map(|value| value.to_str().ok())
        .collect::<Option<Vec<_>>>()?;
    let hops = chain
        .iter()
        .flat_map(|value| value.split(','))
        .map(|hop| hop.trim().parse::<IpAddr>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    hops.into_iter().rev().find(|hop| !trusted.contains(hop))
}

fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers.get("x-real-ip")?.to_str().ok()?.trim().parse().ok()
}

/// Rate-limit key for a request: the socket peer address. When the peer is
/// one of `trusted` proxies, the forwarded client address is used instead
/// (`X-Forwarded-For`, then `X-Real-IP`). Without connection info every
/// request shares the key `"unknown"`.
pub fn client_key(request: &Request, trusted: &[IpAddr]) -> String {
    let Some(ConnectInfo(peer)) = request.extensions().get::<ConnectInfo<SocketAddr>>() else {
        return "unknown".to_string();
    };
    let peer = peer.ip();
    if !trusted.contains(&peer) {
        return peer.to_string();
    }
    forwarded_for(request.headers(), trusted)
        .or_else(|| real_ip(request.headers()))
        .unwrap_or(peer)
        .to_string()
}

async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let limiter = &state.services.limiter;
    let client = client_key(&request, &state.services.config.server.trusted_proxies);
    let decision = limiter.allow(&client).await?;
    if !decision.allowed {
        let retry_after_secs = decision
            .retry_after
            .map(|d| d.num_seconds().max(1) as u64)
            .unwrap_or(1);
        tracing::warn!(%client, retry_after_secs, "client rate limit exceeded");
        return Err(ServiceError::RateLimited { retry_after_secs });
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(limiter.limit()));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    Ok(response)
}

// ============ Request helpers ============

fn rejected(status: StatusCode, message: String, limit: usize) -> ServiceError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ServiceError::PayloadTooLarge { limit }
    } else {
        ServiceError::validation(message)
    }
}

fn json_body<T>(state: &AppState, body: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    body.map(|Json(value)| value)
        .map_err(|r| rejected(r.status(), r.body_text(), state.body_limit()))
}

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    backend: &'static str,
    llm: ProviderInfo,
    graph_available: bool,
    timestamp: chrono::DateTime<Utc>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let services = &state.services;
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        environment: services.config.server.environment.to_string(),
        backend: services.backend,
        llm: services.provider_info.clone(),
        graph_available: services.graph.is_available(),
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigQuery {
    app: Option<String>,
    file: Option<String>,
}

async fn handle_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ConfigQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let Query(query) = query.map_err(|r| ServiceError::validation(r.body_text()))?;
    let app = headers
        .get(APP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.app);
    let dir = state.services.config.server.config_dir.clone();
    let file = query.file;

    let configs = tokio::task::spawn_blocking(move || {
        bootstrap::load_config_files(&dir, app.as_deref(), file.as_deref())
    })
    .await
    .map_err(anyhow::Error::from)??;

    if configs.is_empty() {
        return Ok(Json(serde_json::json!({
            "configs": {},
            "message": "No config files found for the provided context.",
        })));
    }
    Ok(Json(serde_json::json!({ "configs": configs })))
}

#[derive(Debug, Deserialize)]
struct CompletionRequest {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    model: Option<String>,
}

async fn handle_completion(
    State(state): State<AppState>,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let request = json_body(&state, body)?;
    let prompt = request.prompt.trim();
    if prompt.is_empty() {
        return Err(ServiceError::validation("Prompt is required."));
    }
    let model = request.model.as_deref().map(str::trim).filter(|m| !m.is_empty());

    let completion = state
        .services
        .llm
        .complete(prompt, model)
        .await
        .map_err(|e| ServiceError::upstream("llm", e))?;

    state
        .services
        .outputs
        .record(
            "completion",
            &serde_json::json!({ "prompt": prompt, "completion": completion }),
        )
        .await;
    tracing::info!(provider = %completion.provider, model = %completion.model, "completion served");

    Ok(Json(serde_json::json!({
        "completion": completion.text,
        "provider": completion.provider,
        "model": completion.model,
    })))
}

#[derive(Debug, Deserialize)]
struct IngestJson {
    #[serde(default)]
    text: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

async fn ingest_request_from_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<IngestRequest, ServiceError> {
    let limit = state.body_limit();
    let mut upload = None;
    let mut extra = serde_json::Map::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| rejected(e.status(), e.body_text(), limit))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "uploaded_file".to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| rejected(e.status(), e.body_text(), limit))?;
                upload = Some((filename, bytes));
            }
            Some("metadata") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| rejected(e.status(), e.body_text(), limit))?;
                extra = serde_json::from_str(&raw)
                    .map_err(|_| ServiceError::validation("metadata must be a JSON object."))?;
            }
            _ => {}
        }
    }

    let (raw_name, bytes) =
        upload.ok_or_else(|| ServiceError::validation("No file part in request."))?;
    let filename =
        sanitize_filename(&raw_name).ok_or_else(|| ServiceError::validation("No selected file."))?;

    let name = filename.clone();
    let text = tokio::task::spawn_blocking(move || extract::extract_text(&name, &bytes))
        .await
        .map_err(anyhow::Error::from)?
        .map_err(|e| ServiceError::validation(e.to_string()))?;

    extra.insert("filename".into(), filename.clone().into());
    Ok(IngestRequest {
        text,
        metadata: extra,
        source_description: format!("Document: {}", filename),
        source: filename,
    })
}

fn ingest_request_from_json(body: IngestJson) -> IngestRequest {
    let mut metadata = body.metadata.unwrap_or_default();
    let title = body
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let source = title.clone().unwrap_or_else(|| "text".to_string());
    if let Some(title) = title {
        metadata.insert("title".into(), title.into());
    }
    metadata
        .entry("source")
        .or_insert_with(|| serde_json::Value::from("api"));
    IngestRequest {
        text: body.text,
        metadata,
        source_description: format!("Text submitted via API: {}", source),
        source,
    }
}

async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let ingest = if is_multipart(&headers) {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|r| rejected(r.status(), r.body_text(), state.body_limit()))?;
        ingest_request_from_multipart(&state, multipart).await?
    } else {
        let body = Json::<IngestJson>::from_request(request, &()).await;
        ingest_request_from_json(json_body(&state, body)?)
    };

    let source = ingest.source.clone();
    let outcome = state.services.ingestor.ingest(ingest).await?;
    tracing::info!(document_id = outcome.document_id, %source, "document ingested");

    Ok(Json(serde_json::json!({
        "status": "success",
        "document_id": outcome.document_id,
        "created_at": outcome.created_at,
        "embedded": outcome.embedded,
        "graph": outcome.graph,
    })))
}

async fn handle_retrieval(
    State(state): State<AppState>,
    body: Result<Json<RetrievalRequest>, JsonRejection>,
) -> Result<Json<crate::retrieval::RetrievalResponse>, ServiceError> {
    let request = json_body(&state, body)?;
    let response = state.services.retriever.retrieve(request).await?;
    state.services.outputs.record("retrieval", &response).await;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct GraphSearchRequest {
    #[serde(default)]
    query: String,
    #[serde(default)]
    num_results: Option<usize>,
    #[serde(default)]
    center_node_uuid: Option<String>,
}

fn require_graph(state: &AppState) -> Result<(), ServiceError> {
    if state.services.graph.is_available() {
        Ok(())
    } else {
        Err(ServiceError::Unavailable("graph"))
    }
}

async fn handle_graph_search(
    State(state): State<AppState>,
    body: Result<Json<GraphSearchRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    require_graph(&state)?;
    let request = json_body(&state, body)?;
    let query = request.query.trim();
    if query.is_empty() {
        return Err(ServiceError::validation("Query is required."));
    }
    let num_results = request.num_results.unwrap_or(DEFAULT_GRAPH_RESULTS);
    if num_results < 1 || num_results > MAX_GRAPH_RESULTS {
        return Err(ServiceError::validation(format!(
            "num_results must be between 1 and {}.",
            MAX_GRAPH_RESULTS
        )));
    }

    let results = state
        .services
        .graph
        .search(query, num_results, request.center_node_uuid.as_deref())
        .await
        .map_err(|e| ServiceError::upstream("graph", e))?;
    state.services.outputs.record("graph_search", &results).await;

    Ok(Json(serde_json::json!({
        "count": results.len(),
        "results": results,
    })))
}

#[derive(Debug, Deserialize)]
struct TemporalRequest {
    #[serde(default)]
    entity_name: String,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
}

fn parse_bound(
    name: &str,
    raw: Option<&str>,
) -> Result<Option<chrono::DateTime<Utc>>, ServiceError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => graph::parse_timestamp(value).map(Some).ok_or_else(|| {
            ServiceError::validation(format!(
                "{} must be in ISO format (YYYY-MM-DDTHH:MM:SS)",
                name
            ))
        }),
    }
}

async fn handle_graph_temporal(
    State(state): State<AppState>,
    body: Result<Json<TemporalRequest>, JsonRejection>,
) -> Result<Json<graph::TemporalContext>, ServiceError> {
    require_graph(&state)?;
    let request = json_body(&state, body)?;
    let entity = request.entity_name.trim();
    if entity.is_empty() {
        return Err(ServiceError::validation("entity_name is required."));
    }
    let start = parse_bound("start_time", request.start_time.as_deref())?;
    let end = parse_bound("end_time", request.end_time.as_deref())?;
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(ServiceError::validation("start_time must not be after end_time."));
        }
    }

    let context = graph::temporal_context(state.services.graph.as_ref(), entity, start, end)
        .await
        .map_err(|e| ServiceError::upstream("graph", e))?;
    state.services.outputs.record("temporal_context", &context).await;
    Ok(Json(context))
}

async fn handle_create_crawl(
    State(state): State<AppState>,
    body: Result<Json<CrawlJobRequest>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let request = json_body(&state, body)?;
    let job = state.services.crawl.submit(request).await?;
    state
        .services
        .outputs
        .record(
            "crawl_job_created",
            &serde_json::json!({ "job_id": job.id, "url": job.url, "config": job.config }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

async fn handle_list_crawls(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<crate::crawl::service::JobList>, ServiceError> {
    let Query(query) = query.map_err(|r| ServiceError::validation(r.body_text()))?;
    Ok(Json(state.services.crawl.list(&query).await?))
}

async fn handle_crawl_stats(
    State(state): State<AppState>,
) -> Result<Json<crate::crawl::manager::CrawlStats>, ServiceError> {
    Ok(Json(state.services.crawl.stats().await?))
}

async fn handle_get_crawl(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<crate::crawl::service::CrawlJobResponse>, ServiceError> {
    Ok(Json(state.services.crawl.get(&job_id).await?))
}

async fn handle_start_crawl(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let job = state.services.crawl.start(&job_id).await?;
    Ok(Json(serde_json::json!({
        "message": format!("Job {} started successfully", job.id),
        "job": job,
    })))
}

async fn handle_cancel_crawl(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let job = state.services.crawl.cancel(&job_id).await?;
    Ok(Json(serde_json::json!({
        "message": format!("Job {} cancelled successfully", job.id),
        "job": job,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn from_peer(mut req: Request, peer: [u8; 4]) -> Request {
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 4000))));
        req
    }

    #[test]
    fn client_key_ignores_headers_from_untrusted_peers() {
        let req = from_peer(
            request_with(&[("x-forwarded-for", "203.0.113.7"), ("x-real-ip", "198.51.100.2")]),
            [192, 0, 2, 9],
        );
        assert_eq!(client_key(&req, &[]), "192.0.2.9");

        let trusted: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap()];
        assert_eq!(client_key(&req, &trusted), "192.0.2.9");

        assert_eq!(client_key(&request_with(&[("x-forwarded-for", "203.0.113.7")]), &[]), "unknown");
    }

    #[test]
    fn client_key_uses_forwarded_address_behind_trusted_proxy() {
        let trusted: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];

        let req = from_peer(
            request_with(&[("x-forwarded-for", "198.51.100.66, 203.0.113.7, 10.0.0.2")]),
            [10, 0, 0, 1],
        );
        assert_eq!(client_key(&req, &trusted), "203.0.113.7");

        let req = from_peer(request_with(&[("x-real-ip", "198.51.100.2")]), [10, 0, 0, 1]);
        assert_eq!(client_key(&req, &trusted), "198.51.100.2");

        let req = from_peer(request_with(&[("x-forwarded-for", "not-an-ip")]), [10, 0, 0, 1]);
        assert_eq!(client_key(&req, &trusted), "10.0.0.1");
    }

    #[test]
    fn json_ingest_gets_source_metadata() {
        let request = ingest_request_from_json(IngestJson {
            text: "hello".into(),
            title: Some(" Notes ".into()),
            metadata: None,
        });
        assert_eq!(request.source, "Notes");
        assert_eq!(request.metadata["title"], "Notes");
        assert_eq!(request.metadata["source"], "api");
    }

    #[test]
    fn temporal_bounds_must_parse() {
        assert!(parse_bound("start_time", Some("2024-01-01T00:00:00")).unwrap().is_some());
        assert!(parse_bound("start_time", None).unwrap().is_none());
        assert!(parse_bound("end_time", Some("last tuesday")).is_err());
    }
}
