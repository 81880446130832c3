//! Tracing setup and HTTP access logging.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_SETTINGS: &str = "ragflow_slim=info,ragflow=info,tower_http=info";

/// Install the global subscriber.
///
/// The filter comes from `RUST_LOG`, then `RAGFLOW_LOG_LEVEL`, then
/// `default_log_settings`. Calling twice is harmless; the second call is
/// ignored.
pub fn setup_logging(default_log_settings: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("RAGFLOW_LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_settings));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Logs each request with its status and latency, at a level matching the status class.
pub async fn log_route_access(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let duration_ms = start.elapsed().as_millis();
    let status = response.status().as_u16();

    match status {
        500..=599 => tracing::error!(%method, %path, status, duration_ms, "request failed"),
        400..=499 => tracing::warn!(%method, %path, status, duration_ms, "request rejected"),
        _ => tracing::info!(%method, %path, status, duration_ms, "request served"),
    }

    response
}
