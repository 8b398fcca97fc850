//! HTTP Observability Surface
//!
//! Health, per-session stats and Prometheus exposition, served off the
//! frame hot path and derived read-only from the session registry.

use crate::registry::SessionRegistry;
use crate::session::SessionStats;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    registry: Arc<SessionRegistry>,
    prometheus: Arc<prometheus::Registry>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

/// Build the observability router.
pub fn router(registry: Arc<SessionRegistry>, prometheus: Arc<prometheus::Registry>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(HttpState {
            registry,
            prometheus,
        })
}

async fn health_handler(State(state): State<HttpState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.registry.len(),
    })
}

async fn sessions_handler(State(state): State<HttpState>) -> Json<Vec<SessionStats>> {
    Json(state.registry.stats())
}

async fn metrics_handler(
    State(state): State<HttpState>,
) -> Result<Response, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = state.prometheus.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let body = String::from_utf8(buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response())
}
