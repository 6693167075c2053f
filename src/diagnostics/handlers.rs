use crate::transport::{ConnectionPhase, TransportStatsSnapshot};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::debug;

use super::server::DiagnosticsState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connection: ConnectionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransportResponse {
    connection: ConnectionPhase,
    attempt: u32,
    joined_rooms: Vec<String>,
    stats: TransportStatsSnapshot,
}

/// 503 once the channel has given up reconnecting
pub async fn health_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    let connection = state.transport.state();
    let (code, status) = match connection.phase {
        ConnectionPhase::Connected => (StatusCode::OK, "ok"),
        ConnectionPhase::Failed => (StatusCode::SERVICE_UNAVAILABLE, "failed"),
        _ => (StatusCode::OK, "degraded"),
    };

    let body = HealthResponse {
        status,
        connection: connection.phase,
        connection_error: connection.connection_error().map(|e| e.to_string()),
    };
    (code, Json(body))
}

pub async fn session_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    debug!("Serving session snapshot");
    Json(state.session.snapshot())
}

pub async fn transport_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    let connection = state.transport.state();
    Json(TransportResponse {
        connection: connection.phase,
        attempt: connection.attempt,
        joined_rooms: state.transport.joined_rooms(),
        stats: state.transport.stats(),
    })
}

pub async fn incidents_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    let incidents: Vec<_> = state.session.recent_incidents().iter().cloned().collect();
    Json(incidents)
}

/// 404 unless a global feed is attached
pub async fn global_incidents_handler(State(state): State<DiagnosticsState>) -> impl IntoResponse {
    match &state.feed {
        Some(feed) => Json(feed.snapshot()).into_response(),
        None => (StatusCode::NOT_FOUND, Json("global incident feed not attached")).into_response(),
    }
}
