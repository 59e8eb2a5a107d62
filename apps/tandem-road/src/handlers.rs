use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use tracing::error;

use crate::signaling::{HubHandle, HubStats};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

/// GET /health - constant liveness answer for keep-alive pollers
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// GET /stats - room and connection counts from the hub reactor
pub async fn stats(State(hub): State<HubHandle>) -> Result<Json<HubStats>, StatusCode> {
    match hub.stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) => {
            error!("Failed to read hub stats: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
