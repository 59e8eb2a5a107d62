//! Tandem Road: the signaling relay that pairs two clients in a named room.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod signaling;
pub mod websocket;

use axum::{routing::get, Router};
use tandem_proto::SIGNALING_PATH;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, stats};
use crate::signaling::HubHandle;
use crate::websocket::websocket_handler;

pub fn router(hub: HubHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route(SIGNALING_PATH, get(websocket_handler))
        .with_state(hub)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalingHub;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[test_timeout::tokio_timeout_test]
    async fn health_returns_constant_ok() {
        let app = router(SignalingHub::default().spawn(4));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stats_reports_empty_hub() {
        let app = router(SignalingHub::default().spawn(4));
        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, serde_json::json!({"rooms": 0, "connections": 0}));
    }
}
