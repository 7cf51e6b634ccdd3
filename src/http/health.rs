//! Worker health and metrics endpoints.
//!
//! Provides:
//! - `/` and `/health` - Liveness (always healthy while serving)
//! - `/live` - Liveness
//! - `/ready` - Ready once the consumer has subscribed
//! - `/metrics` - Metrics register snapshot
//!
//! Handlers only read the register's atomics, so a stalled consumer never
//! delays a response.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::observability::MetricsRegister;

/// Create the health server router.
pub fn create_router(register: Arc<MetricsRegister>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/live", get(live_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(register)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

async fn live_handler() -> impl IntoResponse {
    Json(json!({"status": "alive"}))
}

async fn ready_handler(State(register): State<Arc<MetricsRegister>>) -> impl IntoResponse {
    if register.is_ready() {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready"})),
        )
    }
}

async fn metrics_handler(State(register): State<Arc<MetricsRegister>>) -> impl IntoResponse {
    Json(register.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::ConsumerStatus;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let app = create_router(Arc::new(MetricsRegister::new()));

        for uri in ["/", "/health"] {
            let (status, body) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "healthy");
        }

        let (status, body) = get_json(app, "/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
    }

    #[tokio::test]
    async fn test_ready_follows_subscription() {
        let register = Arc::new(MetricsRegister::new());
        let app = create_router(register.clone());

        let (status, body) = get_json(app.clone(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");

        register.mark_ready();
        let (status, body) = get_json(app, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_liveness_independent_of_consumer_state() {
        let register = Arc::new(MetricsRegister::new());
        register.set_status(ConsumerStatus::Error);
        let app = create_router(register);

        let (status, _) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let register = Arc::new(MetricsRegister::new());
        register.record_processed(1_700_000_000_000);
        register.record_processed(1_700_000_000_500);
        register.record_error();
        let app = create_router(register);

        let (status, body) = get_json(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_processed"], 2);
        assert_eq!(body["total_errors"], 1);
        assert_eq!(body["last_message_time"], 1_700_000_000_500_i64);
        assert_eq!(body["status"], "running");
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let app = create_router(Arc::new(MetricsRegister::new()));
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
