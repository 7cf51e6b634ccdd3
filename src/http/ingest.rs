//! Ingest API.
//!
//! Provides:
//! - `/health`, `/ready`, `/live` - Liveness and readiness
//! - `/metrics` - Publish statistics
//! - `POST /events` - Submit an event
//! - `GET /events?limit=N` - Recent events from the analytical store
//! - `POST /chat` - Ask the assistant about the pipeline

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::analytics::{AnalyticsError, EventSummary};
use crate::assistant::{Assistant, AssistantError};
use crate::channel::{ChannelError, MAX_PAYLOAD_SIZE};
use crate::event::NewEvent;
use crate::now_millis;
use crate::producer::{Producer, ProducerError};

const DEFAULT_EVENTS_LIMIT: usize = 10;
const MAX_EVENTS_LIMIT: usize = 1000;

/// Request bodies up to twice the channel's payload limit are parsed, so an
/// oversized event is refused by the channel (400) rather than by the body
/// reader (413).
const MAX_BODY_SIZE: usize = 2 * MAX_PAYLOAD_SIZE;

/// Shared state for the ingest handlers.
#[derive(Clone)]
pub struct IngestState {
    producer: Arc<Producer>,
    assistant: Arc<Assistant>,
}

impl IngestState {
    pub fn new(producer: Arc<Producer>, assistant: Arc<Assistant>) -> Self {
        Self {
            producer,
            assistant,
        }
    }
}

/// Create the ingest API router.
pub fn create_router(state: IngestState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .route("/metrics", get(metrics_handler))
        .route("/events", post(create_event_handler).get(list_events_handler))
        .route("/chat", post(chat_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = match rejection.status() {
            StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, rejection.body_text())
    }
}

impl From<ProducerError> for ApiError {
    fn from(e: ProducerError) -> Self {
        let status = match &e {
            ProducerError::InvalidEvent(_) | ProducerError::Channel(ChannelError::Rejected(_)) => {
                StatusCode::BAD_REQUEST
            }
            ProducerError::Channel(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProducerError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<AnalyticsError> for ApiError {
    fn from(e: AnalyticsError) -> Self {
        let status = match e {
            AnalyticsError::UnknownTable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl From<AssistantError> for ApiError {
    fn from(e: AssistantError) -> Self {
        let status = match e {
            AssistantError::Unconfigured => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, format!("Chat error: {e}"))
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    version: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        timestamp: now_millis(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ready_handler() -> impl IntoResponse {
    Json(json!({"status": "ready"}))
}

async fn live_handler() -> impl IntoResponse {
    Json(json!({"status": "alive"}))
}

async fn metrics_handler(State(state): State<IngestState>) -> impl IntoResponse {
    Json(state.producer.stats())
}

#[derive(Debug, Serialize)]
struct EventResponse {
    event_id: String,
    message: &'static str,
}

async fn create_event_handler(
    State(state): State<IngestState>,
    body: Result<Json<NewEvent>, JsonRejection>,
) -> Result<Json<EventResponse>, ApiError> {
    let Json(event) = body?;
    let receipt = state.producer.submit(event).await?;
    Ok(Json(EventResponse {
        event_id: receipt.event_id,
        message: "Event created successfully",
    }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EventsResponse {
    events: Vec<EventSummary>,
    count: usize,
}

async fn list_events_handler(
    State(state): State<IngestState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENTS_LIMIT)
        .clamp(1, MAX_EVENTS_LIMIT);
    let events = state
        .producer
        .analytics()
        .recent_events(&state.producer.config().table, limit)
        .await?;
    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
    timestamp: i64,
}

async fn chat_handler(
    State(state): State<IngestState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(request) = body?;
    let response = state.assistant.answer(&request.message).await?;
    Ok(Json(ChatResponse {
        response,
        timestamp: now_millis(),
    }))
}
