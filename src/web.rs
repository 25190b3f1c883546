use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::broadcast::LiveBroadcaster;
use crate::model::{
    ChannelInput, CheckKind, CheckResult, NotificationChannel, Status, Target, TargetInput,
};
use crate::notify::{Dispatcher, TransitionEvent};
use crate::store::{Store, StoreError};

const MAX_RESULTS_WINDOW: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub live: LiveBroadcaster,
    pub shutdown_tx: broadcast::Sender<()>, // Ends SSE streams on shutdown
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/healthz", get(healthz))
        .route("/api/events", get(sse_handler))
        .route("/api/targets", get(list_targets).post(create_target))
        .route("/api/targets/:id", put(update_target).delete(delete_target))
        .route("/api/results/:target_id", get(list_results))
        .route("/api/channels", get(list_channels).post(create_channel))
        .route("/api/channels/:id", put(update_channel).delete(delete_channel))
        .route("/api/channels/:id/test", post(test_channel))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TargetNotFound(_) | StoreError::ChannelNotFound(_) => ApiError::NotFound(e.to_string()),
            StoreError::InvalidTarget(_) | StoreError::InvalidChannel(_) => ApiError::BadRequest(e.to_string()),
            StoreError::Persistence(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => {
                tracing::error!("API error: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn sse_handler(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let snapshot = serde_json::to_string(&state.store.status_snapshot()).unwrap_or_default();
    let initial_event = Ok(Event::default().event("init").data(snapshot));

    let rx = state.live.subscribe();
    let updates = tokio_stream::wrappers::BroadcastStream::new(rx).map(|msg| match msg {
        Ok(json) => Ok(Event::default().event("update").data(json)),
        Err(_) => Ok(Event::default().event("error").data("stream lagged")),
    });

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let stream = futures::stream::once(async { initial_event })
        .chain(updates)
        .take_until(async move {
            let _ = shutdown_rx.recv().await;
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn list_targets(State(state): State<AppState>) -> Json<Vec<Target>> {
    Json(state.store.list_targets())
}

async fn create_target(
    State(state): State<AppState>,
    Json(input): Json<TargetInput>,
) -> Result<Json<Target>, ApiError> {
    let target = state.store.create_target(input).await?;
    tracing::info!("Created target {} ({})", target.id, target.name);
    Ok(Json(target))
}

async fn update_target(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(input): Json<TargetInput>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.update_target(id, input).await?;
    Ok(Json(json!({ "updated": true })))
}

async fn delete_target(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete_target(id).await?;
    tracing::info!("Deleted target {}", id);
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    limit: Option<usize>,
}

async fn list_results(
    State(state): State<AppState>,
    Path(target_id): Path<u64>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Vec<CheckResult>>, ApiError> {
    if state.store.get_target(target_id).is_none() {
        return Err(StoreError::TargetNotFound(target_id).into());
    }
    let limit = query.limit.unwrap_or(MAX_RESULTS_WINDOW).clamp(1, MAX_RESULTS_WINDOW);
    Ok(Json(state.store.results_for(target_id, limit)))
}

async fn list_channels(State(state): State<AppState>) -> Json<Vec<NotificationChannel>> {
    Json(state.store.list_channels())
}

async fn create_channel(
    State(state): State<AppState>,
    Json(input): Json<ChannelInput>,
) -> Result<Json<NotificationChannel>, ApiError> {
    let channel = state.store.create_channel(input).await?;
    tracing::info!("Created {} channel {} ({})", channel.kind.as_str(), channel.id, channel.name);
    Ok(Json(channel))
}

async fn update_channel(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(input): Json<ChannelInput>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.update_channel(id, input).await?;
    Ok(Json(json!({ "updated": true })))
}

async fn delete_channel(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete_channel(id).await?;
    Ok(Json(json!({ "deleted": true })))
}

/// Sends a synthetic recovery through one channel, enabled or not.
async fn test_channel(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let channel = state
        .store
        .get_channel(id)
        .ok_or(StoreError::ChannelNotFound(id))?;

    let event = TransitionEvent {
        target_name: format!("{} (test)", channel.name),
        target_kind: CheckKind::Http,
        target_endpoint: "https://example.com".to_string(),
        status: Status::Up,
        message: Some("This is a test notification.".to_string()),
        latency_ms: Some(0),
        timestamp: Utc::now(),
    };
    match state.dispatcher.send_to_channel(&channel, &event).await {
        Ok(()) => Ok(Json(json!({ "sent": true }))),
        Err(e) => Ok(Json(json!({ "sent": false, "error": e.to_string() }))),
    }
}
