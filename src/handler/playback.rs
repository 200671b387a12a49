use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::USER_AGENT},
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::PlaybackError,
    handler::{ApiJsonResult, ApiResult},
    playback::service::{
        PlaybackService, PlaybackSessionResponse, StartPlaybackRequest, session_to_response,
    },
};

pub fn playback_router(service: Arc<PlaybackService>) -> Router {
    Router::new()
        .route("/sessions", post(start_session))
        .route("/sessions/{id}", get(get_session).delete(stop_session))
        .route("/sessions/{id}/heartbeat", post(heartbeat))
        .with_state(service)
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    position_seconds: Option<f64>,
}

async fn start_session(
    State(service): State<Arc<PlaybackService>>,
    headers: HeaderMap,
    Json(request): Json<StartPlaybackRequest>,
) -> ApiResult<(StatusCode, Json<PlaybackSessionResponse>)> {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let session = service.start_session(&request, user_agent).await?;
    Ok((StatusCode::CREATED, Json(session_to_response(&session))))
}

async fn get_session(
    State(service): State<Arc<PlaybackService>>,
    Path(id): Path<String>,
) -> ApiJsonResult<PlaybackSessionResponse> {
    let id = Uuid::parse_str(&id)?;
    let session = service
        .get_session(&id)
        .await
        .ok_or(PlaybackError::SessionNotFound(id))?;
    Ok(Json(session_to_response(&session)))
}

async fn heartbeat(
    State(service): State<Arc<PlaybackService>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiJsonResult<PlaybackSessionResponse> {
    let id = Uuid::parse_str(&id)?;
    // An empty body is a plain keep-alive.
    let request: HeartbeatRequest = if body.is_empty() {
        HeartbeatRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| PlaybackError::InvalidRequest(format!("heartbeat body: {}", e)))?
    };
    let session = service
        .heartbeat_session(id, request.position_seconds)
        .await?;
    Ok(Json(session_to_response(&session)))
}

async fn stop_session(
    State(service): State<Arc<PlaybackService>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = Uuid::parse_str(&id)?;
    service.stop_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
