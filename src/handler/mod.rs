use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::PlaybackError;

pub mod playback;
pub mod stream;

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<uuid::Error>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        match self.0.downcast_ref::<PlaybackError>() {
            Some(PlaybackError::InvalidPath(_) | PlaybackError::InvalidRequest(_)) => {
                StatusCode::BAD_REQUEST
            }
            Some(PlaybackError::CapacityReached { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Some(PlaybackError::NotReady(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Some(
                PlaybackError::SessionNotFound(_)
                | PlaybackError::NotFound(_)
                | PlaybackError::Resolve(_),
            ) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            log::error!("api error: {:#}", self.0);
        } else {
            log::debug!("api {}: {:#}", status, self.0);
        }
        let body = Json(json!({ "error": format!("{:#}", self.0) }));
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return (status, [(header::RETRY_AFTER, "1")], body).into_response();
        }
        (status, body).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
