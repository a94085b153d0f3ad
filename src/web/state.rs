use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::error::ForecastError;
use crate::service::ForecastService;

#[derive(Clone)]
pub struct AppState {
    pub service: ForecastService,
}

impl AppState {
    pub fn new(service: ForecastService) -> Self {
        Self { service }
    }
}

/// Error body returned by every handler: `{"error": kind, "message": text}`
#[derive(Debug)]
pub struct ApiError(pub ForecastError);

impl From<ForecastError> for ApiError {
    fn from(err: ForecastError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &ForecastError) -> StatusCode {
    match err {
        ForecastError::NotFound(_) => StatusCode::NOT_FOUND,
        ForecastError::DuplicateModel { .. } | ForecastError::AlreadyRunning(_) => StatusCode::CONFLICT,
        ForecastError::ModelNotReady { .. }
        | ForecastError::ArtifactMissing(_)
        | ForecastError::MemberNotReady { .. }
        | ForecastError::AlignmentError(_)
        | ForecastError::InsufficientHistory { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ForecastError::InvalidInput(_) | ForecastError::UnknownArchitecture(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(json!({
                "error": self.0.kind(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelStatus;

    #[test]
    fn test_error_kinds_map_to_status_codes() {
        assert_eq!(status_for(&ForecastError::NotFound("model 1".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&ForecastError::AlreadyRunning(1)), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&ForecastError::ModelNotReady { model_id: 1, status: ModelStatus::Created }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status_for(&ForecastError::UnknownArchitecture("X".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&ForecastError::Training("boom".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
