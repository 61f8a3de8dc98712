use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rideshare_coord::CoordinationError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    NotFoundError(String),
    ConflictError(String),
    ServiceUnavailable(String),
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::ServiceUnavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable, retry later".to_string())
            }
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<CoordinationError> for AppError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::NotFound(_) => AppError::NotFoundError(err.to_string()),
            CoordinationError::Validation(_) => AppError::ValidationError(err.to_string()),
            CoordinationError::Forbidden(_) => AppError::AuthorizationError(err.to_string()),
            CoordinationError::InsufficientCapacity { .. }
            | CoordinationError::AlreadyBooked { .. }
            | CoordinationError::InvalidTransition { .. } => AppError::ConflictError(err.to_string()),
            CoordinationError::Persistence(ref e) if e.is_retryable() => {
                AppError::ServiceUnavailable(err.to_string())
            }
            CoordinationError::Persistence(_) => AppError::InternalServerError(err.to_string()),
        }
    }
}
