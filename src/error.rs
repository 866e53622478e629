use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    UnprocessableEntity(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Dependency(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            AppError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "Bad request.", Some(message))
            }
            AppError::UnprocessableEntity(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation failed.",
                Some(message),
            ),
            AppError::Forbidden(message) => (StatusCode::FORBIDDEN, "Forbidden.", Some(message)),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, "Not found.", Some(message)),
            AppError::Conflict(message) => (StatusCode::CONFLICT, "Conflict.", Some(message)),
            AppError::Dependency(message) => {
                tracing::error!(error = %message, "Dependency failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "A backing service is unavailable.",
                    Some(message),
                )
            }
            AppError::Internal(message) => {
                tracing::error!(error = %message, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error.",
                    Some(message),
                )
            }
        };

        let body = match details {
            Some(details) => Json(json!({ "error": error, "details": details })),
            None => Json(json!({ "error": error })),
        };
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
