use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mltr_db::DbError;
use mltr_types::PublishError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Translation not ready")]
    TranslationNotReady,

    #[error("Task with ID {0} not found")]
    TaskNotFound(String),

    #[error("Translation for language {0} not found")]
    TranslationMissing(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DbError),

    #[error("Broker publish error: {0}")]
    PublishError(#[from] PublishError),

    #[error("Internal Server Error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::TranslationNotReady => {
                (StatusCode::BAD_REQUEST, "Translation not ready".to_string())
            }
            ApiError::TaskNotFound(id) => {
                (StatusCode::NOT_FOUND, format!("Task with ID {} not found", id))
            }
            ApiError::TranslationMissing(language) => (
                StatusCode::NOT_FOUND,
                format!("Translation for language {} not found", language),
            ),
            ApiError::DatabaseError(e) => {
                error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e))
            }
            ApiError::PublishError(e) => {
                error!("Broker publish error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to enqueue task: {}", e),
                )
            }
            ApiError::InternalServerError(msg) => {
                error!("Internal Server Error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("An internal error occurred: {}", msg),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
