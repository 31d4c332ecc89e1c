use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The tryout window is not open: attempts cannot start or mutate.
    #[error("Scheduling violation: {0}")]
    Scheduling(String),

    /// Submission attempted while the authoritative deadline has not elapsed.
    #[error("Submission refused: {seconds_remaining}s still remaining")]
    PrematureSubmit { seconds_remaining: i64 },

    /// No well-formed deadline is persisted for the active subtest; the
    /// client must save/resync before submitting.
    #[error("Malformed timer state: {0}")]
    MalformedTimer(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Client-side local persistence failure (event log / backup store).
    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            // Carries the countdown so clients can schedule an exact retry.
            Error::PrematureSubmit { seconds_remaining } => {
                let body = Json(json!({
                    "error": "deadline_not_elapsed",
                    "message": format!(
                        "Submission is only accepted once the subtest deadline has elapsed ({seconds_remaining}s remaining)"
                    ),
                    "seconds_remaining": seconds_remaining,
                }));
                return (StatusCode::CONFLICT, body).into_response();
            }
            Error::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Error::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Error::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Error::Scheduling(msg) => (StatusCode::FORBIDDEN, "tryout_closed", msg),
            Error::MalformedTimer(msg) => (StatusCode::CONFLICT, "timer_out_of_sync", msg),
            Error::Validation(err) => {
                (StatusCode::BAD_REQUEST, "validation_failed", err.to_string())
            }
            Error::Database(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "database_error",
                err.to_string(),
            ),
            Error::Json(err) => (StatusCode::BAD_REQUEST, "bad_json", err.to_string()),
            Error::Reqwest(err) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                format!("External service error: {}", err),
            ),
            Error::Storage(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg),
            Error::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            Error::Io(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                err.to_string(),
            ),
            Error::Anyhow(err) => (StatusCode::BAD_REQUEST, "bad_request", err.to_string()),
            Error::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An unexpected error occurred".to_string(),
            ),
        };

        let body = Json(json!({ "error": code, "message": message }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("Resource not found".to_string()),
            other => Error::Database(other),
        }
    }
}
