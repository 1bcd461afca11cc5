use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage call timed out")]
    Timeout,

    #[error("no subscription for account")]
    NoSubscription,

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Time parse error: {0}")]
    TimeParse(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for QuotaError {
    fn from(e: rusqlite::Error) -> Self {
        QuotaError::StorageUnavailable(e.to_string())
    }
}

impl From<tokio_postgres::Error> for QuotaError {
    fn from(e: tokio_postgres::Error) -> Self {
        QuotaError::StorageUnavailable(e.to_string())
    }
}

impl QuotaError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            QuotaError::StorageUnavailable(_) | QuotaError::Timeout => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            QuotaError::NoSubscription => StatusCode::NOT_FOUND,
            QuotaError::InvalidPlan(_)
            | QuotaError::UnknownFeature(_)
            | QuotaError::BadRequest(_)
            | QuotaError::Json(_)
            | QuotaError::TimeParse(_) => StatusCode::BAD_REQUEST,
            QuotaError::Conflict(_) => StatusCode::CONFLICT,
            QuotaError::Io(_) | QuotaError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            QuotaError::StorageUnavailable(_) => "storage_unavailable",
            QuotaError::Timeout => "timeout",
            QuotaError::NoSubscription => "no_subscription",
            QuotaError::InvalidPlan(_) => "invalid_plan",
            QuotaError::UnknownFeature(_) => "unknown_feature",
            QuotaError::BadRequest(_) | QuotaError::Json(_) | QuotaError::TimeParse(_) => {
                "bad_request"
            }
            QuotaError::Conflict(_) => "conflict",
            QuotaError::Io(_) | QuotaError::Config(_) => "internal",
        }
    }
}

impl IntoResponse for QuotaError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Infrastructure failures never leak details; callers deny and retry.
        let message = if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!(error = %self, "storage failure surfaced to caller");
            "temporarily unavailable, try again".to_string()
        } else if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = serde_json::json!({
            "success": false,
            "error": self.code(),
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, QuotaError>;
