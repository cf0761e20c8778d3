use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures surfaced at the repository boundary.
#[derive(Error, Debug)]
pub enum RepoError {
    /// Missing row, or a row outside the caller's scope (indistinguishable
    /// by design).
    #[error("not found")]
    NotFound,

    #[error("illegal state transition: {0}")]
    InvalidState(String),

    /// A terminal batch row was asked to change its outcome.
    #[error("batch already terminal with a different outcome")]
    AlreadyTerminal,

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Canonical API error; the only shape handlers return on failure.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHENTICATED",
            message: "missing or invalid credentials".to_string(),
            details: None,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "FORBIDDEN",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: "resource not found".to_string(),
            details: None,
        }
    }

    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL",
            message: "internal error".to_string(),
            details: None,
        }
    }
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::not_found(),
            RepoError::InvalidState(msg) => ApiError {
                status: StatusCode::CONFLICT,
                code: "INVALID_STATE",
                message: msg,
                details: None,
            },
            RepoError::AlreadyTerminal => ApiError {
                status: StatusCode::CONFLICT,
                code: "ALREADY_TERMINAL",
                message: "batch result is already terminal".to_string(),
                details: None,
            },
            RepoError::Db(e) => {
                // Detail stays in the logs; callers get an opaque 500.
                tracing::error!(error = %e, "database failure surfaced to API");
                ApiError::internal()
            }
            RepoError::Corrupt(msg) => {
                tracing::error!(detail = %msg, "corrupt row surfaced to API");
                ApiError::internal()
            }
        }
    }
}

impl From<storage::StorageError> for ApiError {
    fn from(e: storage::StorageError) -> Self {
        tracing::error!(error = %e, "storage failure during admission");
        ApiError::internal()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
            "code": self.code,
            "details": self.details,
        });

        (self.status, Json(body)).into_response()
    }
}
