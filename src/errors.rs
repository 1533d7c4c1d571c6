use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures of the shared counter store. All of them are infrastructure
/// faults: the caller decides about retry and backoff.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Too many concurrent writers on '{key}'")]
    Contended { key: String },

    #[error("Corrupted value at '{key}': {reason}")]
    Corrupted { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("API key not found")]
    KeyNotFound,

    #[error("API key has been deleted")]
    KeyDeleted,

    #[error("API key expired")]
    KeyExpired,

    #[error("Usage limit reached ({current}/{limit}), resets in {time_until_reset}s")]
    QuotaExceeded {
        current: u64,
        limit: u64,
        time_until_reset: i64,
        next_reset_time: i64,
    },

    #[error("No updatable fields provided")]
    NoFieldsProvided,

    #[error("API key already deleted")]
    AlreadyDeleted,

    #[error("Quota store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl KeyError {
    /// Only store faults are worth retrying; everything else is a business
    /// decision that will not change on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, KeyError::StoreUnavailable(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            KeyError::KeyNotFound => StatusCode::NOT_FOUND,
            KeyError::KeyDeleted
            | KeyError::KeyExpired
            | KeyError::NoFieldsProvided
            | KeyError::AlreadyDeleted => StatusCode::BAD_REQUEST,
            KeyError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            KeyError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl KeyError {
    /// JSON error body with the given status; quota rejections also carry
    /// `Retry-After`.
    pub fn to_response(&self, status: StatusCode) -> Response {
        if let KeyError::StoreUnavailable(source) = self {
            tracing::error!(error = %source, "quota store unavailable");
        }

        let body = Json(json!({
            "success": false,
            "message": self.to_string(),
        }));

        match self {
            KeyError::QuotaExceeded {
                time_until_reset, ..
            } => (
                status,
                [(header::RETRY_AFTER, (*time_until_reset).max(0).to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

impl IntoResponse for KeyError {
    fn into_response(self) -> Response {
        self.to_response(self.status_code())
    }
}
