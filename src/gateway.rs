//! Request path in front of the generative backend.
//!
//! Admission (validate, lazy activation, quota charge) completes before the
//! backend is asked for anything, and the backend's fragment stream reaches
//! the caller only through a [`TagBoundaryFilter`].

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::errors::KeyError;
use crate::filter::TagBoundaryFilter;
use crate::models::UsageInfo;
use crate::registry::ApiKeyRegistry;
use crate::security::redact;

pub type FilteredStream = TagBoundaryFilter<BoxStream<'static, String>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Error, Debug)]
#[error("Backend error: {0}")]
pub struct BackendError(pub String);

/// Source of raw completion fragments. Envelope decoding (SSE, JSON
/// chunks) is the implementation's job; it yields plain text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<BoxStream<'static, String>, BackendError>;
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid Authorization header. Format should be 'Bearer YOUR_API_KEY'")]
    MissingCredentials,

    #[error("Invalid or expired API key")]
    InvalidKey,

    #[error(transparent)]
    Rejected(#[from] KeyError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::MissingCredentials | GatewayError::InvalidKey => StatusCode::UNAUTHORIZED,
            GatewayError::Rejected(e) => {
                let status = match e {
                    KeyError::KeyNotFound | KeyError::KeyDeleted | KeyError::KeyExpired => {
                        StatusCode::UNAUTHORIZED
                    }
                    other => other.status_code(),
                };
                return e.to_response(status);
            }
            GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
        };

        (status, Json(json!({ "success": false, "message": self.to_string() }))).into_response()
    }
}

/// Extract the key from an `Authorization: Bearer <key>` header value.
pub fn bearer_token(authorization: Option<&str>) -> Option<&str> {
    let token = authorization?.strip_prefix("Bearer")?.trim();
    (!token.is_empty()).then_some(token)
}

#[derive(Clone)]
pub struct Gateway {
    registry: Arc<ApiKeyRegistry>,
    backend: Arc<dyn CompletionBackend>,
}

impl Gateway {
    pub fn new(registry: Arc<ApiKeyRegistry>, backend: Arc<dyn CompletionBackend>) -> Self {
        Self { registry, backend }
    }

    pub fn registry(&self) -> &Arc<ApiKeyRegistry> {
        &self.registry
    }

    /// Validate, lazily activate and charge the key.
    pub async fn admit(&self, api_key: &str) -> Result<UsageInfo, GatewayError> {
        if !self.registry.validate(api_key).await? {
            return Err(GatewayError::InvalidKey);
        }

        let usage = self.registry.check_and_increment(api_key).await?;
        info!(
            api_key = %redact(api_key),
            current_period_usage = usage.current_period_usage,
            usage_limit = usage.usage_limit,
            "request admitted"
        );
        Ok(usage)
    }

    /// Admit the caller, then open the backend stream and wrap it in the
    /// payload filter. The backend is never contacted for a rejected key.
    pub async fn open_stream(
        &self,
        authorization: Option<&str>,
        request: &CompletionRequest,
    ) -> Result<FilteredStream, GatewayError> {
        let api_key = bearer_token(authorization).ok_or(GatewayError::MissingCredentials)?;
        self.admit(api_key).await?;

        let upstream = self.backend.stream_completion(request).await?;
        Ok(TagBoundaryFilter::new(upstream))
    }
}
