//! Admin HTTP surface over the key registry, plus the streaming gateway
//! route for deployments that configure a completion backend.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{future::try_join_all, StreamExt};

use crate::errors::KeyError;
use crate::gateway::{CompletionRequest, Gateway, GatewayError};
use crate::models::{
    Activation, ApiKeyRecord, ApiResponse, BatchDeleteRequest, BatchDeleteResult, CreateKeysRequest,
    CreatedKeys, KeyInfo, KeyList, KeyUpdate, KeyValidity, ListKeysQuery, UpdateKeyRequest,
    UsageInfo,
};
use crate::registry::ApiKeyRegistry;

pub struct AppState {
    pub registry: Arc<ApiKeyRegistry>,
}

pub type SharedState = Arc<AppState>;

type ApiResult<T> = Result<Json<ApiResponse<T>>, KeyError>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/keys", post(create_keys).get(list_keys))
        .route("/keys/batch-delete", post(delete_keys))
        .route(
            "/keys/:api_key",
            get(get_information).put(update_key).delete(delete_key),
        )
        .route("/keys/:api_key/activate", post(activate_key))
        .route("/keys/:api_key/validate", get(validate_key))
        .route(
            "/keys/:api_key/usage",
            get(get_usage_info).post(increment_usage),
        )
        .with_state(state)
}

/// `POST /v1/prompt/stream`: admit the bearer key, then stream the
/// extracted payload as plain text.
pub fn gateway_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/v1/prompt/stream", post(stream_prompt))
        .with_state(gateway)
}

async fn create_keys(
    State(state): State<SharedState>,
    Json(payload): Json<CreateKeysRequest>,
) -> ApiResult<CreatedKeys> {
    let expiration_seconds = payload.expiration_seconds();
    let api_keys = try_join_all(
        (0..payload.numbers).map(|_| state.registry.create(expiration_seconds, payload.usage_limit)),
    )
    .await?;

    Ok(Json(ApiResponse::ok(
        "API keys created",
        CreatedKeys {
            api_keys,
            expiration_seconds,
        },
    )))
}

async fn list_keys(
    State(state): State<SharedState>,
    Query(query): Query<ListKeysQuery>,
) -> ApiResult<KeyList> {
    let api_keys = state.registry.list(query.include_deleted).await?;
    let count = api_keys.len();
    Ok(Json(ApiResponse::ok("API keys listed", KeyList { api_keys, count })))
}

async fn delete_keys(
    State(state): State<SharedState>,
    Json(payload): Json<BatchDeleteRequest>,
) -> ApiResult<Vec<BatchDeleteResult>> {
    let mut results = Vec::with_capacity(payload.api_keys.len());
    for api_key in payload.api_keys {
        let result = match state.registry.delete(&api_key).await {
            Ok(_) => BatchDeleteResult {
                api_key,
                success: true,
                message: "API key deleted".to_string(),
            },
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => BatchDeleteResult {
                api_key,
                success: false,
                message: e.to_string(),
            },
        };
        results.push(result);
    }
    Ok(Json(ApiResponse::ok("Batch delete processed", results)))
}

async fn get_information(
    State(state): State<SharedState>,
    Path(api_key): Path<String>,
) -> ApiResult<KeyInfo> {
    let info = state.registry.get_info(&api_key).await?;
    Ok(Json(ApiResponse::ok("API key information", info)))
}

async fn update_key(
    State(state): State<SharedState>,
    Path(api_key): Path<String>,
    Json(payload): Json<UpdateKeyRequest>,
) -> ApiResult<ApiKeyRecord> {
    let update = KeyUpdate::try_from(payload)?;
    let record = state.registry.update(&api_key, update).await?;
    Ok(Json(ApiResponse::ok("API key updated", record)))
}

async fn delete_key(
    State(state): State<SharedState>,
    Path(api_key): Path<String>,
) -> ApiResult<i64> {
    let deleted_at = state.registry.delete(&api_key).await?;
    Ok(Json(ApiResponse::ok("API key deleted", deleted_at)))
}

async fn activate_key(
    State(state): State<SharedState>,
    Path(api_key): Path<String>,
) -> ApiResult<Activation> {
    let activation = state.registry.activate(&api_key).await?;
    let message = if activation.newly_activated {
        "API key activated"
    } else {
        "API key already active"
    };
    Ok(Json(ApiResponse::ok(message, activation)))
}

async fn validate_key(
    State(state): State<SharedState>,
    Path(api_key): Path<String>,
) -> ApiResult<KeyValidity> {
    let is_valid = state.registry.validate(&api_key).await?;
    Ok(Json(ApiResponse::ok(
        "API key checked",
        KeyValidity { api_key, is_valid },
    )))
}

async fn get_usage_info(
    State(state): State<SharedState>,
    Path(api_key): Path<String>,
) -> ApiResult<UsageInfo> {
    let usage = state.registry.get_usage_info(&api_key).await?;
    Ok(Json(ApiResponse::ok("API key usage", usage)))
}

async fn increment_usage(
    State(state): State<SharedState>,
    Path(api_key): Path<String>,
) -> ApiResult<UsageInfo> {
    let usage = state.registry.check_and_increment(&api_key).await?;
    Ok(Json(ApiResponse::ok("Usage recorded", usage)))
}

async fn stream_prompt(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, GatewayError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let payload = gateway.open_stream(authorization, &request).await?;
    let body = Body::from_stream(payload.map(Ok::<_, Infallible>));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}
