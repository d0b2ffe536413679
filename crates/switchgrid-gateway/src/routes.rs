//! API route handlers for the gateway.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use switchgrid_core::error::GridError;
use switchgrid_core::model::Controller;
use switchgrid_store::KeyValue;

use super::server::AppState;

/// Error wrapper that renders as `{"status": N, "message": "..."}` with the
/// matching HTTP status code.
pub struct ApiError(GridError);

impl From<GridError> for ApiError {
    fn from(e: GridError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({
            "status": status.as_u16(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "switchgrid",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// List every stored controller.
pub async fn list_controllers(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Controller>>> {
    Ok(Json(state.registry.list_controllers().await?))
}

/// Fetch one controller's current pin state.
pub async fn get_controller(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Controller>> {
    Ok(Json(state.registry.get_controller(&id).await?))
}

/// Drive a controller toward the submitted desired state. Returns the state
/// actually reached, which may differ where pins could not be driven.
pub async fn update_controller(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut controller): Json<Controller>,
) -> ApiResult<Json<Controller>> {
    controller.id = id;
    Ok(Json(state.registry.update_controller(controller).await?))
}

#[derive(Deserialize)]
pub struct ListKeysQuery {
    #[serde(default)]
    pub prefix: String,
}

/// List stored keys, optionally filtered by prefix.
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListKeysQuery>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.store.keys_with_prefix(&query.prefix)?))
}

/// Fetch one raw store value.
pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    match state.store.get(&key)? {
        Some(value) => Ok(Json(serde_json::json!({"key": key, "value": value}))),
        None => Err(GridError::NotFound(format!("key {key} not found")).into()),
    }
}

#[derive(Deserialize)]
pub struct SetKeyBody {
    pub value: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Write one raw store value. Scheduler timer records are created this way,
/// with version 0 so the scan loop picks them up.
pub async fn set_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<SetKeyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if key.is_empty() {
        return Err(GridError::BadRequest("empty key".into()).into());
    }
    state.store.set(&KeyValue {
        key: key.clone(),
        value: body.value,
        ttl_secs: body.ttl_secs,
    })?;
    Ok(Json(serde_json::json!({"key": key, "ok": true})))
}

/// Delete one store key. Deleting an absent key succeeds.
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.delete(&key)?;
    Ok(Json(serde_json::json!({"key": key, "ok": true})))
}
