//! 签名密钥管理端点

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::{
    error::Result,
    jwks::RotationOutcome,
    middleware::AppState,
    models::key::{KeyStats, RotationStatus},
};

/// `POST /api/v1/keys/rotate`
pub async fn rotate(State(state): State<Arc<AppState>>) -> Result<Json<RotationOutcome>> {
    let ctx = state.op_context();
    let outcome = state.keys.rotate(&ctx).await?;
    Ok(Json(outcome))
}

pub async fn rotation_status(State(state): State<Arc<AppState>>) -> Result<Json<RotationStatus>> {
    let ctx = state.op_context();
    Ok(Json(state.keys.rotation_status(&ctx).await?))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<KeyStats>> {
    let ctx = state.op_context();
    Ok(Json(state.keys.stats(&ctx).await?))
}
