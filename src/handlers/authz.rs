//! 授权判定与管理端点

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::Result,
    middleware::AppState,
    models::{
        assignment::GrantRequest,
        policy::{AddPolicyRequest, RemovePolicyRequest},
        role::{default_actor, CreateRoleRequest},
        Pagination,
    },
    services::{CheckRequest, CheckResponse},
};

// ==================== Enforcement ====================

/// `POST /api/v1/authz/check`
pub async fn check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRequest>,
) -> Result<Json<CheckResponse>> {
    let ctx = state.op_context();
    let allowed = state.policies.check(&ctx, &req).await?;
    Ok(Json(CheckResponse { allowed }))
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub tenant_id: String,
    pub version: i64,
}

/// `GET /api/v1/authz/version/{tenant}`
pub async fn version(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<VersionResponse>> {
    let ctx = state.op_context();
    let version = state.policies.current_version(&ctx, &tenant_id).await?;
    Ok(Json(VersionResponse { tenant_id, version }))
}

// ==================== Roles ====================

#[derive(Debug, Deserialize)]
pub struct ListRolesQuery {
    pub tenant_id: String,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    Pagination::default().limit
}

#[derive(Debug, Deserialize)]
pub struct DeleteRoleQuery {
    pub tenant_id: String,
    #[serde(default)]
    pub cascade: bool,
    #[serde(default = "default_actor")]
    pub deleted_by: String,
}

pub async fn create_role(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRoleRequest>,
) -> Result<impl IntoResponse> {
    let ctx = state.op_context();
    let role = state.roles.create_role(&ctx, req).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

pub async fn list_roles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRolesQuery>,
) -> Result<impl IntoResponse> {
    let ctx = state.op_context();
    let page = state
        .roles
        .list_roles(&ctx, &query.tenant_id, Pagination::new(query.offset, query.limit))
        .await?;
    Ok(Json(page))
}

pub async fn delete_role(
    State(state): State<Arc<AppState>>,
    Path(role_id): Path<Uuid>,
    Query(query): Query<DeleteRoleQuery>,
) -> Result<StatusCode> {
    let ctx = state.op_context();
    state
        .roles
        .delete_role(&ctx, role_id, &query.tenant_id, query.cascade, &query.deleted_by)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ==================== Assignments ====================

#[derive(Debug, Deserialize)]
pub struct RevokeQuery {
    pub tenant_id: String,
    #[serde(default = "default_actor")]
    pub revoked_by: String,
}

pub async fn grant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GrantRequest>,
) -> Result<impl IntoResponse> {
    let ctx = state.op_context();
    let assignment = state.assignments.grant(&ctx, req).await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

pub async fn revoke(
    State(state): State<Arc<AppState>>,
    Path(assignment_id): Path<Uuid>,
    Query(query): Query<RevokeQuery>,
) -> Result<StatusCode> {
    let ctx = state.op_context();
    state
        .assignments
        .revoke_by_id(&ctx, assignment_id, &query.tenant_id, &query.revoked_by)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ==================== Policies ====================

pub async fn add_policy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddPolicyRequest>,
) -> Result<impl IntoResponse> {
    let ctx = state.op_context();
    let rule = state.policies.add_policy_rule(&ctx, req).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn remove_policy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemovePolicyRequest>,
) -> Result<StatusCode> {
    let ctx = state.op_context();
    state.policies.remove_policy_rule(&ctx, req).await?;
    Ok(StatusCode::NO_CONTENT)
}
