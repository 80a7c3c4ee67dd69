//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::{handlers, middleware::AppState};

/// 请求体上限
const MAX_BODY_BYTES: usize = 64 * 1024;

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/.well-known/jwks.json", get(handlers::jwks::jwks));

    // 判定
    let authz_routes = Router::new()
        .route("/api/v1/authz/check", post(handlers::authz::check))
        .route("/api/v1/authz/version/{tenant}", get(handlers::authz::version));

    // 管理端
    let admin_routes = Router::new()
        .route(
            "/api/v1/roles",
            get(handlers::authz::list_roles).post(handlers::authz::create_role),
        )
        .route("/api/v1/roles/{id}", delete(handlers::authz::delete_role))
        .route("/api/v1/assignments", post(handlers::authz::grant))
        .route("/api/v1/assignments/{id}", delete(handlers::authz::revoke))
        .route(
            "/api/v1/policies",
            post(handlers::authz::add_policy).delete(handlers::authz::remove_policy),
        )
        .route("/api/v1/keys/rotate", post(handlers::keys::rotate))
        .route("/api/v1/keys/status", get(handlers::keys::rotation_status))
        .route("/api/v1/keys/stats", get(handlers::keys::stats));

    Router::new()
        .merge(public_routes)
        .merge(authz_routes)
        .merge(admin_routes)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(crate::middleware::request_tracking_middleware))
        .with_state(state)
}
