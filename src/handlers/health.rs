//! 健康检查处理器

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::{db, middleware::AppState};

/// 存活探针响应
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
}

/// 健康检查项
#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    fn healthy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: "healthy".to_string(),
            message: None,
        }
    }

    fn unhealthy(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: "unhealthy".to_string(),
            message: Some(message.into()),
        }
    }
}

/// 存活探针
/// 快速响应，不检查依赖
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
    })
}

/// 就绪探针
/// 检查数据库和版本通知通道
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut checks = Vec::new();

    if let Some(pool) = &state.db {
        db::record_pool_metrics(pool);
        checks.push(match db::health_check(pool).await.reason() {
            None => HealthCheck::healthy("database"),
            Some(reason) => HealthCheck::unhealthy("database", reason),
        });
    }

    checks.push(if state.notifier.health_check().await {
        HealthCheck::healthy("notifier")
    } else {
        HealthCheck::unhealthy("notifier", "notifier is closed or disconnected")
    });

    let ready = checks.iter().all(|c| c.status == "healthy");
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, checks }))
}
