//! HTTP 中间件与共享状态

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    authz::VersionNotifier,
    context::OpContext,
    services::{
        AppCredentialService, AssignmentService, KeyService, PolicyService, ResourceService,
        RoleService,
    },
};

/// 单个请求的默认截止时间
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 应用状态
///
/// 服务均以 Arc 共享；`db` 为空时表示使用内存存储，就绪检查跳过数据库。
#[derive(Clone)]
pub struct AppState {
    pub db: Option<sqlx::PgPool>,
    pub roles: Arc<RoleService>,
    pub resources: Arc<ResourceService>,
    pub assignments: Arc<AssignmentService>,
    pub policies: Arc<PolicyService>,
    pub keys: Arc<KeyService>,
    pub apps: Arc<AppCredentialService>,
    pub notifier: Arc<dyn VersionNotifier>,
    pub request_timeout: Duration,
    pub started_at: Instant,
}

impl AppState {
    /// 每个请求一个上下文，客户端断开时 future 被丢弃
    pub fn op_context(&self) -> OpContext {
        OpContext::with_timeout(self.request_timeout)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().clone();
    let uri = req.uri().path().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    async move {
        let start = Instant::now();
        let mut response = next.run(req).await;
        let elapsed = start.elapsed();

        let status = response.status().as_u16();
        let method_name = match method.as_str() {
            "GET" => "GET",
            "POST" => "POST",
            "PUT" => "PUT",
            "DELETE" => "DELETE",
            "PATCH" => "PATCH",
            _ => "UNKNOWN",
        };
        let status_class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };

        metrics::counter!("http_requests_total", "method" => method_name, "status" => status_class)
            .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            status = status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            headers.insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", value);
        }
        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
