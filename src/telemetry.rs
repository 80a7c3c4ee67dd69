//! 日志与追踪系统
//! 初始化结构化日志和指标描述

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 依赖库的默认降噪指令
const NOISY_TARGETS: &str = "sqlx=warn,lapin=warn,hyper=warn,tower_http=info";

/// 初始化日志与追踪系统
///
/// `RUST_LOG` 存在时优先于配置中的日志级别。
pub fn init_telemetry(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},{}", config.level, NOISY_TARGETS)));

    // 根据配置选择日志格式
    let log_layer = match config.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(true)
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .boxed(),
        "pretty" => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    // 重复初始化（如测试中）时忽略错误
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .try_init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.level,
        format = %config.format,
        "Telemetry initialized"
    );
}

/// 注册指标描述
pub fn init_metrics() {
    metrics::describe_counter!("authz.enforce.total", "Enforcement decisions by result");
    metrics::describe_counter!("authz.policy_version.bumps", "Tenant policy version increments");
    metrics::describe_counter!("authz.notifier.publish_failures", "Dropped version notifications");
    metrics::describe_counter!("jwks.rotations", "Completed signing key rotations");
    metrics::describe_counter!("idp.token_cache.hits", "Access token cache hits");
    metrics::describe_counter!("idp.token_cache.refreshes", "Upstream access token fetches");
    tracing::debug!("Metrics initialized");
}
