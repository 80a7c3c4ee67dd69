//! 持久化存储接入
//!
//! 连接池、启动迁移，以及就绪检查：库可达且授权规则表已建好才算就绪。

use secrecy::ExposeSecret;
use sqlx::{
    migrate::Migrator,
    postgres::{PgPoolOptions, Postgres},
    pool::PoolOptions,
    PgPool,
};
use std::time::Duration;

use crate::{
    config::DatabaseConfig,
    error::{AppError, Result},
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// 矩阵加载依赖的表，缺失说明迁移没跑
const RULE_TABLE: &str = "casbin_rule";

pub fn pool_options(config: &DatabaseConfig) -> PoolOptions<Postgres> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
}

/// 连接失败归为 `Unavailable`，由调用方决定是否重试
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = pool_options(config)
        .connect(config.url.expose_secret())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to database");
            AppError::Unavailable(format!("database connect: {}", e))
        })?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database pool created"
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let target = MIGRATOR.iter().map(|m| m.version).max().unwrap_or_default();

    MIGRATOR.run(pool).await.map_err(|e| {
        tracing::error!(error = %e, target_version = target, "Migration failed");
        AppError::Internal(format!("migration to {}: {}", target, e))
    })?;

    tracing::info!(version = target, "Schema up to date");
    Ok(())
}

/// 就绪状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbHealth {
    Ready,
    /// 可达但规则表不存在
    MissingSchema,
    Unreachable(String),
}

impl DbHealth {
    pub fn is_ready(&self) -> bool {
        matches!(self, DbHealth::Ready)
    }

    /// 非就绪时的原因
    pub fn reason(&self) -> Option<String> {
        match self {
            DbHealth::Ready => None,
            DbHealth::MissingSchema => Some(format!("table {} is missing", RULE_TABLE)),
            DbHealth::Unreachable(e) => Some(e.clone()),
        }
    }
}

/// 一次往返同时确认连通性与规则表存在
pub async fn health_check(pool: &PgPool) -> DbHealth {
    let found = sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
        .bind(RULE_TABLE)
        .fetch_one(pool)
        .await;

    match found {
        Ok(true) => DbHealth::Ready,
        Ok(false) => {
            tracing::warn!(table = RULE_TABLE, "Database reachable but schema missing");
            DbHealth::MissingSchema
        }
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            DbHealth::Unreachable(e.to_string())
        }
    }
}

pub fn record_pool_metrics(pool: &PgPool) {
    metrics::gauge!("db.pool.size").set(pool.size() as f64);
    metrics::gauge!("db.pool.idle").set(pool.num_idle() as f64);
}
