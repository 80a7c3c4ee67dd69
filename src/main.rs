//! IAM 核心服务主入口

use iam_core::{
    authz::{
        CoordinatorPorts, InProcessNotifier, PolicyCoordinator, PolicySyncHandler,
        RabbitMqNotifier, RuleMatrix, VersionNotifier,
    },
    clock::{system_clock, Clock},
    config::AppConfig,
    crypto::{AesGcmVault, PemFileKeyStore, RsaKeyGenerator},
    db,
    idp::{MemoryTokenCache, TokenCacheSettings, TokenCacher},
    jwks::{KeyManager, RotationSchedule, RotationScheduler},
    middleware::AppState,
    models::key::SigningAlgorithm,
    repository::{
        PgAppCredentialRepository, PgAssignmentRepository, PgPolicyRuleRepository,
        PgPolicyVersionRepository, PgResourceRepository, PgRoleRepository,
        PgSigningKeyRepository,
    },
    routes,
    services::{
        AppCredentialService, AssignmentService, KeyService, PolicyService, ResourceService,
        RoleService,
    },
    telemetry,
    token::{TokenService, TokenSettings},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("iam-server {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 按优先级加载：.env.local > .env.development > .env
    if let Ok(env) = std::env::var("IAM_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::from_filename(".env.development").ok();
        dotenv::dotenv().ok();
    }

    let started_at = Instant::now();

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config.logging);
    telemetry::init_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "IAM core starting...");

    // 3. 数据库连接池 + 迁移
    let db_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&db_pool).await?;
    tracing::info!("Database initialized");

    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = system_clock();

    // 4. 授权：矩阵、版本通知、双写协调
    let roles = Arc::new(PgRoleRepository::new(db_pool.clone()));
    let resources = Arc::new(PgResourceRepository::new(db_pool.clone()));
    let assignments = Arc::new(PgAssignmentRepository::new(db_pool.clone()));
    let versions = Arc::new(PgPolicyVersionRepository::new(db_pool.clone()));
    let rules = Arc::new(PgPolicyRuleRepository::new(db_pool.clone()));

    let matrix = Arc::new(RuleMatrix::load(rules).await?);
    let (rule_count, grouping_count) = matrix.size().await;
    tracing::info!(rules = rule_count, groupings = grouping_count, "Policy matrix loaded");

    let notifier: Arc<dyn VersionNotifier> = if config.notifier.enabled {
        Arc::new(RabbitMqNotifier::connect(config.notifier.clone(), &shutdown).await?)
    } else {
        tracing::info!("Cross-instance notifier disabled, using in-process delivery");
        Arc::new(InProcessNotifier::with_lifetime(256, &shutdown))
    };

    let sync_handler = Arc::new(PolicySyncHandler::new(matrix.clone()));
    notifier.subscribe(sync_handler.clone()).await?;

    let coordinator = Arc::new(
        PolicyCoordinator::new(CoordinatorPorts {
            roles: roles.clone(),
            resources: resources.clone(),
            assignments: assignments.clone(),
            versions: versions.clone(),
            enforcer: matrix,
            notifier: notifier.clone(),
        })
        .with_sync_handler(sync_handler),
    );

    // 5. 签名密钥与轮换调度
    let algorithm: SigningAlgorithm = config.jwks.algorithm.parse()?;
    let key_manager = Arc::new(KeyManager::new(
        Arc::new(PgSigningKeyRepository::new(db_pool.clone())),
        Arc::new(PemFileKeyStore::open(&config.jwks.key_dir).await?),
        Arc::new(RsaKeyGenerator::new()),
        clock.clone(),
        config.rotation_policy(),
        algorithm,
    )?);

    let active = key_manager.ensure_active_key().await?;
    tracing::info!(kid = %active.kid, "Active signing key ready");

    let scheduler = RotationScheduler::new(
        key_manager.clone(),
        RotationSchedule::from_config(&config.jwks)?,
    );
    scheduler.start(&shutdown).await?;

    // 6. 令牌与第三方应用凭证
    let tokens = Arc::new(TokenService::new(
        key_manager.clone(),
        clock.clone(),
        TokenSettings::from_config(&config.jwt),
    ));

    let vault = Arc::new(AesGcmVault::from_secret(&config.vault_key_bytes()?)?);
    let cacher = Arc::new(TokenCacher::new(
        Arc::new(MemoryTokenCache::new(clock.clone())),
        clock.clone(),
        TokenCacheSettings::from_config(&config.access_token),
    ));
    let apps = Arc::new(AppCredentialService::new(
        Arc::new(PgAppCredentialRepository::new(db_pool.clone())),
        vault,
        cacher,
        clock.clone(),
    ));

    // 7. 构建应用状态
    let app_state = Arc::new(AppState {
        db: Some(db_pool.clone()),
        roles: Arc::new(RoleService::new(roles, coordinator.clone())),
        resources: Arc::new(ResourceService::new(resources, coordinator.clone())),
        assignments: Arc::new(AssignmentService::new(assignments, coordinator.clone())),
        policies: Arc::new(PolicyService::new(versions, coordinator)),
        keys: Arc::new(KeyService::new(key_manager, tokens)),
        apps,
        notifier: notifier.clone(),
        request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        started_at,
    });

    let app = routes::create_router(app_state);

    // 8. 启动服务器
    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // 9. 停止后台任务
    let grace = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    let cleanup = async {
        scheduler.stop().await;
        if let Err(e) = notifier.close().await {
            tracing::warn!(error = %e, "Failed to close notifier");
        }
        db_pool.close().await;
    };
    if tokio::time::timeout(grace, cleanup).await.is_err() {
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 收到信号后取消根令牌，后台任务随之退出。
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }

    shutdown.cancel();
}

/// 打印帮助信息
fn print_help() {
    println!("iam-server {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: iam-server [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 IAM_ 前缀的环境变量完成，例如 IAM_DATABASE__URL");
}
