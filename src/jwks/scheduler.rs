//! 密钥轮换调度器
//!
//! 固定间隔或 cron 表达式触发；每次触发先 `should_rotate`，需要时再 `rotate_key`。
//! 错过的触发不补跑，下一次触发自然追上。

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::JwksConfig;
use crate::error::{AppError, Result};
use crate::jwks::manager::{KeyManager, RotationOutcome};

/// 停止时等待进行中轮换的最长时间
const STOP_GRACE: Duration = Duration::from_secs(10);

/// 解析 cron 表达式
///
/// 5 段（分 时 日 月 周）补秒与年，6 段及以上原样交给 `cron`。
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {} *", expr),
        _ => expr.to_string(),
    };
    Schedule::from_str(&normalized)
        .map_err(|e| AppError::InvalidArgument(format!("invalid cron expression '{}': {}", expr, e)))
}

/// 触发方式
#[derive(Debug, Clone)]
pub enum RotationSchedule {
    Interval(Duration),
    Cron(Box<Schedule>),
}

impl RotationSchedule {
    pub fn from_config(config: &JwksConfig) -> Result<Self> {
        match config.rotation_cron.as_deref().map(str::trim) {
            Some(expr) if !expr.is_empty() => Ok(Self::Cron(Box::new(parse_cron(expr)?))),
            _ => {
                if config.check_interval_secs == 0 {
                    return Err(AppError::InvalidArgument(
                        "check interval must be positive".to_string(),
                    ));
                }
                Ok(Self::Interval(Duration::from_secs(config.check_interval_secs)))
            }
        }
    }

    /// `after` 之后的下一次触发时间
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => chrono::Duration::from_std(*every)
                .ok()
                .map(|every| after + every),
            Self::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RotationScheduler {
    manager: Arc<KeyManager>,
    schedule: RotationSchedule,
    state: Mutex<Option<Running>>,
    running: Arc<AtomicBool>,
    next_run: Arc<std::sync::Mutex<Option<DateTime<Utc>>>>,
}

impl RotationScheduler {
    pub fn new(manager: Arc<KeyManager>, schedule: RotationSchedule) -> Self {
        Self {
            manager,
            schedule,
            state: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            next_run: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn schedule(&self) -> &RotationSchedule {
        &self.schedule
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 下一次计划触发时间；未启动时为 `None`
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        *self.next_run.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 启动后台任务，`parent` 取消时随之退出
    #[instrument(skip(self, parent))]
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(AppError::InvalidState(
                "rotation scheduler already running".to_string(),
            ));
        }

        let cancel = parent.child_token();
        let handle = tokio::spawn(run_loop(
            self.manager.clone(),
            self.schedule.clone(),
            cancel.clone(),
            self.next_run.clone(),
        ));

        self.running.store(true, Ordering::SeqCst);
        *state = Some(Running { cancel, handle });

        match &self.schedule {
            RotationSchedule::Interval(every) => {
                info!(interval_secs = every.as_secs(), "Key rotation scheduler started")
            }
            RotationSchedule::Cron(schedule) => {
                info!(cron = %schedule, "Key rotation scheduler started (cron)")
            }
        }
        Ok(())
    }

    /// 停止调度；进行中的轮换最多等待 [`STOP_GRACE`]
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(Running { cancel, mut handle }) = self.state.lock().await.take() else {
            return;
        };

        cancel.cancel();
        if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!("Key rotation still in flight after grace period, aborting");
            handle.abort();
        }

        self.running.store(false, Ordering::SeqCst);
        *self.next_run.lock().unwrap_or_else(|e| e.into_inner()) = None;
        info!("Key rotation scheduler stopped");
    }

    /// 立即执行一次轮换检查
    pub async fn trigger_now(&self) -> Result<Option<RotationOutcome>> {
        check_and_rotate(&self.manager).await
    }
}

async fn check_and_rotate(manager: &KeyManager) -> Result<Option<RotationOutcome>> {
    let (should_rotate, reason) = manager.should_rotate().await?;
    if !should_rotate {
        tracing::debug!(reason = %reason, "Key rotation not needed");
        return Ok(None);
    }

    info!(reason = %reason, "Rotating signing key");
    manager.rotate_key().await.map(Some)
}

async fn run_loop(
    manager: Arc<KeyManager>,
    schedule: RotationSchedule,
    cancel: CancellationToken,
    next_run: Arc<std::sync::Mutex<Option<DateTime<Utc>>>>,
) {
    let set_next = |at: Option<DateTime<Utc>>| {
        *next_run.lock().unwrap_or_else(|e| e.into_inner()) = at;
    };

    match schedule {
        RotationSchedule::Interval(every) => {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                set_next(schedule_next(&RotationSchedule::Interval(every)));

                if let Err(e) = check_and_rotate(&manager).await {
                    error!(error = %e, "Scheduled key rotation failed");
                }
            }
        }
        RotationSchedule::Cron(schedule) => loop {
            let Some(at) = schedule.upcoming(Utc).next() else {
                warn!("Cron schedule has no upcoming run, stopping");
                break;
            };
            set_next(Some(at));

            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = check_and_rotate(&manager).await {
                error!(error = %e, "Scheduled key rotation failed");
            }
        },
    }

    set_next(None);
    info!("Key rotation loop exited");
}

fn schedule_next(schedule: &RotationSchedule) -> Option<DateTime<Utc>> {
    schedule.next_after(Utc::now())
}
