//! 调用上下文：截止时间与取消信号
//!
//! 外部可达的操作都接收一个 [`OpContext`]。截止时间到达时返回 `Timeout`，
//! 取消信号触发时返回 `Cancelled`。被中断的 future 直接丢弃，不会留下半完成的状态。

use crate::error::{AppError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OpContext {
    /// 无截止时间、不可外部取消
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// 继承父级取消信号
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
        }
    }

    pub fn deadline(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 在截止时间和取消信号约束下执行 `fut`
    pub async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(AppError::Cancelled),
                    res = tokio::time::timeout_at(deadline, fut) => {
                        res.map_err(|_| AppError::Timeout(op.to_string()))?
                    }
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(AppError::Cancelled),
                    res = fut => res,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_within_deadline() {
        let ctx = OpContext::with_timeout(Duration::from_secs(1));
        let value = ctx.run("quick", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = OpContext::with_timeout(Duration::from_millis(10));
        let err = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(op) if op == "slow"));
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let ctx = OpContext::background();
        let token = ctx.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let err = ctx
            .run("blocked", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn test_already_cancelled_short_circuits() {
        let ctx = OpContext::background();
        ctx.cancel();
        let err = ctx.run("noop", async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[test]
    fn test_deadline_keeps_earliest() {
        let ctx = OpContext::with_timeout(Duration::from_millis(5)).deadline(Duration::from_secs(60));
        let deadline = ctx.deadline.unwrap();
        assert!(deadline <= Instant::now() + Duration::from_millis(5));
    }
}
