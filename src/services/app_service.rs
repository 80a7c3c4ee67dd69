//! 第三方应用凭证服务

use secrecy::{ExposeSecret, Secret};
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

use crate::{
    clock::Clock,
    context::OpContext,
    crypto::SecretVault,
    error::{AppError, Result},
    idp::{CredentialRotator, TokenCacher, UpstreamTokenProvider},
    models::app::{AppCredentials, AppStatus, RegisterAppRequest},
    repository::AppCredentialStore,
};

/// 乐观锁冲突时的最大尝试次数
const MAX_UPDATE_ATTEMPTS: usize = 3;

pub struct AppCredentialService {
    apps: Arc<dyn AppCredentialStore>,
    vault: Arc<dyn SecretVault>,
    rotator: CredentialRotator,
    cacher: Arc<TokenCacher>,
    provider: Option<Arc<dyn UpstreamTokenProvider>>,
    clock: Arc<dyn Clock>,
}

impl AppCredentialService {
    pub fn new(
        apps: Arc<dyn AppCredentialStore>,
        vault: Arc<dyn SecretVault>,
        cacher: Arc<TokenCacher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rotator: CredentialRotator::new(vault.clone(), clock.clone()),
            apps,
            vault,
            cacher,
            provider: None,
            clock,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn UpstreamTokenProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub async fn register_app(
        &self,
        ctx: &OpContext,
        req: RegisterAppRequest,
    ) -> Result<AppCredentials> {
        req.validate()?;
        let app = AppCredentials::new(
            req.app_id.trim(),
            req.name.trim(),
            req.app_type.trim(),
            self.clock.now(),
        );
        ctx.run("app.create", self.apps.create(&app)).await?;
        info!(app_id = %app.app_id, "Registered app");
        Ok(app)
    }

    pub async fn get_app(&self, ctx: &OpContext, app_id: &str) -> Result<AppCredentials> {
        ctx.run("app.get", self.apps.find_by_app_id(app_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("app {}", app_id)))
    }

    /// 返回 `false` 表示新密钥与当前密钥相同
    pub async fn rotate_auth_secret(
        &self,
        ctx: &OpContext,
        app_id: &str,
        new_plain: Secret<String>,
    ) -> Result<bool> {
        let changed = self
            .modify(ctx, app_id, |app| {
                self.rotator
                    .rotate_auth_secret(app, new_plain.expose_secret())
            })
            .await?;
        if changed {
            info!(app_id = %app_id, "Rotated auth secret");
        }
        Ok(changed)
    }

    pub async fn rotate_msg_aes_key(
        &self,
        ctx: &OpContext,
        app_id: &str,
        callback_token: &str,
        aes_key: Secret<String>,
    ) -> Result<()> {
        self.modify(ctx, app_id, |app| {
            self.rotator
                .rotate_msg_aes_key(app, callback_token, aes_key.expose_secret())
                .map(|_| true)
        })
        .await?;
        info!(app_id = %app_id, "Rotated message AES key");
        Ok(())
    }

    pub async fn change_status(
        &self,
        ctx: &OpContext,
        app_id: &str,
        status: AppStatus,
    ) -> Result<AppCredentials> {
        let now = self.clock.now();
        self.modify(ctx, app_id, |app| {
            if app.status == status {
                return Ok(false);
            }
            if app.is_archived() {
                return Err(AppError::InvalidState(format!("app {} is archived", app.app_id)));
            }
            app.status = status;
            app.updated_at = now;
            Ok(true)
        })
        .await?;
        info!(app_id = %app_id, status = %status, "Changed app status");
        self.get_app(ctx, app_id).await
    }

    pub async fn decrypt_auth_secret(&self, ctx: &OpContext, app_id: &str) -> Result<Secret<String>> {
        let app = self.get_app(ctx, app_id).await?;
        self.auth_secret(&app)
    }

    /// 缓存的上游访问令牌
    pub async fn get_access_token(&self, ctx: &OpContext, app_id: &str) -> Result<String> {
        ctx.run(
            "app.access_token",
            self.cacher
                .ensure_token(app_id, None, || self.fetch_upstream(ctx, app_id)),
        )
        .await
    }

    /// 强制刷新上游访问令牌
    pub async fn refresh_access_token(&self, ctx: &OpContext, app_id: &str) -> Result<String> {
        ctx.run(
            "app.refresh_access_token",
            self.cacher.refresh(app_id, || self.fetch_upstream(ctx, app_id)),
        )
        .await
    }

    async fn fetch_upstream(
        &self,
        ctx: &OpContext,
        app_id: &str,
    ) -> Result<crate::models::app::AppAccessToken> {
        let provider = self.provider.as_ref().ok_or_else(|| {
            AppError::Unavailable("no upstream identity provider configured".to_string())
        })?;

        let app = self.get_app(ctx, app_id).await?;
        if app.status != AppStatus::Enabled {
            return Err(AppError::InvalidState(format!(
                "app {} is {}",
                app_id, app.status
            )));
        }
        let secret = self.auth_secret(&app)?;
        provider.fetch(app_id, &secret).await
    }

    fn auth_secret(&self, app: &AppCredentials) -> Result<Secret<String>> {
        let auth = app.auth.as_ref().ok_or_else(|| {
            AppError::NotFound(format!("app {} has no auth secret", app.app_id))
        })?;
        let plain = self.vault.decrypt(&auth.cipher)?;
        let plain = String::from_utf8(plain.to_vec())
            .map_err(|_| AppError::Internal("auth secret is not valid UTF-8".to_string()))?;
        Ok(Secret::new(plain))
    }

    /// 读-改-写，乐观锁冲突时重试
    async fn modify<F>(&self, ctx: &OpContext, app_id: &str, mut change: F) -> Result<bool>
    where
        F: FnMut(&mut AppCredentials) -> Result<bool>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut app = self.get_app(ctx, app_id).await?;
            if !change(&mut app)? {
                return Ok(false);
            }

            match ctx.run("app.update", self.apps.update(&app)).await {
                Ok(_) => return Ok(true),
                Err(AppError::Conflict(msg)) if attempt < MAX_UPDATE_ATTEMPTS => {
                    warn!(app_id = %app_id, attempt, reason = %msg, "App update conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        crypto::AesGcmVault,
        idp::{MemoryTokenCache, TokenCacheSettings},
        models::app::AppAccessToken,
        repository::MemoryAppStore,
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoProvider {
        calls: AtomicUsize,
        clock: ManualClock,
    }

    #[async_trait]
    impl UpstreamTokenProvider for EchoProvider {
        async fn fetch(&self, app_id: &str, app_secret: &Secret<String>) -> Result<AppAccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AppAccessToken {
                token: format!("{}:{}:{}", app_id, app_secret.expose_secret(), n),
                expires_at: self.clock.now() + Duration::seconds(7200),
            })
        }
    }

    fn service() -> (AppCredentialService, Arc<EchoProvider>) {
        let clock = ManualClock::new(chrono::Utc::now());
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let cacher = Arc::new(TokenCacher::new(
            Arc::new(MemoryTokenCache::new(clock_arc.clone())),
            clock_arc.clone(),
            TokenCacheSettings::default(),
        ));
        let provider = Arc::new(EchoProvider {
            calls: AtomicUsize::new(0),
            clock,
        });
        let svc = AppCredentialService::new(
            Arc::new(MemoryAppStore::new()),
            Arc::new(AesGcmVault::new(&[3u8; 32]).unwrap()),
            cacher,
            clock_arc,
        )
        .with_provider(provider.clone());
        (svc, provider)
    }

    fn register(app_id: &str) -> RegisterAppRequest {
        RegisterAppRequest {
            app_id: app_id.to_string(),
            name: "Mini Program".to_string(),
            app_type: "mini_program".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rotate_auth_secret_once() {
        let (svc, _) = service();
        let ctx = OpContext::background();
        svc.register_app(&ctx, register("app-1")).await.unwrap();

        let secret = || Secret::new("a-very-long-secret-012345".to_string());
        assert!(svc.rotate_auth_secret(&ctx, "app-1", secret()).await.unwrap());
        assert!(!svc.rotate_auth_secret(&ctx, "app-1", secret()).await.unwrap());

        let app = svc.get_app(&ctx, "app-1").await.unwrap();
        assert_eq!(app.auth.unwrap().version, 1);
        assert_eq!(
            svc.decrypt_auth_secret(&ctx, "app-1")
                .await
                .unwrap()
                .expose_secret(),
            "a-very-long-secret-012345"
        );
    }

    #[tokio::test]
    async fn test_access_token_uses_cache() {
        let (svc, provider) = service();
        let ctx = OpContext::background();
        svc.register_app(&ctx, register("app-1")).await.unwrap();
        svc.rotate_auth_secret(&ctx, "app-1", Secret::new("a-very-long-secret-012345".into()))
            .await
            .unwrap();

        let first = svc.get_access_token(&ctx, "app-1").await.unwrap();
        let second = svc.get_access_token(&ctx, "app-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let forced = svc.refresh_access_token(&ctx, "app-1").await.unwrap();
        assert_ne!(forced, first);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_app_cannot_fetch() {
        let (svc, provider) = service();
        let ctx = OpContext::background();
        svc.register_app(&ctx, register("app-1")).await.unwrap();
        svc.rotate_auth_secret(&ctx, "app-1", Secret::new("a-very-long-secret-012345".into()))
            .await
            .unwrap();
        svc.change_status(&ctx, "app-1", AppStatus::Disabled)
            .await
            .unwrap();

        assert!(matches!(
            svc.get_access_token(&ctx, "app-1").await,
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_archived_app_is_frozen() {
        let (svc, _) = service();
        let ctx = OpContext::background();
        svc.register_app(&ctx, register("app-1")).await.unwrap();
        svc.change_status(&ctx, "app-1", AppStatus::Archived)
            .await
            .unwrap();

        assert!(matches!(
            svc.rotate_auth_secret(&ctx, "app-1", Secret::new("a-very-long-secret-012345".into()))
                .await,
            Err(AppError::InvalidState(_))
        ));
        assert!(matches!(
            svc.change_status(&ctx, "app-1", AppStatus::Enabled).await,
            Err(AppError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_app() {
        let (svc, _) = service();
        let ctx = OpContext::background();
        assert!(matches!(
            svc.get_access_token(&ctx, "nope").await,
            Err(AppError::NotFound(_))
        ));
    }
}
