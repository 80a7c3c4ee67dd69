//! 密钥与令牌服务

use std::sync::Arc;
use tracing::warn;

use crate::{
    context::OpContext,
    error::Result,
    jwks::{CleanupOutcome, KeyManager, RotationOutcome},
    models::{
        key::{JwksSnapshot, KeyStats, KeyStatus, RotationStatus, SigningKey},
        Page, Pagination,
    },
    token::{Claims, IssuedToken, TokenPair, TokenService, TokenSubject},
};

pub struct KeyService {
    keys: Arc<KeyManager>,
    tokens: Arc<TokenService>,
}

impl KeyService {
    pub fn new(keys: Arc<KeyManager>, tokens: Arc<TokenService>) -> Self {
        Self { keys, tokens }
    }

    pub fn manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    // ==================== Keys ====================

    /// 无条件轮换
    pub async fn rotate(&self, ctx: &OpContext) -> Result<RotationOutcome> {
        ctx.run("keys.rotate", self.keys.rotate_key()).await
    }

    /// 只在到期时轮换
    pub async fn rotate_if_due(&self, ctx: &OpContext) -> Result<Option<RotationOutcome>> {
        ctx.run("keys.rotate_if_due", async {
            let (due, _) = self.keys.should_rotate().await?;
            if due {
                self.keys.rotate_key().await.map(Some)
            } else {
                Ok(None)
            }
        })
        .await
    }

    pub async fn force_retire(&self, ctx: &OpContext, kid: &str) -> Result<SigningKey> {
        warn!(kid = %kid, "Force retiring signing key");
        ctx.run("keys.force_retire", self.keys.force_retire_key(kid))
            .await
    }

    pub async fn cleanup(&self, ctx: &OpContext) -> Result<CleanupOutcome> {
        ctx.run("keys.cleanup", self.keys.cleanup_expired_keys())
            .await
    }

    pub async fn jwks(&self, ctx: &OpContext, if_none_match: Option<&str>) -> Result<JwksSnapshot> {
        ctx.run("keys.jwks", self.keys.build_jwks(if_none_match))
            .await
    }

    pub async fn list_keys(
        &self,
        ctx: &OpContext,
        status: Option<KeyStatus>,
        page: Pagination,
    ) -> Result<Page<SigningKey>> {
        ctx.run("keys.list", self.keys.list_keys(status, page.normalized()))
            .await
    }

    pub async fn stats(&self, ctx: &OpContext) -> Result<KeyStats> {
        ctx.run("keys.stats", self.keys.key_stats()).await
    }

    pub async fn rotation_status(&self, ctx: &OpContext) -> Result<RotationStatus> {
        ctx.run("keys.rotation_status", self.keys.rotation_status())
            .await
    }

    // ==================== Tokens ====================

    pub async fn issue_access(&self, ctx: &OpContext, subject: &TokenSubject) -> Result<IssuedToken> {
        ctx.run("token.issue", self.tokens.issue_access(subject, None))
            .await
    }

    pub async fn issue_pair(&self, ctx: &OpContext, subject: &TokenSubject) -> Result<TokenPair> {
        ctx.run("token.issue_pair", self.tokens.issue_pair(subject))
            .await
    }

    pub async fn verify(&self, ctx: &OpContext, token: &str) -> Result<Claims> {
        ctx.run("token.verify", self.tokens.verify_access(token))
            .await
    }

    pub async fn refresh(&self, ctx: &OpContext, refresh_token: &str) -> Result<TokenPair> {
        ctx.run("token.refresh", self.tokens.refresh(refresh_token))
            .await
    }
}
