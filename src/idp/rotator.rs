//! Credential rotator
//!
//! 只修改内存中的 [`AppCredentials`]，持久化由调用方完成。

use std::sync::Arc;

use crate::{
    clock::Clock,
    crypto::SecretVault,
    error::{AppError, Result},
    models::app::{AppCredentials, AuthSecret, MsgSecret},
};

pub const MIN_AUTH_SECRET_LEN: usize = 16;
pub const MSG_AES_KEY_LEN: usize = 43;

pub struct CredentialRotator {
    vault: Arc<dyn SecretVault>,
    clock: Arc<dyn Clock>,
}

impl CredentialRotator {
    pub fn new(vault: Arc<dyn SecretVault>, clock: Arc<dyn Clock>) -> Self {
        Self { vault, clock }
    }

    /// 轮换认证密钥
    ///
    /// 返回 `false` 表示指纹相同、未做任何修改。
    pub fn rotate_auth_secret(&self, app: &mut AppCredentials, new_plain: &str) -> Result<bool> {
        if new_plain.trim().is_empty() || new_plain.len() < MIN_AUTH_SECRET_LEN {
            return Err(AppError::InvalidArgument(format!(
                "auth secret must be at least {} characters",
                MIN_AUTH_SECRET_LEN
            )));
        }
        ensure_not_archived(app)?;

        let fingerprint = self.vault.fingerprint(new_plain.as_bytes());
        if app
            .auth
            .as_ref()
            .is_some_and(|auth| auth.fingerprint == fingerprint)
        {
            return Ok(false);
        }

        let cipher = self.vault.encrypt(new_plain.as_bytes())?;
        let now = self.clock.now();
        let version = app.auth.as_ref().map(|a| a.version).unwrap_or(0) + 1;
        app.auth = Some(AuthSecret {
            cipher,
            fingerprint,
            version,
            rotated_at: now,
        });
        app.updated_at = now;
        Ok(true)
    }

    /// 轮换消息加解密配置；回调令牌与 AES 密钥整体替换
    pub fn rotate_msg_aes_key(
        &self,
        app: &mut AppCredentials,
        callback_token: &str,
        aes_key: &str,
    ) -> Result<()> {
        if aes_key.trim().is_empty() || aes_key.chars().count() != MSG_AES_KEY_LEN {
            return Err(AppError::InvalidArgument(format!(
                "AES key must be exactly {} characters",
                MSG_AES_KEY_LEN
            )));
        }
        ensure_not_archived(app)?;

        let cipher = self.vault.encrypt(aes_key.as_bytes())?;
        let now = self.clock.now();
        let version = app.msg.as_ref().map(|m| m.version).unwrap_or(0) + 1;
        app.msg = Some(MsgSecret {
            callback_token: callback_token.to_string(),
            aes_key_cipher: cipher,
            version,
            rotated_at: now,
        });
        app.updated_at = now;
        Ok(())
    }
}

fn ensure_not_archived(app: &AppCredentials) -> Result<()> {
    if app.is_archived() {
        return Err(AppError::InvalidState(format!(
            "app {} is archived, credentials cannot change",
            app.app_id
        )));
    }
    Ok(())
}
