//! Third-party application credential models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use validator::Validate;

/// 应用状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "app_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Enabled,
    Disabled,
    /// 归档后拒绝所有轮换
    Archived,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppStatus::Enabled => write!(f, "enabled"),
            AppStatus::Disabled => write!(f, "disabled"),
            AppStatus::Archived => write!(f, "archived"),
        }
    }
}

/// 认证密钥（仅保存密文与指纹）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthSecret {
    #[serde(skip)]
    pub cipher: Vec<u8>,
    pub fingerprint: String,
    pub version: i32,
    pub rotated_at: DateTime<Utc>,
}

/// 消息加解密配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MsgSecret {
    pub callback_token: String,
    #[serde(skip)]
    pub aes_key_cipher: Vec<u8>,
    pub version: i32,
    pub rotated_at: DateTime<Utc>,
}

/// 第三方应用凭证
#[derive(Debug, Clone, Serialize)]
pub struct AppCredentials {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    pub app_type: String,
    pub status: AppStatus,
    pub auth: Option<AuthSecret>,
    pub msg: Option<MsgSecret>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl AppCredentials {
    pub fn new(
        app_id: impl Into<String>,
        name: impl Into<String>,
        app_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            name: name.into(),
            app_type: app_type.into(),
            status: AppStatus::Enabled,
            auth: None,
            msg: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.status == AppStatus::Archived
    }
}

/// 数据库行
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppCredentialsRow {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    pub app_type: String,
    pub status: AppStatus,
    pub auth_cipher: Option<Vec<u8>>,
    pub auth_fingerprint: Option<String>,
    pub auth_version: i32,
    pub auth_rotated_at: Option<DateTime<Utc>>,
    pub msg_callback_token: Option<String>,
    pub msg_aes_key_cipher: Option<Vec<u8>>,
    pub msg_version: i32,
    pub msg_rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl From<AppCredentialsRow> for AppCredentials {
    fn from(row: AppCredentialsRow) -> Self {
        let auth = match (row.auth_cipher, row.auth_fingerprint, row.auth_rotated_at) {
            (Some(cipher), Some(fingerprint), Some(rotated_at)) => Some(AuthSecret {
                cipher,
                fingerprint,
                version: row.auth_version,
                rotated_at,
            }),
            _ => None,
        };
        let msg = match (row.msg_callback_token, row.msg_aes_key_cipher, row.msg_rotated_at) {
            (Some(callback_token), Some(aes_key_cipher), Some(rotated_at)) => Some(MsgSecret {
                callback_token,
                aes_key_cipher,
                version: row.msg_version,
                rotated_at,
            }),
            _ => None,
        };
        Self {
            id: row.id,
            app_id: row.app_id,
            name: row.name,
            app_type: row.app_type,
            status: row.status,
            auth,
            msg,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterAppRequest {
    #[validate(length(min = 1, max = 64, message = "app id must be 1-64 characters"))]
    pub app_id: String,
    #[validate(length(min = 1, message = "name must not be empty"))]
    pub name: String,
    #[serde(default)]
    pub app_type: String,
}

/// 上游身份提供方签发的访问令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppAccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}
