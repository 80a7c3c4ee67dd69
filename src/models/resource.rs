//! Resource domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::role::default_actor;

/// 受保护的资源
///
/// `key` 全局唯一；`actions` 是该资源接受的动作闭集。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Resource {
    pub id: Uuid,
    pub key: String,
    pub display_name: String,
    pub app_name: String,
    pub domain: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub resource_type: String,
    pub actions: Vec<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub updated_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
    pub version: i64,
}

impl Resource {
    pub fn supports_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateResourceRequest {
    #[validate(length(min = 1, max = 128, message = "resource key must be 1-128 characters"))]
    pub key: String,
    #[validate(length(min = 1, message = "display name must not be empty"))]
    pub display_name: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default, rename = "type")]
    pub resource_type: String,
    #[validate(length(min = 1, message = "resource must declare at least one action"))]
    pub actions: Vec<String>,
    pub description: Option<String>,
    #[serde(default = "default_actor")]
    pub created_by: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateResourceRequest {
    pub display_name: Option<String>,
    pub actions: Option<Vec<String>>,
    pub description: Option<String>,
    #[serde(default = "default_actor")]
    pub updated_by: String,
}

/// 动作列表：去空白、去重并保持原顺序
pub fn normalize_actions(actions: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(actions.len());
    for action in actions {
        let action = action.trim();
        if !action.is_empty() && !out.iter().any(|a| a == action) {
            out.push(action.to_string());
        }
    }
    out
}
