//! Role domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// 矩阵中角色标识的前缀
pub const ROLE_KEY_PREFIX: &str = "role:";

/// Role
///
/// `(tenant_id, name)` 在未删除的行中唯一。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub tenant_id: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub updated_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
    /// 乐观锁版本号（与租户策略版本无关）
    pub version: i64,
}

impl Role {
    /// 矩阵中的角色标识 `role:{name}`
    pub fn key(&self) -> String {
        role_key(&self.name)
    }

    pub fn belongs_to(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id
    }
}

pub fn role_key(name: &str) -> String {
    format!("{}{}", ROLE_KEY_PREFIX, name)
}

/// Create role request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 64, message = "role name must be 1-64 characters"))]
    pub name: String,
    #[validate(length(min = 1, max = 128, message = "display name must not be empty"))]
    pub display_name: String,
    #[validate(length(min = 1, message = "tenant id must not be empty"))]
    pub tenant_id: String,
    pub description: Option<String>,
    #[serde(default = "default_actor")]
    pub created_by: String,
}

/// Update role request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateRoleRequest {
    #[validate(length(min = 1, max = 128, message = "display name must not be empty"))]
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// 读取时的行版本，用于乐观锁
    pub expected_version: i64,
    #[serde(default = "default_actor")]
    pub updated_by: String,
}

pub(crate) fn default_actor() -> String {
    "system".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_key() {
        assert_eq!(role_key("admin"), "role:admin");
    }

    #[test]
    fn test_create_role_request_validation() {
        let req = CreateRoleRequest {
            name: String::new(),
            display_name: "Admin".to_string(),
            tenant_id: "t1".to_string(),
            description: None,
            created_by: "ops".to_string(),
        };
        assert!(req.validate().is_err());

        let req = CreateRoleRequest {
            name: "admin".to_string(),
            ..req
        };
        assert!(req.validate().is_ok());
    }
}
