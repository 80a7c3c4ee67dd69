//! 持久化层
//!
//! 每类聚合一个存储 trait；`Pg*Repository` 为 PostgreSQL 实现，
//! [`memory`] 模块提供进程内实现（测试与嵌入式部署）。

pub mod app_repo;
pub mod assignment_repo;
pub mod key_repo;
pub mod memory;
pub mod policy_repo;
pub mod resource_repo;
pub mod role_repo;

pub use app_repo::PgAppCredentialRepository;
pub use assignment_repo::PgAssignmentRepository;
pub use key_repo::PgSigningKeyRepository;
pub use memory::{MemoryAppStore, MemoryPolicyStore, MemorySigningKeyStore};
pub use policy_repo::{PgPolicyRuleRepository, PgPolicyVersionRepository};
pub use resource_repo::PgResourceRepository;
pub use role_repo::PgRoleRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    app::AppCredentials,
    assignment::{Assignment, NewAssignment, Subject},
    key::{KeyStatus, SigningKey},
    policy::{CasbinRule, PolicyVersion},
    resource::{CreateResourceRequest, Resource, UpdateResourceRequest},
    role::{CreateRoleRequest, Role, UpdateRoleRequest},
    Page, Pagination,
};

/// 角色存储
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// `(tenant_id, name)` 冲突时返回 `AlreadyExists`
    async fn create(&self, req: &CreateRoleRequest) -> Result<Role>;
    /// 行版本不匹配时返回 `Conflict`
    async fn update(&self, id: Uuid, req: &UpdateRoleRequest) -> Result<Role>;
    async fn soft_delete(&self, id: Uuid, deleted_by: &str) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Role>>;
    async fn find_by_name(&self, tenant_id: &str, name: &str) -> Result<Option<Role>>;
    async fn list(&self, tenant_id: &str, page: Pagination) -> Result<Page<Role>>;
    /// 返回租户下全部角色，不分页
    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Role>>;
}

/// 资源存储
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// `key` 冲突时返回 `AlreadyExists`
    async fn create(&self, req: &CreateResourceRequest) -> Result<Resource>;
    async fn update(&self, id: Uuid, req: &UpdateResourceRequest) -> Result<Resource>;
    async fn soft_delete(&self, id: Uuid, deleted_by: &str) -> Result<()>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Resource>>;
    async fn find_by_key(&self, key: &str) -> Result<Option<Resource>>;
    async fn list(&self, page: Pagination) -> Result<Page<Resource>>;

    async fn validate_action(&self, key: &str, action: &str) -> Result<bool> {
        Ok(self
            .find_by_key(key)
            .await?
            .map(|r| r.supports_action(action))
            .unwrap_or(false))
    }
}

/// 赋权存储
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// `(subject, role, tenant)` 冲突时返回 `AlreadyExists`
    async fn create(&self, new: &NewAssignment) -> Result<Assignment>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Assignment>>;
    async fn find(&self, subject: &Subject, role_id: Uuid, tenant_id: &str)
        -> Result<Option<Assignment>>;
    /// 软删除；不存在时返回 `NotFound`
    async fn delete(&self, id: Uuid, deleted_by: &str) -> Result<()>;
    async fn list_by_subject(&self, subject: &Subject, tenant_id: &str) -> Result<Vec<Assignment>>;
    async fn list_by_role(&self, role_id: Uuid, tenant_id: &str) -> Result<Vec<Assignment>>;
    async fn count_by_role(&self, role_id: Uuid) -> Result<i64>;
}

/// 租户策略版本存储
#[async_trait]
pub trait PolicyVersionStore: Send + Sync {
    async fn get_current(&self, tenant_id: &str) -> Result<Option<PolicyVersion>>;
    /// 不存在时创建版本 1
    async fn get_or_create(&self, tenant_id: &str) -> Result<PolicyVersion>;
    /// 原子递增：`new = max(existing) + 1`
    async fn increment(&self, tenant_id: &str, changed_by: &str, reason: &str)
        -> Result<PolicyVersion>;
    /// 按版本倒序
    async fn list(&self, tenant_id: &str, page: Pagination) -> Result<Page<PolicyVersion>>;
}

/// 矩阵规则的持久化表
#[async_trait]
pub trait PolicyRuleStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<CasbinRule>>;
    /// 已存在的规则忽略
    async fn add_rules(&self, rules: &[CasbinRule]) -> Result<()>;
    async fn remove_rules(&self, rules: &[CasbinRule]) -> Result<()>;
}

/// JWKS 密钥元数据存储
#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    async fn save(&self, key: &SigningKey) -> Result<()>;
    async fn update(&self, key: &SigningKey) -> Result<()>;
    async fn delete(&self, kid: &str) -> Result<()>;
    async fn find_by_kid(&self, kid: &str) -> Result<Option<SigningKey>>;
    async fn find_by_status(&self, status: KeyStatus) -> Result<Vec<SigningKey>>;
    /// `kid` 升序
    async fn find_all(&self) -> Result<Vec<SigningKey>>;
    /// Active/Grace 且 `now` 在有效期内，`kid` 升序
    async fn find_publishable(&self, now: DateTime<Utc>) -> Result<Vec<SigningKey>>;
    async fn list(&self, status: Option<KeyStatus>, page: Pagination) -> Result<Page<SigningKey>>;
}

/// 第三方应用凭证存储
#[async_trait]
pub trait AppCredentialStore: Send + Sync {
    async fn create(&self, app: &AppCredentials) -> Result<()>;
    async fn find_by_app_id(&self, app_id: &str) -> Result<Option<AppCredentials>>;
    /// 以 `app.version` 做乐观锁，成功后版本加一
    async fn update(&self, app: &AppCredentials) -> Result<AppCredentials>;
}
