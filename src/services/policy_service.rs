//! 策略服务：规则增删、判定与版本查询

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::role_service::require_tenant;
use crate::{
    authz::{Enforcer, PolicyCoordinator},
    context::OpContext,
    error::{AppError, Result},
    models::{
        assignment::Subject,
        policy::{AddPolicyRequest, GroupingRule, PolicyRule, PolicyVersion, RemovePolicyRequest},
        Page, Pagination,
    },
    repository::PolicyVersionStore,
};

/// 判定请求
#[derive(Debug, Clone, serde::Deserialize, Validate)]
pub struct CheckRequest {
    /// `user:u1` 形式的主体标识
    #[validate(length(min = 1, message = "subject must not be empty"))]
    pub subject: String,
    #[validate(length(min = 1, message = "action must not be empty"))]
    pub action: String,
    #[validate(length(min = 1, message = "resource must not be empty"))]
    pub resource: String,
    #[validate(length(min = 1, message = "tenant id must not be empty"))]
    pub tenant_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
}

pub struct PolicyService {
    versions: Arc<dyn PolicyVersionStore>,
    enforcer: Arc<dyn Enforcer>,
    coordinator: Arc<PolicyCoordinator>,
}

impl PolicyService {
    pub fn new(versions: Arc<dyn PolicyVersionStore>, coordinator: Arc<PolicyCoordinator>) -> Self {
        Self {
            versions,
            enforcer: coordinator.enforcer().clone(),
            coordinator,
        }
    }

    pub async fn add_policy_rule(&self, ctx: &OpContext, req: AddPolicyRequest) -> Result<PolicyRule> {
        req.validate()?;
        self.coordinator.add_policy(ctx, &req).await
    }

    pub async fn remove_policy_rule(&self, ctx: &OpContext, req: RemovePolicyRequest) -> Result<()> {
        req.validate()?;
        self.coordinator.remove_policy(ctx, &req).await
    }

    /// 主体标识必须是合法的 `type:id`
    pub async fn check(&self, ctx: &OpContext, req: &CheckRequest) -> Result<bool> {
        req.validate()?;
        let subject = Subject::parse_key(&req.subject)?;
        ctx.run(
            "authz.enforce",
            self.enforcer
                .enforce(&subject.key(), &req.action, &req.resource, &req.tenant_id),
        )
        .await
    }

    // ==================== Queries ====================

    pub async fn policies_by_role(
        &self,
        ctx: &OpContext,
        role_id: Uuid,
        tenant_id: &str,
    ) -> Result<Vec<PolicyRule>> {
        let role = ctx
            .run("policy.by_role.validate", self.coordinator.owned_role(role_id, tenant_id))
            .await?;
        Ok(self.enforcer.policies_by_role(&role.key(), tenant_id).await)
    }

    pub async fn groupings_by_subject(
        &self,
        subject: &Subject,
        tenant_id: &str,
    ) -> Result<Vec<GroupingRule>> {
        require_tenant(tenant_id)?;
        Ok(self
            .enforcer
            .groupings_by_subject(&subject.key(), tenant_id)
            .await)
    }

    /// 当前版本；租户尚无版本时视为 0
    pub async fn current_version(&self, ctx: &OpContext, tenant_id: &str) -> Result<i64> {
        require_tenant(tenant_id)?;
        Ok(ctx
            .run("version.current", self.versions.get_current(tenant_id))
            .await?
            .map(|v| v.version)
            .unwrap_or(0))
    }

    pub async fn get_or_create_version(
        &self,
        ctx: &OpContext,
        tenant_id: &str,
    ) -> Result<PolicyVersion> {
        require_tenant(tenant_id)?;
        ctx.run("version.get_or_create", self.versions.get_or_create(tenant_id))
            .await
    }

    pub async fn list_versions(
        &self,
        ctx: &OpContext,
        tenant_id: &str,
        page: Pagination,
    ) -> Result<Page<PolicyVersion>> {
        require_tenant(tenant_id)?;
        ctx.run("version.list", self.versions.list(tenant_id, page.normalized()))
            .await
    }

    /// 从持久化表重建矩阵
    pub async fn reload(&self, ctx: &OpContext) -> Result<()> {
        ctx.run("authz.reload", self.enforcer.load_policy())
            .await
            .map_err(|e| match e {
                AppError::Cancelled | AppError::Timeout(_) => e,
                other => AppError::Internal(format!("failed to reload policy: {}", other)),
            })
    }
}
