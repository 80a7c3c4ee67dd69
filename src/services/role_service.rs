//! 角色服务

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::{
    authz::PolicyCoordinator,
    context::OpContext,
    error::{AppError, Result},
    models::{
        role::{CreateRoleRequest, Role, UpdateRoleRequest},
        Page, Pagination,
    },
    repository::RoleStore,
};

pub struct RoleService {
    roles: Arc<dyn RoleStore>,
    coordinator: Arc<PolicyCoordinator>,
}

impl RoleService {
    pub fn new(roles: Arc<dyn RoleStore>, coordinator: Arc<PolicyCoordinator>) -> Self {
        Self { roles, coordinator }
    }

    /// 创建角色；同租户同名时返回 `AlreadyExists`
    pub async fn create_role(&self, ctx: &OpContext, req: CreateRoleRequest) -> Result<Role> {
        req.validate()?;
        let req = CreateRoleRequest {
            name: req.name.trim().to_string(),
            tenant_id: req.tenant_id.trim().to_string(),
            ..req
        };
        if req.name.contains(char::is_whitespace) {
            return Err(AppError::InvalidArgument(
                "role name must not contain whitespace".to_string(),
            ));
        }

        let role = ctx.run("role.create", self.roles.create(&req)).await?;
        info!(tenant_id = %role.tenant_id, role = %role.name, "Created role");
        Ok(role)
    }

    pub async fn update_role(
        &self,
        ctx: &OpContext,
        role_id: Uuid,
        tenant_id: &str,
        req: UpdateRoleRequest,
    ) -> Result<Role> {
        req.validate()?;
        ctx.run("role.update.validate", self.coordinator.owned_role(role_id, tenant_id))
            .await?;

        let role = ctx.run("role.update", self.roles.update(role_id, &req)).await?;
        info!(tenant_id = %tenant_id, role = %role.name, version = role.version, "Updated role");
        Ok(role)
    }

    pub async fn delete_role(
        &self,
        ctx: &OpContext,
        role_id: Uuid,
        tenant_id: &str,
        cascade: bool,
        deleted_by: &str,
    ) -> Result<()> {
        require_tenant(tenant_id)?;
        self.coordinator
            .delete_role(ctx, role_id, tenant_id, cascade, deleted_by)
            .await
    }

    // ==================== Queries ====================

    pub async fn get_role(&self, ctx: &OpContext, role_id: Uuid, tenant_id: &str) -> Result<Role> {
        ctx.run("role.get", self.coordinator.owned_role(role_id, tenant_id))
            .await
    }

    pub async fn list_roles(
        &self,
        ctx: &OpContext,
        tenant_id: &str,
        page: Pagination,
    ) -> Result<Page<Role>> {
        require_tenant(tenant_id)?;
        ctx.run("role.list", self.roles.list(tenant_id, page.normalized()))
            .await
    }

    /// 租户下全部角色，不分页
    // TODO: 角色数增长后改为游标分页，调用方目前只有管理端导出
    pub async fn list_roles_by_tenant(&self, ctx: &OpContext, tenant_id: &str) -> Result<Vec<Role>> {
        require_tenant(tenant_id)?;
        ctx.run("role.list_all", self.roles.list_by_tenant(tenant_id))
            .await
    }
}

pub(crate) fn require_tenant(tenant_id: &str) -> Result<()> {
    if tenant_id.trim().is_empty() {
        return Err(AppError::InvalidArgument("tenant id must not be empty".to_string()));
    }
    Ok(())
}
