//! 双写协调器
//!
//! 所有同时影响关系存储与规则矩阵的变更都走这里：
//!
//! ```text
//! 写入关系存储 → 更新矩阵 → 递增租户版本 → 发布通知
//! ```
//!
//! 矩阵失败时对已提交的关系存储执行补偿；版本递增与发布失败只记录日志。
//! 撤销方向相反：先移除矩阵规则，关系存储删除失败时重新加回规则。

use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    matrix::Enforcer,
    notifier::{PolicySyncHandler, VersionNotifier},
};
use crate::{
    context::OpContext,
    error::{AppError, Result},
    models::{
        assignment::{Assignment, NewAssignment, Subject},
        policy::{AddPolicyRequest, GroupingRule, PolicyRule, RemovePolicyRequest},
        resource::{normalize_actions, Resource, UpdateResourceRequest},
        role::Role,
    },
    repository::{AssignmentStore, PolicyVersionStore, ResourceStore, RoleStore},
};

/// 双写协调器依赖的存储与端口
#[derive(Clone)]
pub struct CoordinatorPorts {
    pub roles: Arc<dyn RoleStore>,
    pub resources: Arc<dyn ResourceStore>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub versions: Arc<dyn PolicyVersionStore>,
    pub enforcer: Arc<dyn Enforcer>,
    pub notifier: Arc<dyn VersionNotifier>,
}

pub struct PolicyCoordinator {
    ports: CoordinatorPorts,
    sync: Option<Arc<PolicySyncHandler>>,
}

impl PolicyCoordinator {
    pub fn new(ports: CoordinatorPorts) -> Self {
        Self { ports, sync: None }
    }

    /// 本地递增的版本同时记入同步处理器，收到自己发布的消息时不再重复加载
    pub fn with_sync_handler(mut self, sync: Arc<PolicySyncHandler>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn enforcer(&self) -> &Arc<dyn Enforcer> {
        &self.ports.enforcer
    }

    // ==================== Validation ====================

    /// 角色存在且属于该租户
    pub async fn owned_role(&self, role_id: Uuid, tenant_id: &str) -> Result<Role> {
        let role = self
            .ports
            .roles
            .find_by_id(role_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("role {}", role_id)))?;

        if !role.belongs_to(tenant_id) {
            return Err(AppError::PermissionDenied(format!(
                "role {} does not belong to tenant {}",
                role_id, tenant_id
            )));
        }
        Ok(role)
    }

    /// 资源存在且支持该动作
    pub async fn resource_supporting(&self, resource_key: &str, action: &str) -> Result<Resource> {
        let resource = self
            .ports
            .resources
            .find_by_key(resource_key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("resource {}", resource_key)))?;

        if !resource.supports_action(action) {
            return Err(AppError::InvalidArgument(format!(
                "resource {} does not support action {}",
                resource_key, action
            )));
        }
        Ok(resource)
    }

    // ==================== Assignments ====================

    pub async fn grant(
        &self,
        ctx: &OpContext,
        subject: Subject,
        role_id: Uuid,
        tenant_id: &str,
        granted_by: &str,
    ) -> Result<Assignment> {
        let role = ctx
            .run("grant.validate", self.owned_role(role_id, tenant_id))
            .await?;

        let new = NewAssignment {
            subject: subject.clone(),
            role_id,
            tenant_id: tenant_id.to_string(),
            granted_by: granted_by.to_string(),
        };
        let assignment = ctx
            .run("grant.persist", self.ports.assignments.create(&new))
            .await?;

        // 关系存储已提交，之后的步骤不再响应取消
        let rule = GroupingRule::new(subject.key(), role.key(), tenant_id);
        if let Err(e) = self.ports.enforcer.add_groupings(&[rule]).await {
            warn!(
                tenant_id = %tenant_id,
                subject = %subject,
                error = %e,
                "Matrix update failed, rolling back assignment"
            );
            if let Err(comp) = self.ports.assignments.delete(assignment.id, granted_by).await {
                error!(
                    tenant_id = %tenant_id,
                    assignment_id = %assignment.id,
                    "Compensation failed after grant"
                );
                return Err(AppError::compensation_failed(&e, &comp));
            }
            return Err(e);
        }

        info!(
            tenant_id = %tenant_id,
            subject = %subject,
            role = %role.name,
            "Granted role"
        );
        self.bump_version(tenant_id, granted_by, &format!("grant {} to {}", role.key(), subject))
            .await;
        Ok(assignment)
    }

    pub async fn revoke(
        &self,
        ctx: &OpContext,
        subject: &Subject,
        role_id: Uuid,
        tenant_id: &str,
        revoked_by: &str,
    ) -> Result<()> {
        let role = ctx
            .run("revoke.validate", self.owned_role(role_id, tenant_id))
            .await?;
        let assignment = ctx
            .run(
                "revoke.lookup",
                self.ports.assignments.find(subject, role_id, tenant_id),
            )
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "assignment {} -> {} in tenant {}",
                    subject, role_id, tenant_id
                ))
            })?;

        self.revoke_assignment(&role, &assignment, revoked_by).await?;
        self.bump_version(
            tenant_id,
            revoked_by,
            &format!("revoke {} from {}", role.key(), subject),
        )
        .await;
        Ok(())
    }

    pub async fn revoke_by_id(
        &self,
        ctx: &OpContext,
        assignment_id: Uuid,
        tenant_id: &str,
        revoked_by: &str,
    ) -> Result<()> {
        let assignment = ctx
            .run(
                "revoke.lookup",
                self.ports.assignments.find_by_id(assignment_id),
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("assignment {}", assignment_id)))?;

        if assignment.tenant_id != tenant_id {
            return Err(AppError::PermissionDenied(format!(
                "assignment {} does not belong to tenant {}",
                assignment_id, tenant_id
            )));
        }

        let role = ctx
            .run(
                "revoke.validate",
                self.owned_role(assignment.role_id, tenant_id),
            )
            .await?;

        self.revoke_assignment(&role, &assignment, revoked_by).await?;
        self.bump_version(
            tenant_id,
            revoked_by,
            &format!("revoke {} from {}", role.key(), assignment.subject()),
        )
        .await;
        Ok(())
    }

    /// 先移除 g 规则，再删除赋权；删除失败时加回规则
    async fn revoke_assignment(
        &self,
        role: &Role,
        assignment: &Assignment,
        revoked_by: &str,
    ) -> Result<()> {
        let subject = assignment.subject();
        let rule = GroupingRule::new(subject.key(), role.key(), &assignment.tenant_id);

        self.ports
            .enforcer
            .remove_groupings(std::slice::from_ref(&rule))
            .await?;

        if let Err(e) = self.ports.assignments.delete(assignment.id, revoked_by).await {
            warn!(
                tenant_id = %assignment.tenant_id,
                assignment_id = %assignment.id,
                error = %e,
                "Assignment delete failed, restoring grouping rule"
            );
            if let Err(comp) = self.ports.enforcer.add_groupings(&[rule]).await {
                error!(
                    tenant_id = %assignment.tenant_id,
                    assignment_id = %assignment.id,
                    "Compensation failed after revoke"
                );
                return Err(AppError::compensation_failed(&e, &comp));
            }
            return Err(e);
        }

        info!(
            tenant_id = %assignment.tenant_id,
            subject = %subject,
            role = %role.name,
            "Revoked role"
        );
        Ok(())
    }

    // ==================== Policy rules ====================

    pub async fn add_policy(
        &self,
        ctx: &OpContext,
        req: &AddPolicyRequest,
    ) -> Result<PolicyRule> {
        let tenant_id = req.tenant_id.as_str();
        let action = req.action.as_str();
        let (role, resource) = ctx
            .run("policy.validate", async {
                let role = self.owned_role(req.role_id, tenant_id).await?;
                let resource = self.resource_supporting(&req.resource_key, action).await?;
                Ok((role, resource))
            })
            .await?;

        let rule = PolicyRule::new(role.key(), tenant_id, &resource.key, action);
        ctx.run(
            "policy.add",
            self.ports.enforcer.add_policies(std::slice::from_ref(&rule)),
        )
        .await?;

        info!(
            tenant_id = %tenant_id,
            role = %role.name,
            resource = %resource.key,
            action = %action,
            "Added policy rule"
        );
        let reason = req
            .reason
            .clone()
            .unwrap_or_else(|| format!("add {} {} {}", role.key(), resource.key, action));
        self.bump_version(tenant_id, &req.changed_by, &reason).await;
        Ok(rule)
    }

    pub async fn remove_policy(
        &self,
        ctx: &OpContext,
        req: &RemovePolicyRequest,
    ) -> Result<()> {
        let tenant_id = req.tenant_id.as_str();
        let action = req.action.as_str();
        let (role, resource) = ctx
            .run("policy.validate", async {
                let role = self.owned_role(req.role_id, tenant_id).await?;
                let resource = self.resource_supporting(&req.resource_key, action).await?;
                Ok((role, resource))
            })
            .await?;

        let rule = PolicyRule::new(role.key(), tenant_id, &resource.key, action);
        ctx.run(
            "policy.remove",
            self.ports.enforcer.remove_policies(std::slice::from_ref(&rule)),
        )
        .await?;

        info!(
            tenant_id = %tenant_id,
            role = %role.name,
            resource = %resource.key,
            action = %action,
            "Removed policy rule"
        );
        let reason = req
            .reason
            .clone()
            .unwrap_or_else(|| format!("remove {} {} {}", role.key(), resource.key, action));
        self.bump_version(tenant_id, &req.changed_by, &reason).await;
        Ok(())
    }

    // ==================== Roles & resources ====================

    /// 删除角色
    ///
    /// 存在赋权且未要求级联时返回 `Conflict`。级联时逐个撤销赋权，
    /// 移除角色的 p 规则，软删除角色，最后只递增一次版本。
    pub async fn delete_role(
        &self,
        ctx: &OpContext,
        role_id: Uuid,
        tenant_id: &str,
        cascade: bool,
        deleted_by: &str,
    ) -> Result<()> {
        let (role, assignments) = ctx
            .run("role.delete.validate", async {
                let role = self.owned_role(role_id, tenant_id).await?;
                let assignments = self.ports.assignments.list_by_role(role_id, tenant_id).await?;
                Ok((role, assignments))
            })
            .await?;

        if !assignments.is_empty() && !cascade {
            return Err(AppError::Conflict(format!(
                "role {} still has {} assignment(s)",
                role.name,
                assignments.len()
            )));
        }

        for assignment in &assignments {
            self.revoke_assignment(&role, assignment, deleted_by).await?;
        }

        let policies = self.ports.enforcer.policies_by_role(&role.key(), tenant_id).await;
        self.ports.enforcer.remove_policies(&policies).await?;

        if let Err(e) = self.ports.roles.soft_delete(role_id, deleted_by).await {
            warn!(
                tenant_id = %tenant_id,
                role = %role.name,
                error = %e,
                "Role delete failed, restoring policy rules"
            );
            if let Err(comp) = self.ports.enforcer.add_policies(&policies).await {
                return Err(AppError::compensation_failed(&e, &comp));
            }
            return Err(e);
        }

        info!(
            tenant_id = %tenant_id,
            role = %role.name,
            revoked = assignments.len(),
            policies = policies.len(),
            "Deleted role"
        );
        self.bump_version(tenant_id, deleted_by, &format!("delete {}", role.key()))
            .await;
        Ok(())
    }

    /// 仍有 p 规则引用该资源时返回 `Conflict`
    pub async fn delete_resource(
        &self,
        ctx: &OpContext,
        resource_id: Uuid,
        deleted_by: &str,
    ) -> Result<()> {
        let resource = ctx
            .run("resource.delete.lookup", self.ports.resources.find_by_id(resource_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("resource {}", resource_id)))?;

        let referencing = self.ports.enforcer.policies_by_resource(&resource.key).await;
        if !referencing.is_empty() {
            return Err(AppError::Conflict(format!(
                "resource {} is referenced by {} policy rule(s)",
                resource.key,
                referencing.len()
            )));
        }

        ctx.run(
            "resource.delete",
            self.ports.resources.soft_delete(resource_id, deleted_by),
        )
        .await?;
        info!(resource = %resource.key, "Deleted resource");
        Ok(())
    }

    /// 缩减动作集时，被移除的动作不能仍被 p 规则使用
    pub async fn update_resource(
        &self,
        ctx: &OpContext,
        resource_id: Uuid,
        req: &UpdateResourceRequest,
    ) -> Result<Resource> {
        let resource = ctx
            .run("resource.update.lookup", self.ports.resources.find_by_id(resource_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("resource {}", resource_id)))?;

        if let Some(actions) = &req.actions {
            let actions = normalize_actions(actions);
            if actions.is_empty() {
                return Err(AppError::InvalidArgument(
                    "resource must declare at least one action".to_string(),
                ));
            }

            let in_use: Vec<String> = self
                .ports
                .enforcer
                .policies_by_resource(&resource.key)
                .await
                .into_iter()
                .map(|p| p.action)
                .filter(|a| !actions.contains(a))
                .collect();
            if !in_use.is_empty() {
                return Err(AppError::Conflict(format!(
                    "actions still used by policy rules on {}: {}",
                    resource.key,
                    in_use.join(", ")
                )));
            }
        }

        ctx.run("resource.update", self.ports.resources.update(resource_id, req))
            .await
    }

    // ==================== Versioning ====================

    /// 递增版本并发布，失败只记录日志
    async fn bump_version(&self, tenant_id: &str, changed_by: &str, reason: &str) -> Option<i64> {
        let version = match self
            .ports
            .versions
            .increment(tenant_id, changed_by, reason)
            .await
        {
            Ok(v) => v.version,
            Err(e) => {
                error!(tenant_id = %tenant_id, error = %e, "Failed to increment policy version");
                return None;
            }
        };

        metrics::counter!("authz.policy_version.bumps").increment(1);
        if let Some(sync) = &self.sync {
            sync.observe(tenant_id, version);
        }

        if let Err(e) = self.ports.notifier.publish(tenant_id, version).await {
            metrics::counter!("authz.notifier.publish_failures").increment(1);
            warn!(
                tenant_id = %tenant_id,
                version,
                error = %e,
                "Failed to publish policy version, dropping"
            );
        }

        info!(tenant_id = %tenant_id, version, "Policy version advanced");
        Some(version)
    }
}
