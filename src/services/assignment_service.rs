//! 赋权服务

use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::role_service::require_tenant;
use crate::{
    authz::PolicyCoordinator,
    context::OpContext,
    error::{AppError, Result},
    models::assignment::{Assignment, GrantRequest, RevokeRequest, Subject},
    repository::AssignmentStore,
};

pub struct AssignmentService {
    assignments: Arc<dyn AssignmentStore>,
    coordinator: Arc<PolicyCoordinator>,
}

impl AssignmentService {
    pub fn new(assignments: Arc<dyn AssignmentStore>, coordinator: Arc<PolicyCoordinator>) -> Self {
        Self {
            assignments,
            coordinator,
        }
    }

    pub async fn grant(&self, ctx: &OpContext, req: GrantRequest) -> Result<Assignment> {
        req.validate()?;
        let subject = Subject::new(req.subject_type, req.subject_id.trim());
        self.coordinator
            .grant(ctx, subject, req.role_id, &req.tenant_id, &req.granted_by)
            .await
    }

    pub async fn revoke(&self, ctx: &OpContext, req: RevokeRequest) -> Result<()> {
        req.validate()?;
        let subject = Subject::new(req.subject_type, req.subject_id.trim());
        self.coordinator
            .revoke(ctx, &subject, req.role_id, &req.tenant_id, &req.revoked_by)
            .await
    }

    pub async fn revoke_by_id(
        &self,
        ctx: &OpContext,
        assignment_id: Uuid,
        tenant_id: &str,
        revoked_by: &str,
    ) -> Result<()> {
        require_tenant(tenant_id)?;
        self.coordinator
            .revoke_by_id(ctx, assignment_id, tenant_id, revoked_by)
            .await
    }

    // ==================== Queries ====================

    pub async fn get_assignment(
        &self,
        ctx: &OpContext,
        assignment_id: Uuid,
        tenant_id: &str,
    ) -> Result<Assignment> {
        let assignment = ctx
            .run("assignment.get", self.assignments.find_by_id(assignment_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("assignment {}", assignment_id)))?;

        if assignment.tenant_id != tenant_id {
            return Err(AppError::PermissionDenied(format!(
                "assignment {} does not belong to tenant {}",
                assignment_id, tenant_id
            )));
        }
        Ok(assignment)
    }

    pub async fn list_by_subject(
        &self,
        ctx: &OpContext,
        subject: &Subject,
        tenant_id: &str,
    ) -> Result<Vec<Assignment>> {
        require_tenant(tenant_id)?;
        ctx.run(
            "assignment.list_by_subject",
            self.assignments.list_by_subject(subject, tenant_id),
        )
        .await
    }

    pub async fn list_by_role(
        &self,
        ctx: &OpContext,
        role_id: Uuid,
        tenant_id: &str,
    ) -> Result<Vec<Assignment>> {
        ctx.run("assignment.list_by_role.validate", self.coordinator.owned_role(role_id, tenant_id))
            .await?;
        ctx.run(
            "assignment.list_by_role",
            self.assignments.list_by_role(role_id, tenant_id),
        )
        .await
    }
}
