//! 资源服务

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::{
    authz::PolicyCoordinator,
    context::OpContext,
    error::{AppError, Result},
    models::{
        resource::{normalize_actions, CreateResourceRequest, Resource, UpdateResourceRequest},
        Page, Pagination,
    },
    repository::ResourceStore,
};

pub struct ResourceService {
    resources: Arc<dyn ResourceStore>,
    coordinator: Arc<PolicyCoordinator>,
}

impl ResourceService {
    pub fn new(resources: Arc<dyn ResourceStore>, coordinator: Arc<PolicyCoordinator>) -> Self {
        Self {
            resources,
            coordinator,
        }
    }

    pub async fn create_resource(
        &self,
        ctx: &OpContext,
        req: CreateResourceRequest,
    ) -> Result<Resource> {
        req.validate()?;
        let actions = normalize_actions(&req.actions);
        if actions.is_empty() {
            return Err(AppError::InvalidArgument(
                "resource must declare at least one action".to_string(),
            ));
        }
        let req = CreateResourceRequest {
            key: req.key.trim().to_string(),
            actions,
            ..req
        };

        let resource = ctx
            .run("resource.create", self.resources.create(&req))
            .await?;
        info!(resource = %resource.key, actions = ?resource.actions, "Created resource");
        Ok(resource)
    }

    pub async fn update_resource(
        &self,
        ctx: &OpContext,
        resource_id: Uuid,
        req: UpdateResourceRequest,
    ) -> Result<Resource> {
        req.validate()?;
        self.coordinator.update_resource(ctx, resource_id, &req).await
    }

    pub async fn delete_resource(
        &self,
        ctx: &OpContext,
        resource_id: Uuid,
        deleted_by: &str,
    ) -> Result<()> {
        self.coordinator
            .delete_resource(ctx, resource_id, deleted_by)
            .await
    }

    // ==================== Queries ====================

    pub async fn get_resource(&self, ctx: &OpContext, resource_id: Uuid) -> Result<Resource> {
        ctx.run("resource.get", self.resources.find_by_id(resource_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("resource {}", resource_id)))
    }

    pub async fn get_resource_by_key(&self, ctx: &OpContext, key: &str) -> Result<Resource> {
        ctx.run("resource.get_by_key", self.resources.find_by_key(key))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("resource {}", key)))
    }

    pub async fn list_resources(&self, ctx: &OpContext, page: Pagination) -> Result<Page<Resource>> {
        ctx.run("resource.list", self.resources.list(page.normalized()))
            .await
    }

    pub async fn validate_action(&self, ctx: &OpContext, key: &str, action: &str) -> Result<bool> {
        ctx.run("resource.validate_action", self.resources.validate_action(key, action))
            .await
    }
}
