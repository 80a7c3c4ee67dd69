//! Role repository (角色数据访问)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::RoleStore;
use crate::{
    error::{AppError, Result},
    models::{role::*, Page, Pagination},
};

pub struct PgRoleRepository {
    db: PgPool,
}

impl PgRoleRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RoleStore for PgRoleRepository {
    async fn create(&self, req: &CreateRoleRequest) -> Result<Role> {
        sqlx::query_as::<_, Role>(
            r#"
            INSERT INTO roles (name, display_name, tenant_id, description, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING *
            "#,
        )
        .bind(&req.name)
        .bind(&req.display_name)
        .bind(&req.tenant_id)
        .bind(&req.description)
        .bind(&req.created_by)
        .fetch_one(&self.db)
        .await
        .map_err(|e| {
            AppError::from_db(e, &format!("role {} in tenant {}", req.name, req.tenant_id))
        })
    }

    async fn update(&self, id: Uuid, req: &UpdateRoleRequest) -> Result<Role> {
        let role = sqlx::query_as::<_, Role>(
            r#"
            UPDATE roles
            SET
                display_name = COALESCE($2, display_name),
                description = COALESCE($3, description),
                updated_by = $4,
                updated_at = NOW(),
                version = version + 1
            WHERE id = $1 AND version = $5 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&req.display_name)
        .bind(&req.description)
        .bind(&req.updated_by)
        .bind(req.expected_version)
        .fetch_optional(&self.db)
        .await?;

        match role {
            Some(role) => Ok(role),
            // 区分不存在和版本冲突
            None => match self.find_by_id(id).await? {
                Some(_) => Err(AppError::Conflict(format!("role {} was modified concurrently", id))),
                None => Err(AppError::NotFound(format!("role {}", id))),
            },
        }
    }

    async fn soft_delete(&self, id: Uuid, deleted_by: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE roles
            SET deleted_at = NOW(), deleted_by = $2, updated_at = NOW(), version = version + 1
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(deleted_by)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("role {}", id)));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Role>> {
        let role = sqlx::query_as::<_, Role>(
            "SELECT * FROM roles WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(role)
    }

    async fn find_by_name(&self, tenant_id: &str, name: &str) -> Result<Option<Role>> {
        let role = sqlx::query_as::<_, Role>(
            "SELECT * FROM roles WHERE tenant_id = $1 AND name = $2 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&self.db)
        .await?;

        Ok(role)
    }

    async fn list(&self, tenant_id: &str, page: Pagination) -> Result<Page<Role>> {
        let page = page.normalized();

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM roles WHERE tenant_id = $1 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .fetch_one(&self.db)
        .await?;

        let items = sqlx::query_as::<_, Role>(
            r#"
            SELECT * FROM roles
            WHERE tenant_id = $1 AND deleted_at IS NULL
            ORDER BY name
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(tenant_id)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.db)
        .await?;

        Ok(Page { items, total })
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>(
            "SELECT * FROM roles WHERE tenant_id = $1 AND deleted_at IS NULL ORDER BY name",
        )
        .bind(tenant_id)
        .fetch_all(&self.db)
        .await?;

        Ok(roles)
    }
}
