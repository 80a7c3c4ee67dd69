//! Resource repository (资源数据访问)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::ResourceStore;
use crate::{
    error::{AppError, Result},
    models::{resource::*, Page, Pagination},
};

pub struct PgResourceRepository {
    db: PgPool,
}

impl PgResourceRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ResourceStore for PgResourceRepository {
    async fn create(&self, req: &CreateResourceRequest) -> Result<Resource> {
        sqlx::query_as::<_, Resource>(
            r#"
            INSERT INTO resources
                (key, display_name, app_name, domain, type, actions, description, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING *
            "#,
        )
        .bind(&req.key)
        .bind(&req.display_name)
        .bind(&req.app_name)
        .bind(&req.domain)
        .bind(&req.resource_type)
        .bind(normalize_actions(&req.actions))
        .bind(&req.description)
        .bind(&req.created_by)
        .fetch_one(&self.db)
        .await
        .map_err(|e| AppError::from_db(e, &format!("resource {}", req.key)))
    }

    async fn update(&self, id: Uuid, req: &UpdateResourceRequest) -> Result<Resource> {
        let actions = req.actions.as_deref().map(normalize_actions);

        let resource = sqlx::query_as::<_, Resource>(
            r#"
            UPDATE resources
            SET
                display_name = COALESCE($2, display_name),
                actions = COALESCE($3, actions),
                description = COALESCE($4, description),
                updated_by = $5,
                updated_at = NOW(),
                version = version + 1
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&req.display_name)
        .bind(actions)
        .bind(&req.description)
        .bind(&req.updated_by)
        .fetch_optional(&self.db)
        .await?;

        resource.ok_or_else(|| AppError::NotFound(format!("resource {}", id)))
    }

    async fn soft_delete(&self, id: Uuid, deleted_by: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE resources
            SET deleted_at = NOW(), deleted_by = $2, updated_at = NOW(), version = version + 1
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(deleted_by)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("resource {}", id)));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Resource>> {
        let resource = sqlx::query_as::<_, Resource>(
            "SELECT * FROM resources WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(resource)
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Resource>> {
        let resource = sqlx::query_as::<_, Resource>(
            "SELECT * FROM resources WHERE key = $1 AND deleted_at IS NULL",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(resource)
    }

    async fn list(&self, page: Pagination) -> Result<Page<Resource>> {
        let page = page.normalized();

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM resources WHERE deleted_at IS NULL")
                .fetch_one(&self.db)
                .await?;

        let items = sqlx::query_as::<_, Resource>(
            r#"
            SELECT * FROM resources
            WHERE deleted_at IS NULL
            ORDER BY key
            OFFSET $1 LIMIT $2
            "#,
        )
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.db)
        .await?;

        Ok(Page { items, total })
    }

    async fn validate_action(&self, key: &str, action: &str) -> Result<bool> {
        let found: Option<bool> = sqlx::query_scalar(
            "SELECT $2 = ANY(actions) FROM resources WHERE key = $1 AND deleted_at IS NULL",
        )
        .bind(key)
        .bind(action)
        .fetch_optional(&self.db)
        .await?;

        Ok(found.unwrap_or(false))
    }
}
