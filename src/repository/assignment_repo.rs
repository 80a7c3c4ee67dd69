//! Assignment repository (赋权数据访问)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::AssignmentStore;
use crate::{
    error::{AppError, Result},
    models::assignment::*,
};

pub struct PgAssignmentRepository {
    db: PgPool,
}

impl PgAssignmentRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AssignmentStore for PgAssignmentRepository {
    async fn create(&self, new: &NewAssignment) -> Result<Assignment> {
        sqlx::query_as::<_, Assignment>(
            r#"
            INSERT INTO assignments
                (subject_type, subject_id, role_id, tenant_id, granted_by, created_by, updated_by)
            VALUES ($1, $2, $3, $4, $5, $5, $5)
            RETURNING *
            "#,
        )
        .bind(new.subject.subject_type)
        .bind(&new.subject.subject_id)
        .bind(new.role_id)
        .bind(&new.tenant_id)
        .bind(&new.granted_by)
        .fetch_one(&self.db)
        .await
        .map_err(|e| {
            AppError::from_db(
                e,
                &format!("assignment of role {} to {} in {}", new.role_id, new.subject, new.tenant_id),
            )
        })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Assignment>> {
        let assignment = sqlx::query_as::<_, Assignment>(
            "SELECT * FROM assignments WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(assignment)
    }

    async fn find(
        &self,
        subject: &Subject,
        role_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<Assignment>> {
        let assignment = sqlx::query_as::<_, Assignment>(
            r#"
            SELECT * FROM assignments
            WHERE subject_type = $1 AND subject_id = $2 AND role_id = $3 AND tenant_id = $4
              AND deleted_at IS NULL
            "#,
        )
        .bind(subject.subject_type)
        .bind(&subject.subject_id)
        .bind(role_id)
        .bind(tenant_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(assignment)
    }

    async fn delete(&self, id: Uuid, deleted_by: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE assignments
            SET deleted_at = NOW(), deleted_by = $2, updated_at = NOW(), version = version + 1
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(deleted_by)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("assignment {}", id)));
        }
        Ok(())
    }

    async fn list_by_subject(&self, subject: &Subject, tenant_id: &str) -> Result<Vec<Assignment>> {
        let assignments = sqlx::query_as::<_, Assignment>(
            r#"
            SELECT * FROM assignments
            WHERE subject_type = $1 AND subject_id = $2 AND tenant_id = $3 AND deleted_at IS NULL
            ORDER BY granted_at
            "#,
        )
        .bind(subject.subject_type)
        .bind(&subject.subject_id)
        .bind(tenant_id)
        .fetch_all(&self.db)
        .await?;

        Ok(assignments)
    }

    async fn list_by_role(&self, role_id: Uuid, tenant_id: &str) -> Result<Vec<Assignment>> {
        let assignments = sqlx::query_as::<_, Assignment>(
            r#"
            SELECT * FROM assignments
            WHERE role_id = $1 AND tenant_id = $2 AND deleted_at IS NULL
            ORDER BY granted_at
            "#,
        )
        .bind(role_id)
        .bind(tenant_id)
        .fetch_all(&self.db)
        .await?;

        Ok(assignments)
    }

    async fn count_by_role(&self, role_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM assignments WHERE role_id = $1 AND deleted_at IS NULL",
        )
        .bind(role_id)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }
}
