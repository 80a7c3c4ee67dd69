//! Policy repository (策略版本与矩阵规则表)

use async_trait::async_trait;
use sqlx::PgPool;

use super::{PolicyRuleStore, PolicyVersionStore};
use crate::{
    error::{AppError, Result},
    models::{
        policy::{CasbinRule, PolicyVersion},
        Page, Pagination,
    },
};

// ==================== Policy Versions ====================

pub struct PgPolicyVersionRepository {
    db: PgPool,
}

impl PgPolicyVersionRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PolicyVersionStore for PgPolicyVersionRepository {
    async fn get_current(&self, tenant_id: &str) -> Result<Option<PolicyVersion>> {
        let version = sqlx::query_as::<_, PolicyVersion>(
            r#"
            SELECT * FROM policy_versions
            WHERE tenant_id = $1 AND deleted_at IS NULL
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(version)
    }

    async fn get_or_create(&self, tenant_id: &str) -> Result<PolicyVersion> {
        if let Some(current) = self.get_current(tenant_id).await? {
            return Ok(current);
        }

        // 并发创建时由唯一约束兜底，冲突方读回已创建的行
        sqlx::query(
            r#"
            INSERT INTO policy_versions (tenant_id, version, changed_by, reason)
            VALUES ($1, 1, 'system', 'initial version')
            ON CONFLICT (tenant_id, version) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .execute(&self.db)
        .await?;

        self.get_current(tenant_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("policy version for {} vanished", tenant_id)))
    }

    async fn increment(
        &self,
        tenant_id: &str,
        changed_by: &str,
        reason: &str,
    ) -> Result<PolicyVersion> {
        let mut tx = self.db.begin().await?;

        // 同一租户的递增串行化
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;

        let version = sqlx::query_as::<_, PolicyVersion>(
            r#"
            INSERT INTO policy_versions (tenant_id, version, changed_by, reason, created_by, updated_by)
            SELECT $1, COALESCE(MAX(version), 0) + 1, $2, $3, $2, $2
            FROM policy_versions
            WHERE tenant_id = $1
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(changed_by)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::from_db(e, &format!("policy version for {}", tenant_id)))?;

        tx.commit().await?;

        Ok(version)
    }

    async fn list(&self, tenant_id: &str, page: Pagination) -> Result<Page<PolicyVersion>> {
        let page = page.normalized();

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM policy_versions WHERE tenant_id = $1 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .fetch_one(&self.db)
        .await?;

        let items = sqlx::query_as::<_, PolicyVersion>(
            r#"
            SELECT * FROM policy_versions
            WHERE tenant_id = $1 AND deleted_at IS NULL
            ORDER BY version DESC
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
}

// ==================== Matrix Rules ====================

pub struct PgPolicyRuleRepository {
    db: PgPool,
}

impl PgPolicyRuleRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PolicyRuleStore for PgPolicyRuleRepository {
    async fn load_all(&self) -> Result<Vec<CasbinRule>> {
        let rules = sqlx::query_as::<_, CasbinRule>(
            "SELECT ptype, v0, v1, v2, v3 FROM casbin_rule WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rules)
    }

    async fn add_rules(&self, rules: &[CasbinRule]) -> Result<()> {
        let mut tx = self.db.begin().await?;

        for rule in rules {
            sqlx::query(
                r#"
                INSERT INTO casbin_rule (ptype, v0, v1, v2, v3)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (ptype, v0, v1, v2, v3)
                DO UPDATE SET deleted_at = NULL, deleted_by = NULL, updated_at = NOW()
                "#,
            )
            .bind(&rule.ptype)
            .bind(&rule.v0)
            .bind(&rule.v1)
            .bind(&rule.v2)
            .bind(&rule.v3)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_rules(&self, rules: &[CasbinRule]) -> Result<()> {
        let mut tx = self.db.begin().await?;

        for rule in rules {
            sqlx::query(
                r#"
                UPDATE casbin_rule
                SET deleted_at = NOW(), updated_at = NOW()
                WHERE ptype = $1 AND v0 = $2 AND v1 = $3 AND v2 = $4 AND v3 = $5
                  AND deleted_at IS NULL
                "#,
            )
            .bind(&rule.ptype)
            .bind(&rule.v0)
            .bind(&rule.v1)
            .bind(&rule.v2)
            .bind(&rule.v3)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
