//! JWKS key repository (签名密钥元数据)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::SigningKeyStore;
use crate::{
    error::{AppError, Result},
    models::{
        key::{KeyStatus, SigningKey},
        Page, Pagination,
    },
};

pub struct PgSigningKeyRepository {
    db: PgPool,
}

impl PgSigningKeyRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SigningKeyStore for PgSigningKeyRepository {
    async fn save(&self, key: &SigningKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jwks_keys
                (kid, status, public_jwk, not_before, not_after, grace_since, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&key.kid)
        .bind(key.status)
        .bind(&key.public_jwk)
        .bind(key.not_before)
        .bind(key.not_after)
        .bind(key.grace_since)
        .bind(key.created_at)
        .bind(key.updated_at)
        .execute(&self.db)
        .await
        .map_err(|e| AppError::from_db(e, &format!("key {}", key.kid)))?;

        Ok(())
    }

    async fn update(&self, key: &SigningKey) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jwks_keys
            SET status = $2, grace_since = $3, updated_at = $4, version = version + 1
            WHERE kid = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(&key.kid)
        .bind(key.status)
        .bind(key.grace_since)
        .bind(key.updated_at)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("key {}", key.kid)));
        }
        Ok(())
    }

    async fn delete(&self, kid: &str) -> Result<()> {
        sqlx::query("DELETE FROM jwks_keys WHERE kid = $1")
            .bind(kid)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn find_by_kid(&self, kid: &str) -> Result<Option<SigningKey>> {
        let key = sqlx::query_as::<_, SigningKey>(
            "SELECT * FROM jwks_keys WHERE kid = $1 AND deleted_at IS NULL",
        )
        .bind(kid)
        .fetch_optional(&self.db)
        .await?;

        Ok(key)
    }

    async fn find_by_status(&self, status: KeyStatus) -> Result<Vec<SigningKey>> {
        let keys = sqlx::query_as::<_, SigningKey>(
            "SELECT * FROM jwks_keys WHERE status = $1 AND deleted_at IS NULL ORDER BY kid",
        )
        .bind(status)
        .fetch_all(&self.db)
        .await?;

        Ok(keys)
    }

    async fn find_all(&self) -> Result<Vec<SigningKey>> {
        let keys = sqlx::query_as::<_, SigningKey>(
            "SELECT * FROM jwks_keys WHERE deleted_at IS NULL ORDER BY kid",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(keys)
    }

    async fn find_publishable(&self, now: DateTime<Utc>) -> Result<Vec<SigningKey>> {
        let keys = sqlx::query_as::<_, SigningKey>(
            r#"
            SELECT * FROM jwks_keys
            WHERE status IN ('active', 'grace')
              AND not_before <= $1 AND not_after >= $1
              AND deleted_at IS NULL
            ORDER BY kid
            "#,
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        Ok(keys)
    }

    async fn list(&self, status: Option<KeyStatus>, page: Pagination) -> Result<Page<SigningKey>> {
        let page = page.normalized();

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jwks_keys
            WHERE ($1::key_status IS NULL OR status = $1) AND deleted_at IS NULL
            "#,
        )
        .bind(status)
        .fetch_one(&self.db)
        .await?;

        let items = sqlx::query_as::<_, SigningKey>(
            r#"
            SELECT * FROM jwks_keys
            WHERE ($1::key_status IS NULL OR status = $1) AND deleted_at IS NULL
            ORDER BY kid
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(status)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.db)
        .await?;

        Ok(Page { items, total })
    }
}
