//! App credential repository (第三方应用凭证)

use async_trait::async_trait;
use sqlx::PgPool;

use super::AppCredentialStore;
use crate::{
    error::{AppError, Result},
    models::app::{AppCredentials, AppCredentialsRow},
};

pub struct PgAppCredentialRepository {
    db: PgPool,
}

impl PgAppCredentialRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AppCredentialStore for PgAppCredentialRepository {
    async fn create(&self, app: &AppCredentials) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_credentials (id, app_id, name, app_type, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(app.id)
        .bind(&app.app_id)
        .bind(&app.name)
        .bind(&app.app_type)
        .bind(app.status)
        .bind(app.created_at)
        .bind(app.updated_at)
        .execute(&self.db)
        .await
        .map_err(|e| AppError::from_db(e, &format!("app {}", app.app_id)))?;

        Ok(())
    }

    async fn find_by_app_id(&self, app_id: &str) -> Result<Option<AppCredentials>> {
        let row = sqlx::query_as::<_, AppCredentialsRow>(
            "SELECT * FROM app_credentials WHERE app_id = $1 AND deleted_at IS NULL",
        )
        .bind(app_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(AppCredentials::from))
    }

    async fn update(&self, app: &AppCredentials) -> Result<AppCredentials> {
        let auth = app.auth.as_ref();
        let msg = app.msg.as_ref();

        let row = sqlx::query_as::<_, AppCredentialsRow>(
            r#"
            UPDATE app_credentials
            SET
                name = $3,
                status = $4,
                auth_cipher = $5,
                auth_fingerprint = $6,
                auth_version = $7,
                auth_rotated_at = $8,
                msg_callback_token = $9,
                msg_aes_key_cipher = $10,
                msg_version = $11,
                msg_rotated_at = $12,
                updated_at = $13,
                version = version + 1
            WHERE app_id = $1 AND version = $2 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(&app.app_id)
        .bind(app.version)
        .bind(&app.name)
        .bind(app.status)
        .bind(auth.map(|a| a.cipher.clone()))
        .bind(auth.map(|a| a.fingerprint.clone()))
        .bind(auth.map(|a| a.version).unwrap_or(0))
        .bind(auth.map(|a| a.rotated_at))
        .bind(msg.map(|m| m.callback_token.clone()))
        .bind(msg.map(|m| m.aes_key_cipher.clone()))
        .bind(msg.map(|m| m.version).unwrap_or(0))
        .bind(msg.map(|m| m.rotated_at))
        .bind(app.updated_at)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => match self.find_by_app_id(&app.app_id).await? {
                Some(_) => Err(AppError::Conflict(format!(
                    "app {} was modified concurrently",
                    app.app_id
                ))),
                None => Err(AppError::NotFound(format!("app {}", app.app_id))),
            },
        }
    }
}
