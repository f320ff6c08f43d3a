//! Connector configuration repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

use accord_core::{
    AccordError, ConfigStore, ConnectorConfig, ConnectorId, Credentials, Result, TenantId,
};

use super::db_error;
use crate::crypto::CredentialCipher;

const COLUMNS: &str = "id, tenant_id, name, connector_type, enabled, endpoint, \
                       credentials_encrypted, settings, created_at, updated_at";

/// PostgreSQL-backed [`ConfigStore`]. Credentials are sealed with the
/// configured cipher on write and opened on read.
pub struct PgConfigStore {
    pool: PgPool,
    cipher: CredentialCipher,
}

impl PgConfigStore {
    pub fn new(pool: PgPool, cipher: CredentialCipher) -> Self {
        Self { pool, cipher }
    }

    fn seal(&self, credentials: &Credentials) -> Result<Option<Vec<u8>>> {
        if credentials.is_empty() {
            return Ok(None);
        }
        self.cipher.seal_credentials(credentials).map(Some)
    }

    fn row_to_config(&self, row: &PgRow) -> Result<ConnectorConfig> {
        let sealed: Option<Vec<u8>> = row.try_get("credentials_encrypted").map_err(db_error)?;
        let credentials = match sealed {
            Some(bytes) => self.cipher.open_credentials(&bytes)?,
            None => Credentials::new(),
        };

        let settings: serde_json::Value = row.try_get("settings").map_err(db_error)?;
        let settings: HashMap<String, serde_json::Value> = serde_json::from_value(settings)
            .map_err(|e| AccordError::database_error(format!("Invalid settings column: {}", e)))?;

        Ok(ConnectorConfig {
            id: ConnectorId::from_uuid(row.try_get::<Uuid, _>("id").map_err(db_error)?),
            tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id").map_err(db_error)?),
            name: row.try_get("name").map_err(db_error)?,
            connector_type: row.try_get("connector_type").map_err(db_error)?,
            enabled: row.try_get("enabled").map_err(db_error)?,
            endpoint: row.try_get("endpoint").map_err(db_error)?,
            credentials,
            settings,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(db_error)?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(db_error)?,
        })
    }
}

fn settings_json(config: &ConnectorConfig) -> Result<serde_json::Value> {
    serde_json::to_value(&config.settings)
        .map_err(|e| AccordError::invalid_input(format!("Settings are not serializable: {}", e)))
}

#[async_trait]
impl ConfigStore for PgConfigStore {
    #[instrument(skip(self, config), fields(connector_id = %config.id, tenant_id = %config.tenant_id))]
    async fn create(&self, config: &ConnectorConfig) -> Result<ConnectorConfig> {
        let sealed = self.seal(&config.credentials)?;
        let settings = settings_json(config)?;

        let query = format!(
            r#"
            INSERT INTO connector_configs ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(config.id.as_uuid())
            .bind(config.tenant_id.as_uuid())
            .bind(&config.name)
            .bind(&config.connector_type)
            .bind(config.enabled)
            .bind(&config.endpoint)
            .bind(sealed)
            .bind(settings)
            .bind(config.created_at)
            .bind(config.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    AccordError::conflict(format!("connector {} already exists", config.id))
                }
                _ => db_error(e),
            })?;

        debug!("Stored connector configuration");
        self.row_to_config(&row)
    }

    #[instrument(skip(self))]
    async fn get(&self, tenant_id: TenantId, id: ConnectorId) -> Result<Option<ConnectorConfig>> {
        let query = format!(
            "SELECT {COLUMNS} FROM connector_configs WHERE tenant_id = $1 AND id = $2"
        );
        let row = sqlx::query(&query)
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.map(|r| self.row_to_config(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<ConnectorConfig>> {
        let query = format!(
            "SELECT {COLUMNS} FROM connector_configs WHERE tenant_id = $1 ORDER BY name, id"
        );
        let rows = sqlx::query(&query)
            .bind(tenant_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(|r| self.row_to_config(r)).collect()
    }

    async fn list_enabled(&self) -> Result<Vec<ConnectorConfig>> {
        let query = format!(
            "SELECT {COLUMNS} FROM connector_configs WHERE enabled ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(|r| self.row_to_config(r)).collect()
    }

    #[instrument(skip(self, config), fields(connector_id = %config.id))]
    async fn update(&self, config: &ConnectorConfig) -> Result<ConnectorConfig> {
        let sealed = self.seal(&config.credentials)?;
        let settings = settings_json(config)?;

        let query = format!(
            r#"
            UPDATE connector_configs
            SET name = $3, connector_type = $4, enabled = $5, endpoint = $6,
                credentials_encrypted = $7, settings = $8, updated_at = $9
            WHERE tenant_id = $1 AND id = $2
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(config.tenant_id.as_uuid())
            .bind(config.id.as_uuid())
            .bind(&config.name)
            .bind(&config.connector_type)
            .bind(config.enabled)
            .bind(&config.endpoint)
            .bind(sealed)
            .bind(settings)
            .bind(config.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| AccordError::not_found("connector", config.id.to_string()))?;

        self.row_to_config(&row)
    }

    #[instrument(skip(self))]
    async fn delete(&self, tenant_id: TenantId, id: ConnectorId) -> Result<()> {
        let result = sqlx::query("DELETE FROM connector_configs WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AccordError::not_found("connector", id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_enabled(
        &self,
        tenant_id: TenantId,
        id: ConnectorId,
        enabled: bool,
    ) -> Result<ConnectorConfig> {
        let query = format!(
            r#"
            UPDATE connector_configs
            SET enabled = $3, updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .bind(enabled)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| AccordError::not_found("connector", id.to_string()))?;

        self.row_to_config(&row)
    }
}
