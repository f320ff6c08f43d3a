//! Schema for connector configuration and provisioning tasks

use sqlx::PgPool;
use tracing::info;

use accord_core::{AccordError, Result};

/// DDL statements, applied in order. Each is idempotent.
pub const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS connector_configs (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        name TEXT NOT NULL,
        connector_type TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        endpoint TEXT NOT NULL DEFAULT '',
        credentials_encrypted BYTEA,
        settings JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (tenant_id, id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_connector_configs_tenant
        ON connector_configs (tenant_id, name)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_connector_configs_enabled
        ON connector_configs (created_at) WHERE enabled
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS provisioning_tasks (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        connector_id UUID NOT NULL,
        operation TEXT NOT NULL CHECK (operation IN (
            'create_user', 'update_user', 'delete_user', 'add_to_group', 'remove_from_group'
        )),
        resource_type TEXT NOT NULL,
        resource_id TEXT,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN (
            'pending', 'processing', 'completed', 'failed'
        )),
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        processed_at TIMESTAMPTZ,
        claimed_at TIMESTAMPTZ,
        release_count INTEGER NOT NULL DEFAULT 0,
        CHECK (retry_count >= 0 AND retry_count <= max_retries)
    )
    "#,
    r#"
    ALTER TABLE provisioning_tasks
        ADD COLUMN IF NOT EXISTS release_count INTEGER NOT NULL DEFAULT 0
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_provisioning_tasks_due
        ON provisioning_tasks (scheduled_at) WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_provisioning_tasks_claimed
        ON provisioning_tasks (claimed_at) WHERE status = 'processing'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_provisioning_tasks_tenant
        ON provisioning_tasks (tenant_id, created_at DESC)
    "#,
];

/// Apply [`MIGRATIONS`] to the database
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    for (i, statement) in MIGRATIONS.iter().enumerate() {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| AccordError::database_error(format!("Migration {} failed: {}", i, e)))?;
    }

    info!("Applied {} schema statements", MIGRATIONS.len());
    Ok(())
}
