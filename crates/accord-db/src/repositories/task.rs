//! Provisioning task repository
//!
//! Claims and transitions are single conditional `UPDATE ... RETURNING`
//! statements, so two workers racing for a task cannot both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use accord_core::{
    AccordError, ConnectorId, ProvisioningOperation, ProvisioningTask, Result, TaskFilter, TaskId,
    TaskStatus, TaskStore, TaskTransition, TenantId,
};

use super::db_error;
use crate::memory::STALE_CLAIM_NOTE;

const COLUMNS: &str = "id, tenant_id, connector_id, operation, resource_type, resource_id, \
                       payload, status, error_message, retry_count, max_retries, created_at, \
                       scheduled_at, processed_at, claimed_at, release_count";

pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish a missing task from one in the wrong state after a
    /// conditional update matched nothing
    async fn transition_rejected(&self, id: TaskId, target: TaskStatus) -> AccordError {
        match self.get(id).await {
            Ok(Some(task)) => AccordError::conflict(format!(
                "task {} is {}, cannot move to {}",
                id, task.status, target
            )),
            Ok(None) => AccordError::not_found("task", id.to_string()),
            Err(e) => e,
        }
    }
}

fn count(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| AccordError::database_error(format!("negative {}: {}", column, value)))
}

pub(crate) fn count_param(value: u32, field: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| AccordError::invalid_input(format!("{} out of range: {}", field, value)))
}

fn row_to_task(row: &PgRow) -> Result<ProvisioningTask> {
    let operation: String = row.try_get("operation").map_err(db_error)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(db_error)?;
    let status: String = row.try_get("status").map_err(db_error)?;

    Ok(ProvisioningTask {
        id: TaskId::from_uuid(row.try_get::<Uuid, _>("id").map_err(db_error)?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id").map_err(db_error)?),
        connector_id: ConnectorId::from_uuid(
            row.try_get::<Uuid, _>("connector_id").map_err(db_error)?,
        ),
        operation: ProvisioningOperation::from_parts(&operation, payload)?,
        resource_type: row.try_get("resource_type").map_err(db_error)?,
        resource_id: row.try_get("resource_id").map_err(db_error)?,
        status: status.parse()?,
        error_message: row.try_get("error_message").map_err(db_error)?,
        retry_count: count(row.try_get("retry_count").map_err(db_error)?, "retry_count")?,
        max_retries: count(row.try_get("max_retries").map_err(db_error)?, "max_retries")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(db_error)?,
        scheduled_at: row.try_get::<DateTime<Utc>, _>("scheduled_at").map_err(db_error)?,
        processed_at: row.try_get("processed_at").map_err(db_error)?,
        claimed_at: row.try_get("claimed_at").map_err(db_error)?,
        release_count: count(
            row.try_get("release_count").map_err(db_error)?,
            "release_count",
        )?,
    })
}

#[async_trait]
impl TaskStore for PgTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id, operation = task.operation.name()))]
    async fn enqueue(&self, task: &ProvisioningTask) -> Result<TaskId> {
        let retry_count = count_param(task.retry_count, "retry_count")?;
        let max_retries = count_param(task.max_retries, "max_retries")?;
        let release_count = count_param(task.release_count, "release_count")?;

        sqlx::query(&format!(
            r#"
            INSERT INTO provisioning_tasks ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#
        ))
        .bind(task.id.as_uuid())
        .bind(task.tenant_id.as_uuid())
        .bind(task.connector_id.as_uuid())
        .bind(task.operation.name())
        .bind(&task.resource_type)
        .bind(&task.resource_id)
        .bind(task.operation.payload_json()?)
        .bind(task.status.as_str())
        .bind(&task.error_message)
        .bind(retry_count)
        .bind(max_retries)
        .bind(task.created_at)
        .bind(task.scheduled_at)
        .bind(task.processed_at)
        .bind(task.claimed_at)
        .bind(release_count)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        debug!("Task enqueued");
        Ok(task.id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<ProvisioningTask>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM provisioning_tasks WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_pending(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ProvisioningTask>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM provisioning_tasks
            WHERE status = 'pending' AND scheduled_at <= $1
            ORDER BY scheduled_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn claim(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<ProvisioningTask>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE provisioning_tasks
            SET status = 'processing', claimed_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(row_to_task).transpose()
    }

    #[instrument(skip(self, transition), fields(target = %transition.target_status()))]
    async fn transition(
        &self,
        id: TaskId,
        claimed_at: DateTime<Utc>,
        transition: TaskTransition,
    ) -> Result<ProvisioningTask> {
        let row = match &transition {
            TaskTransition::Complete { at } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE provisioning_tasks
                    SET status = 'completed', processed_at = $2
                    WHERE id = $1 AND status = 'processing' AND claimed_at = $3
                    RETURNING {COLUMNS}
                    "#
                ))
                .bind(id.as_uuid())
                .bind(*at)
                .bind(claimed_at)
                .fetch_optional(&self.pool)
                .await
            }
            TaskTransition::Retry {
                error,
                retry_count,
                scheduled_at,
            } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE provisioning_tasks
                    SET status = 'pending', retry_count = $2, error_message = $3,
                        scheduled_at = $4
                    WHERE id = $1 AND status = 'processing' AND claimed_at = $5
                      AND retry_count = $2 - 1 AND $2 <= max_retries
                    RETURNING {COLUMNS}
                    "#
                ))
                .bind(id.as_uuid())
                .bind(count_param(*retry_count, "retry_count")?)
                .bind(error)
                .bind(*scheduled_at)
                .bind(claimed_at)
                .fetch_optional(&self.pool)
                .await
            }
            TaskTransition::Fail { error, at } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE provisioning_tasks
                    SET status = 'failed', error_message = $2, processed_at = $3
                    WHERE id = $1 AND status = 'processing' AND claimed_at = $4
                    RETURNING {COLUMNS}
                    "#
                ))
                .bind(id.as_uuid())
                .bind(error)
                .bind(*at)
                .bind(claimed_at)
                .fetch_optional(&self.pool)
                .await
            }
            TaskTransition::Release { note } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE provisioning_tasks
                    SET status = 'pending', error_message = $2,
                        release_count = release_count + 1
                    WHERE id = $1 AND status = 'processing' AND claimed_at = $3
                    RETURNING {COLUMNS}
                    "#
                ))
                .bind(id.as_uuid())
                .bind(note)
                .bind(claimed_at)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(db_error)?;

        match row {
            Some(row) => row_to_task(&row),
            None => Err(self
                .transition_rejected(id, transition.target_status())
                .await),
        }
    }

    async fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        filter: &TaskFilter,
    ) -> Result<Vec<ProvisioningTask>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM provisioning_tasks
            WHERE tenant_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::UUID IS NULL OR connector_id = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.connector_id.map(|c| c.into_uuid()))
        .bind(filter.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE provisioning_tasks
            SET status = 'pending', error_message = $2,
                release_count = release_count + 1
            WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < $1)
            "#,
        )
        .bind(cutoff)
        .bind(STALE_CLAIM_NOTE)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}
