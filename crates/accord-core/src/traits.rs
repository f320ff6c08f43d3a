//! Storage seams for connector configuration and provisioning tasks

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    ids::{ConnectorId, TaskId, TenantId},
    models::ConnectorConfig,
    provisioning::{ProvisioningTask, TaskFilter, TaskTransition},
};

// =============================================================================
// Connector Configuration
// =============================================================================

/// Tenant-scoped persistence of connector configuration.
///
/// Implementations keep credentials encrypted at rest and hand them back in
/// clear to callers of `get`/`list`.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn create(&self, config: &ConnectorConfig) -> Result<ConnectorConfig>;

    async fn get(&self, tenant_id: TenantId, id: ConnectorId) -> Result<Option<ConnectorConfig>>;

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<ConnectorConfig>>;

    /// Every enabled config across tenants, for startup rehydration
    async fn list_enabled(&self) -> Result<Vec<ConnectorConfig>>;

    /// Replace the stored record; `NotFound` if absent
    async fn update(&self, config: &ConnectorConfig) -> Result<ConnectorConfig>;

    /// `NotFound` if absent
    async fn delete(&self, tenant_id: TenantId, id: ConnectorId) -> Result<()>;

    async fn set_enabled(
        &self,
        tenant_id: TenantId,
        id: ConnectorId,
        enabled: bool,
    ) -> Result<ConnectorConfig>;
}

// =============================================================================
// Provisioning Tasks
// =============================================================================

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn enqueue(&self, task: &ProvisioningTask) -> Result<TaskId>;

    async fn get(&self, id: TaskId) -> Result<Option<ProvisioningTask>>;

    /// Pending tasks with `scheduled_at <= now`, oldest schedule first
    async fn list_pending(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ProvisioningTask>>;

    /// Atomic `pending -> processing`. `None` when another worker won the
    /// claim or the task is no longer pending.
    async fn claim(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<ProvisioningTask>>;

    /// Record an outcome for the claim taken at `claimed_at`. `Conflict` when
    /// the task is not `processing` under that same claim.
    async fn transition(
        &self,
        id: TaskId,
        claimed_at: DateTime<Utc>,
        transition: TaskTransition,
    ) -> Result<ProvisioningTask>;

    async fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        filter: &TaskFilter,
    ) -> Result<Vec<ProvisioningTask>>;

    /// Return tasks claimed before `cutoff` and still `processing` to
    /// `pending`. Returns how many were released.
    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
