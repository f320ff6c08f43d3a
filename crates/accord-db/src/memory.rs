//! In-process stores
//!
//! Every state change on a task happens under the same lock as its read, so
//! claims and transitions keep the compare-and-set semantics of the
//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use accord_core::{
    AccordError, ConfigStore, ConnectorConfig, ConnectorId, ProvisioningTask, Result, TaskFilter,
    TaskId, TaskStatus, TaskStore, TaskTransition, TenantId,
};

// =============================================================================
// Connector Configuration
// =============================================================================

#[derive(Default)]
pub struct InMemoryConfigStore {
    configs: RwLock<HashMap<ConnectorId, ConnectorConfig>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn create(&self, config: &ConnectorConfig) -> Result<ConnectorConfig> {
        let mut configs = self.configs.write().await;
        if configs.contains_key(&config.id) {
            return Err(AccordError::conflict(format!(
                "connector {} already exists",
                config.id
            )));
        }
        configs.insert(config.id, config.clone());
        Ok(config.clone())
    }

    async fn get(&self, tenant_id: TenantId, id: ConnectorId) -> Result<Option<ConnectorConfig>> {
        let configs = self.configs.read().await;
        Ok(configs
            .get(&id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<ConnectorConfig>> {
        let configs = self.configs.read().await;
        let mut listed: Vec<_> = configs
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(listed)
    }

    async fn list_enabled(&self) -> Result<Vec<ConnectorConfig>> {
        let configs = self.configs.read().await;
        let mut listed: Vec<_> = configs.values().filter(|c| c.enabled).cloned().collect();
        listed.sort_by_key(|c| (c.created_at, c.id));
        Ok(listed)
    }

    async fn update(&self, config: &ConnectorConfig) -> Result<ConnectorConfig> {
        let mut configs = self.configs.write().await;
        match configs.get_mut(&config.id) {
            Some(existing) if existing.tenant_id == config.tenant_id => {
                *existing = config.clone();
                Ok(config.clone())
            }
            _ => Err(AccordError::not_found("connector", config.id.to_string())),
        }
    }

    async fn delete(&self, tenant_id: TenantId, id: ConnectorId) -> Result<()> {
        let mut configs = self.configs.write().await;
        match configs.get(&id) {
            Some(existing) if existing.tenant_id == tenant_id => {
                configs.remove(&id);
                Ok(())
            }
            _ => Err(AccordError::not_found("connector", id.to_string())),
        }
    }

    async fn set_enabled(
        &self,
        tenant_id: TenantId,
        id: ConnectorId,
        enabled: bool,
    ) -> Result<ConnectorConfig> {
        let mut configs = self.configs.write().await;
        match configs.get_mut(&id) {
            Some(existing) if existing.tenant_id == tenant_id => {
                existing.enabled = enabled;
                existing.updated_at = Utc::now();
                Ok(existing.clone())
            }
            _ => Err(AccordError::not_found("connector", id.to_string())),
        }
    }
}

// =============================================================================
// Provisioning Tasks
// =============================================================================

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, ProvisioningTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: &ProvisioningTask) -> Result<TaskId> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return Err(AccordError::conflict(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(task.id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<ProvisioningTask>> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn list_pending(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ProvisioningTask>> {
        let tasks = self.tasks.lock().await;
        let mut due: Vec<_> = tasks.values().filter(|t| t.is_due(now)).cloned().collect();
        due.sort_by_key(|t| (t.scheduled_at, t.id));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn claim(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<ProvisioningTask>> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };
        if task.try_claim(now) {
            Ok(Some(task.clone()))
        } else {
            debug!(task_id = %id, status = %task.status, "Claim lost");
            Ok(None)
        }
    }

    async fn transition(
        &self,
        id: TaskId,
        claimed_at: DateTime<Utc>,
        transition: TaskTransition,
    ) -> Result<ProvisioningTask> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| AccordError::not_found("task", id.to_string()))?;
        task.apply_claimed(claimed_at, &transition)?;
        Ok(task.clone())
    }

    async fn list_by_tenant(
        &self,
        tenant_id: TenantId,
        filter: &TaskFilter,
    ) -> Result<Vec<ProvisioningTask>> {
        let tasks = self.tasks.lock().await;
        let mut listed: Vec<_> = tasks
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.connector_id.map_or(true, |c| t.connector_id == c))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            listed.truncate(limit as usize);
        }
        Ok(listed)
    }

    async fn release_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tasks = self.tasks.lock().await;
        let release = TaskTransition::Release {
            note: STALE_CLAIM_NOTE.to_string(),
        };

        let mut released = 0;
        for task in tasks.values_mut() {
            let stale = task.status == TaskStatus::Processing
                && task.claimed_at.map_or(true, |at| at < cutoff);
            if stale {
                task.apply(&release)?;
                released += 1;
            }
        }
        Ok(released)
    }
}

/// Error message left on a task whose claim was released
pub const STALE_CLAIM_NOTE: &str = "claim expired before an outcome was recorded";
