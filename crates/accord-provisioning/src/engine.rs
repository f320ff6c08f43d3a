//! Provisioning Engine
//!
//! Selects due tasks, claims each one atomically, dispatches its operation
//! through the live connector and records the outcome.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use accord_connectors::ConnectorRegistry;
use accord_core::{
    with_deadline, AccordError, Clock, Connector, ConnectorId, NewTask, ProvisioningOperation,
    ProvisioningTask, Result, SystemClock, TaskFilter, TaskId, TaskStore, TaskTransition,
    TenantId,
};

use crate::retry::RetryPolicy;

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Retries granted to tasks enqueued without an explicit limit
    pub default_max_retries: u32,
    /// Upper bound on a single connector call
    pub operation_timeout: Duration,
    /// Maximum tasks selected per run
    pub batch_size: u32,
    /// Claimed tasks executed at once within a run
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            operation_timeout: Duration::from_secs(30),
            batch_size: 50,
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Tally of one [`ProvisioningEngine::run_once`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Due tasks returned by selection
    pub selected: usize,
    /// Tasks this run won the claim for
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Tasks whose outcome could not be recorded
    pub errors: usize,
}

impl BatchReport {
    pub fn is_idle(&self) -> bool {
        self.selected == 0
    }
}

enum Processed {
    Lost,
    Completed,
    Retried,
    Failed,
    Unrecorded,
}

pub struct ProvisioningEngine<S>
where
    S: TaskStore,
{
    store: Arc<S>,
    registry: Arc<ConnectorRegistry>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl<S> ProvisioningEngine<S>
where
    S: TaskStore + 'static,
{
    pub fn new(store: Arc<S>, registry: Arc<ConnectorRegistry>, settings: EngineSettings) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    /// Replace the wall clock used for scheduling decisions
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // =========================================================================
    // Enqueue and Queries
    // =========================================================================

    /// Validate and persist a new `pending` task due immediately
    #[instrument(skip(self, new_task), fields(
        tenant_id = %new_task.tenant_id,
        connector_id = %new_task.connector_id,
        operation = new_task.operation.name()
    ))]
    pub async fn enqueue(&self, new_task: NewTask) -> Result<ProvisioningTask> {
        new_task.operation.validate()?;

        let max_retries = new_task
            .max_retries
            .unwrap_or(self.settings.default_max_retries);
        let task = ProvisioningTask::pending(
            new_task.tenant_id,
            new_task.connector_id,
            new_task.operation,
            max_retries,
            self.clock.now(),
        );

        self.store.enqueue(&task).await?;
        info!(task_id = %task.id, max_retries, "Provisioning task enqueued");
        Ok(task)
    }

    /// Enqueue from an untyped operation name and JSON payload
    pub async fn enqueue_raw(
        &self,
        tenant_id: TenantId,
        connector_id: ConnectorId,
        operation: &str,
        payload: serde_json::Value,
        max_retries: Option<u32>,
    ) -> Result<ProvisioningTask> {
        let operation = ProvisioningOperation::from_parts(operation, payload)?;
        let mut new_task = NewTask::new(tenant_id, connector_id, operation);
        new_task.max_retries = max_retries;
        self.enqueue(new_task).await
    }

    /// A tenant's task; `NotFound` when absent or owned by another tenant
    pub async fn get_task(&self, tenant_id: TenantId, id: TaskId) -> Result<ProvisioningTask> {
        self.store
            .get(id)
            .await?
            .filter(|t| t.tenant_id == tenant_id)
            .ok_or_else(|| AccordError::not_found("task", id.to_string()))
    }

    pub async fn list_tasks(
        &self,
        tenant_id: TenantId,
        filter: &TaskFilter,
    ) -> Result<Vec<ProvisioningTask>> {
        self.store.list_by_tenant(tenant_id, filter).await
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Select due tasks and process them, up to `concurrency` at a time
    pub async fn run_once(&self) -> Result<BatchReport> {
        let due = self
            .store
            .list_pending(self.clock.now(), self.settings.batch_size)
            .await?;

        let mut report = BatchReport {
            selected: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        debug!(count = due.len(), "Processing due tasks");

        let outcomes: Vec<Processed> = stream::iter(due)
            .map(|task| self.process(task.id))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Processed::Lost => continue,
                Processed::Completed => report.completed += 1,
                Processed::Retried => report.retried += 1,
                Processed::Failed => report.failed += 1,
                Processed::Unrecorded => report.errors += 1,
            }
            report.claimed += 1;
        }

        info!(
            selected = report.selected,
            claimed = report.claimed,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            "Provisioning batch finished"
        );
        Ok(report)
    }

    /// Return claims older than `stale_after` to `pending`.
    ///
    /// `stale_after` must exceed `operation_timeout`, otherwise a claim whose
    /// connector call is still running could be handed to another worker.
    pub async fn release_stale_claims(&self, stale_after: Duration) -> Result<u64> {
        if stale_after <= self.settings.operation_timeout {
            return Err(AccordError::config_error(format!(
                "stale_after ({}ms) must exceed operation_timeout ({}ms)",
                stale_after.as_millis(),
                self.settings.operation_timeout.as_millis()
            )));
        }
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| AccordError::config_error(format!("stale_after out of range: {}", e)))?;
        let cutoff = self.clock.now() - stale_after;
        self.store.release_stale(cutoff).await
    }

    async fn process(&self, id: TaskId) -> Processed {
        let task = match self.store.claim(id, self.clock.now()).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %id, "Task claimed elsewhere, skipping");
                return Processed::Lost;
            }
            Err(e) => {
                error!(task_id = %id, "Failed to claim task: {}", e);
                return Processed::Lost;
            }
        };

        let Some(claimed_at) = task.claimed_at else {
            error!(task_id = %id, "Claimed task carries no claim timestamp");
            return Processed::Unrecorded;
        };

        let transition = self.execute(&task).await;
        let processed = match &transition {
            TaskTransition::Complete { .. } => Processed::Completed,
            TaskTransition::Retry { .. } => Processed::Retried,
            TaskTransition::Fail { .. } => Processed::Failed,
            TaskTransition::Release { .. } => Processed::Lost,
        };

        match self.store.transition(task.id, claimed_at, transition).await {
            Ok(_) => processed,
            Err(e) => {
                error!(task_id = %task.id, "Failed to record task outcome: {}", e);
                Processed::Unrecorded
            }
        }
    }

    #[instrument(skip(self, task), fields(
        task_id = %task.id,
        connector_id = %task.connector_id,
        operation = task.operation.name(),
        retry_count = task.retry_count
    ))]
    async fn execute(&self, task: &ProvisioningTask) -> TaskTransition {
        let Some(connector) = self.registry.get(task.connector_id).await else {
            warn!("Connector not live, failing task");
            return TaskTransition::Fail {
                error: format!("connector not found: {}", task.connector_id),
                at: self.clock.now(),
            };
        };

        let result = with_deadline(
            self.settings.operation_timeout,
            task.operation.name(),
            dispatch(connector.as_ref(), &task.operation),
        )
        .await;

        self.decide(task, result)
    }

    fn decide(&self, task: &ProvisioningTask, result: Result<()>) -> TaskTransition {
        let now = self.clock.now();

        let error = match result {
            Ok(()) => {
                info!("Provisioning task completed");
                return TaskTransition::Complete { at: now };
            }
            Err(e) => e,
        };

        if task.has_prior_attempt() && already_applied(&task.operation, &error) {
            info!("Earlier attempt already took effect: {}", error);
            return TaskTransition::Complete { at: now };
        }

        if error.is_retryable() && task.can_retry() {
            let scheduled_at = self.settings.retry.next_attempt_at(now, task.retry_count);
            warn!(
                error_kind = error.kind(),
                next_attempt = %scheduled_at,
                "Provisioning attempt failed, will retry: {}",
                error
            );
            return TaskTransition::Retry {
                error: error.to_string(),
                retry_count: task.retry_count + 1,
                scheduled_at,
            };
        }

        error!(error_kind = error.kind(), "Provisioning task failed: {}", error);
        TaskTransition::Fail {
            error: error.to_string(),
            at: now,
        }
    }
}

async fn dispatch(connector: &dyn Connector, operation: &ProvisioningOperation) -> Result<()> {
    match operation {
        ProvisioningOperation::CreateUser(p) => connector.create_user(&p.user).await.map(|_| ()),
        ProvisioningOperation::UpdateUser(p) => connector
            .update_user(&p.user_id, &p.user)
            .await
            .map(|_| ()),
        ProvisioningOperation::DeleteUser(p) => connector.delete_user(&p.user_id).await,
        ProvisioningOperation::AddToGroup(p) => {
            connector.add_user_to_group(&p.group_id, &p.user_id).await
        }
        ProvisioningOperation::RemoveFromGroup(p) => {
            connector
                .remove_user_from_group(&p.group_id, &p.user_id)
                .await
        }
    }
}

fn already_applied(operation: &ProvisioningOperation, error: &AccordError) -> bool {
    (operation.conflict_means_applied() && error.is_conflict())
        || (operation.not_found_means_applied() && error.is_not_found())
}
