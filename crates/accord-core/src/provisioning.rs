//! Provisioning task model and its state machine
//!
//! A task moves `pending -> processing -> completed | failed`, with
//! `processing -> pending` when a retryable failure is rescheduled. Completed
//! and failed tasks are immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{
    error::{AccordError, Result},
    ids::{ConnectorId, TaskId, TenantId},
    models::ConnectorUser,
};

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = AccordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(AccordError::permanent(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateUserPayload {
    pub user: ConnectorUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateUserPayload {
    pub user_id: String,
    pub user: ConnectorUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteUserPayload {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipPayload {
    pub group_id: String,
    pub user_id: String,
}

/// The closed set of operations a task can carry, each with its typed payload.
///
/// Serialized adjacently tagged: `{"operation": "create_user", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "snake_case")]
pub enum ProvisioningOperation {
    CreateUser(CreateUserPayload),
    UpdateUser(UpdateUserPayload),
    DeleteUser(DeleteUserPayload),
    AddToGroup(MembershipPayload),
    RemoveFromGroup(MembershipPayload),
}

impl ProvisioningOperation {
    pub const NAMES: [&'static str; 5] = [
        "create_user",
        "update_user",
        "delete_user",
        "add_to_group",
        "remove_from_group",
    ];

    pub fn create_user(user: ConnectorUser) -> Self {
        Self::CreateUser(CreateUserPayload { user })
    }

    pub fn update_user(user_id: impl Into<String>, user: ConnectorUser) -> Self {
        Self::UpdateUser(UpdateUserPayload {
            user_id: user_id.into(),
            user,
        })
    }

    pub fn delete_user(user_id: impl Into<String>) -> Self {
        Self::DeleteUser(DeleteUserPayload {
            user_id: user_id.into(),
        })
    }

    pub fn add_to_group(group_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::AddToGroup(MembershipPayload {
            group_id: group_id.into(),
            user_id: user_id.into(),
        })
    }

    pub fn remove_from_group(group_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::RemoveFromGroup(MembershipPayload {
            group_id: group_id.into(),
            user_id: user_id.into(),
        })
    }

    /// Externally visible operation name
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateUser(_) => "create_user",
            Self::UpdateUser(_) => "update_user",
            Self::DeleteUser(_) => "delete_user",
            Self::AddToGroup(_) => "add_to_group",
            Self::RemoveFromGroup(_) => "remove_from_group",
        }
    }

    pub fn resource_type(&self) -> &'static str {
        match self {
            Self::CreateUser(_) | Self::UpdateUser(_) | Self::DeleteUser(_) => "user",
            Self::AddToGroup(_) | Self::RemoveFromGroup(_) => "group",
        }
    }

    pub fn resource_id(&self) -> Option<String> {
        match self {
            Self::CreateUser(p) => p.user.id.clone(),
            Self::UpdateUser(p) => Some(p.user_id.clone()),
            Self::DeleteUser(p) => Some(p.user_id.clone()),
            Self::AddToGroup(p) | Self::RemoveFromGroup(p) => Some(p.group_id.clone()),
        }
    }

    /// Whether the connector reporting "already exists" means a prior
    /// attempt of this operation took effect
    pub fn conflict_means_applied(&self) -> bool {
        matches!(self, Self::CreateUser(_) | Self::AddToGroup(_))
    }

    /// Whether the connector reporting "not found" means a prior attempt of
    /// this operation took effect
    pub fn not_found_means_applied(&self) -> bool {
        matches!(self, Self::DeleteUser(_) | Self::RemoveFromGroup(_))
    }

    /// Payload as stored in the task's `payload` column
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }

    /// Decode an untyped `(operation, payload)` pair
    pub fn from_parts(operation: &str, payload: serde_json::Value) -> Result<Self> {
        if !Self::NAMES.contains(&operation) {
            return Err(AccordError::permanent(format!(
                "unknown operation '{}'",
                operation
            )));
        }

        let tagged = serde_json::json!({ "operation": operation, "payload": payload });
        serde_json::from_value(tagged).map_err(|e| {
            AccordError::permanent(format!("invalid payload for {}: {}", operation, e))
        })
    }

    /// Reject payloads that could never succeed against any connector
    pub fn validate(&self) -> Result<()> {
        fn require(field: &str, value: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(AccordError::invalid_input(format!("{} is required", field)));
            }
            Ok(())
        }

        match self {
            Self::CreateUser(p) => require("user.user_name", &p.user.user_name),
            Self::UpdateUser(p) => {
                require("user_id", &p.user_id)?;
                require("user.user_name", &p.user.user_name)
            }
            Self::DeleteUser(p) => require("user_id", &p.user_id),
            Self::AddToGroup(p) | Self::RemoveFromGroup(p) => {
                require("group_id", &p.group_id)?;
                require("user_id", &p.user_id)
            }
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Input to enqueue
#[derive(Debug, Clone)]
pub struct NewTask {
    pub tenant_id: TenantId,
    pub connector_id: ConnectorId,
    pub operation: ProvisioningOperation,
    /// Falls back to the engine default when `None`
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(
        tenant_id: TenantId,
        connector_id: ConnectorId,
        operation: ProvisioningOperation,
    ) -> Self {
        Self {
            tenant_id,
            connector_id,
            operation,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningTask {
    pub id: TaskId,
    pub tenant_id: TenantId,
    pub connector_id: ConnectorId,
    pub operation: ProvisioningOperation,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// When the task last entered `processing`. Identifies the claim an
    /// outcome belongs to.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Times an abandoned claim was returned to `pending`
    #[serde(default)]
    pub release_count: u32,
}

impl ProvisioningTask {
    /// Build a fresh `pending` task due immediately
    pub fn pending(
        tenant_id: TenantId,
        connector_id: ConnectorId,
        operation: ProvisioningOperation,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            tenant_id,
            connector_id,
            resource_type: operation.resource_type().to_string(),
            resource_id: operation.resource_id(),
            operation,
            status: TaskStatus::Pending,
            error_message: None,
            retry_count: 0,
            max_retries,
            created_at: now,
            scheduled_at: now,
            processed_at: None,
            claimed_at: None,
            release_count: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_at <= now
    }

    /// Whether another attempt is allowed after the current one fails
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether an earlier attempt may already have reached the external
    /// system, either retried or released mid-flight
    pub fn has_prior_attempt(&self) -> bool {
        self.retry_count > 0 || self.release_count > 0
    }

    /// Compare-and-set `pending -> processing`. Returns `false` when the task
    /// is no longer pending, leaving it untouched.
    pub fn try_claim(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Processing;
        self.claimed_at = Some(now);
        true
    }

    /// Apply an outcome on behalf of the claim taken at `claimed_at`.
    /// `Conflict` when that claim was released or superseded.
    pub fn apply_claimed(
        &mut self,
        claimed_at: DateTime<Utc>,
        transition: &TaskTransition,
    ) -> Result<()> {
        if self.status == TaskStatus::Processing && self.claimed_at != Some(claimed_at) {
            return Err(AccordError::conflict(format!(
                "task {} claim at {} is no longer current",
                self.id, claimed_at
            )));
        }
        self.apply(transition)
    }

    /// Apply an outcome to a task in `processing`
    pub fn apply(&mut self, transition: &TaskTransition) -> Result<()> {
        if self.status != TaskStatus::Processing {
            return Err(AccordError::conflict(format!(
                "task {} is {}, expected processing",
                self.id, self.status
            )));
        }

        match transition {
            TaskTransition::Complete { at } => {
                self.status = TaskStatus::Completed;
                self.processed_at = Some(*at);
            }
            TaskTransition::Retry {
                error,
                retry_count,
                scheduled_at,
            } => {
                if *retry_count != self.retry_count + 1 || *retry_count > self.max_retries {
                    return Err(AccordError::conflict(format!(
                        "task {} cannot move to retry {} (current {}, max {})",
                        self.id, retry_count, self.retry_count, self.max_retries
                    )));
                }
                self.status = TaskStatus::Pending;
                self.retry_count = *retry_count;
                self.error_message = Some(error.clone());
                self.scheduled_at = *scheduled_at;
            }
            TaskTransition::Fail { error, at } => {
                self.status = TaskStatus::Failed;
                self.error_message = Some(error.clone());
                self.processed_at = Some(*at);
            }
            TaskTransition::Release { note } => {
                self.status = TaskStatus::Pending;
                self.error_message = Some(note.clone());
                self.release_count = self.release_count.saturating_add(1);
            }
        }

        Ok(())
    }
}

/// Outcome recorded against a task in `processing`
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    Complete {
        at: DateTime<Utc>,
    },
    Retry {
        error: String,
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
    },
    Fail {
        error: String,
        at: DateTime<Utc>,
    },
    /// Return an abandoned claim to `pending` without consuming a retry
    Release {
        note: String,
    },
}

impl TaskTransition {
    pub fn target_status(&self) -> TaskStatus {
        match self {
            Self::Complete { .. } => TaskStatus::Completed,
            Self::Retry { .. } | Self::Release { .. } => TaskStatus::Pending,
            Self::Fail { .. } => TaskStatus::Failed,
        }
    }
}

/// Filter for listing a tenant's tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub connector_id: Option<ConnectorId>,
    pub limit: Option<u32>,
}
