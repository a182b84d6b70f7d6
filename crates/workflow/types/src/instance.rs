//! Workflow instances: running executions of workflow definitions
//!
//! A WorkflowInstance is the unit the persistence layer stores. The engine
//! mutates its own copy (status, schedule, pointers) and hands the whole
//! instance back to the store; `id` and `version` belong to the store.

use crate::{ExecutionPointerSet, WorkflowDefinitionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version assigned to an instance when it is first stored
pub const INITIAL_VERSION: u64 = 1;

// ── Instance Identifier ──────────────────────────────────────────────

/// Unique identifier for a workflow instance
///
/// An empty id means the store has not assigned one yet.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct WorkflowInstanceId(pub String);

impl WorkflowInstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unassigned() -> Self {
        Self(String::new())
    }

    pub fn is_unassigned(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Workflow Status ──────────────────────────────────────────────────

/// The lifecycle status of a workflow instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkflowStatus {
    /// Eligible for evaluation once `next_execution` is due
    #[default]
    Runnable,
    /// Parked until something resumes it
    Suspended,
    /// Finished successfully
    Complete,
    /// Stopped before completion
    Terminated,
}

impl WorkflowStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Terminated)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Runnable => "runnable",
            Self::Suspended => "suspended",
            Self::Complete => "complete",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

// ── Workflow Instance ────────────────────────────────────────────────

/// A running instance of a workflow definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Assigned by the store on creation, immutable afterwards
    pub id: WorkflowInstanceId,
    /// The definition this instance executes (opaque to the store)
    pub workflow_definition_id: WorkflowDefinitionId,
    /// Optimistic-concurrency token, owned by the store
    pub version: u64,
    #[serde(default)]
    pub description: String,
    /// Caller correlation key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Engine-defined payload, never interpreted by the store
    #[serde(default)]
    pub data: serde_json::Value,
    pub status: WorkflowStatus,
    /// Earliest re-evaluation time in Unix epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<i64>,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_pointers: ExecutionPointerSet,
}

impl WorkflowInstance {
    /// Create an unstored, runnable instance
    pub fn new(workflow_definition_id: WorkflowDefinitionId) -> Self {
        Self {
            id: WorkflowInstanceId::unassigned(),
            workflow_definition_id,
            version: 0,
            description: String::new(),
            reference: None,
            data: serde_json::Value::Null,
            status: WorkflowStatus::Runnable,
            next_execution: None,
            create_time: Utc::now(),
            complete_time: None,
            execution_pointers: ExecutionPointerSet::new(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_create_time(mut self, create_time: DateTime<Utc>) -> Self {
        self.create_time = create_time;
        self
    }

    pub fn with_next_execution(mut self, millis: i64) -> Self {
        self.next_execution = Some(millis);
        self
    }

    // ── Engine-side transitions ──────────────────────────────────────

    pub fn suspend(&mut self) {
        self.status = WorkflowStatus::Suspended;
    }

    /// Resume a suspended instance; terminal instances stay terminal
    pub fn resume(&mut self) {
        if self.status == WorkflowStatus::Suspended {
            self.status = WorkflowStatus::Runnable;
        }
    }

    pub fn complete(&mut self) {
        self.status = WorkflowStatus::Complete;
        self.complete_time = Some(Utc::now());
        self.next_execution = None;
    }

    /// Terminate the instance, cancelling every active pointer
    pub fn terminate(&mut self) {
        self.status = WorkflowStatus::Terminated;
        self.complete_time = Some(Utc::now());
        self.next_execution = None;
        self.execution_pointers.deactivate_all();
    }

    pub fn schedule_at(&mut self, at: DateTime<Utc>) {
        self.next_execution = Some(at.timestamp_millis());
    }

    pub fn clear_schedule(&mut self) {
        self.next_execution = None;
    }

    // ── Query methods ────────────────────────────────────────────────

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal and no pointer left active
    pub fn is_retired(&self) -> bool {
        self.is_terminal() && !self.execution_pointers.any_active()
    }

    /// Runnable with a `next_execution` at or before `as_of`
    pub fn is_due(&self, as_of: DateTime<Utc>) -> bool {
        self.status == WorkflowStatus::Runnable
            && self
                .next_execution
                .is_some_and(|next| next <= as_of.timestamp_millis())
    }

    /// `next_execution` as a timestamp, if set and in range
    pub fn next_execution_time(&self) -> Option<DateTime<Utc>> {
        self.next_execution.and_then(DateTime::from_timestamp_millis)
    }
}
