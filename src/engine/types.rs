use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Flat key/value settings exchanged with remote configuration clients.
pub type Settings = serde_json::Map<String, serde_json::Value>;

/// Status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WorkflowStatus::Pending),
            "running" => Some(WorkflowStatus::Running),
            "completed" => Some(WorkflowStatus::Completed),
            "failed" => Some(WorkflowStatus::Failed),
            "cancelled" => Some(WorkflowStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of an individual step within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Retry configuration for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of additional attempts after the first one.
    pub retry_count: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            retry_count,
            retry_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 0,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Observable state of one step, kept inside the workflow's state lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub description: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            status: StepStatus::Pending,
            attempts: 0,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Rack placement metadata for a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RackLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    pub rack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<u32>,
}

impl RackLocation {
    /// Parse `rack`, `rack:unit` or `datacenter/rack:unit`.
    pub fn parse(s: &str) -> Option<Self> {
        let (datacenter, rest) = match s.split_once('/') {
            Some((dc, rest)) => (Some(dc.to_string()), rest),
            None => (None, s),
        };
        let (rack, unit) = match rest.split_once(':') {
            Some((rack, unit)) => (rack, Some(unit.parse().ok()?)),
            None => (rest, None),
        };
        if rack.is_empty() {
            return None;
        }
        Some(Self {
            datacenter,
            rack: rack.to_string(),
            unit,
        })
    }
}

impl std::fmt::Display for RackLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref dc) = self.datacenter {
            write!(f, "{}/", dc)?;
        }
        write!(f, "{}", self.rack)?;
        if let Some(unit) = self.unit {
            write!(f, ":{}", unit)?;
        }
        Ok(())
    }
}

/// Consistent, serializable copy of a workflow's observable state.
///
/// This is also the record written to a [`crate::storage::WorkflowStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: String,
    pub workflow_type: String,
    pub server_id: String,
    pub device_type: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub current_step_index: Option<usize>,
    pub current_step: Option<String>,
    pub current_sub_task: Option<String>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub steps: Vec<StepState>,
}

impl WorkflowSnapshot {
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn step_statuses(&self) -> Vec<StepStatus> {
        self.steps.iter().map(|s| s.status).collect()
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }
}
