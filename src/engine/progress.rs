//! Progress events emitted while a workflow runs.
//!
//! Every state transition of a workflow produces one [`ProgressEvent`],
//! delivered synchronously to the workflow's subscribers in the order the
//! transitions happen.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::types::{StepStatus, WorkflowStatus};

/// What kind of transition produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    WorkflowStarted,
    StepStarted,
    StepFinished,
    SubTask,
    WorkflowFinished,
}

/// A single progress notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub workflow_id: String,
    pub kind: ProgressKind,
    pub step_index: usize,
    pub total_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_status: Option<StepStatus>,
    pub workflow_status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        workflow_id: &str,
        kind: ProgressKind,
        step_index: usize,
        total_steps: usize,
        workflow_status: WorkflowStatus,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            kind,
            step_index,
            total_steps,
            step_name: None,
            step_status: None,
            workflow_status,
            sub_task: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, name: &str, status: StepStatus) -> Self {
        self.step_name = Some(name.to_string());
        self.step_status = Some(status);
        self
    }

    pub fn with_sub_task(mut self, sub_task: &str) -> Self {
        self.sub_task = Some(sub_task.to_string());
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

/// Subscriber invoked for every event. Returning an error only logs it.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) -> anyhow::Result<()> + Send + Sync>;

/// Fan-out of progress events to the subscribers of one workflow.
#[derive(Default)]
pub(crate) struct ProgressHub {
    callbacks: RwLock<Vec<ProgressCallback>>,
}

impl ProgressHub {
    pub(crate) fn subscribe(&self, callback: ProgressCallback) {
        match self.callbacks.write() {
            Ok(mut callbacks) => callbacks.push(callback),
            Err(poisoned) => poisoned.into_inner().push(callback),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        match self.callbacks.read() {
            Ok(callbacks) => callbacks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Deliver `event` to every subscriber. A subscriber that fails or
    /// panics is logged and skipped.
    pub(crate) fn emit(&self, event: &ProgressEvent) {
        // Clone the list so subscribers may register others without deadlocking.
        let callbacks: Vec<ProgressCallback> = match self.callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for (i, callback) in callbacks.iter().enumerate() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        workflow_id = %event.workflow_id,
                        subscriber = i,
                        error = %format!("{:#}", e),
                        "Progress callback failed"
                    );
                }
                Err(_) => {
                    warn!(
                        workflow_id = %event.workflow_id,
                        subscriber = i,
                        "Progress callback panicked"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event() -> ProgressEvent {
        ProgressEvent::new("wf", ProgressKind::StepStarted, 0, 2, WorkflowStatus::Running)
            .with_step("a", StepStatus::Running)
    }

    #[test]
    fn failing_and_panicking_callbacks_are_skipped() {
        let hub = ProgressHub::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        hub.subscribe(Arc::new(|_| anyhow::bail!("subscriber down")));
        hub.subscribe(Arc::new(|_| panic!("subscriber bug")));
        let sink = seen.clone();
        hub.subscribe(Arc::new(move |e| {
            sink.lock().unwrap().push(e.step_name.clone());
            Ok(())
        }));

        hub.emit(&event());
        hub.emit(&event());

        assert_eq!(hub.len(), 3);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn event_serializes_without_empty_fields() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["kind"], "step_started");
        assert_eq!(json["step_status"], "running");
        assert!(json.get("error").is_none());
        assert!(json.get("sub_task").is_none());
    }
}
