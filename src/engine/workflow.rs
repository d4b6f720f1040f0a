use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::engine::context::WorkflowContext;
use crate::engine::progress::{ProgressCallback, ProgressEvent, ProgressHub, ProgressKind};
use crate::engine::step::WorkflowStep;
use crate::engine::types::*;
use crate::error::{Result, WorkflowError};

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The workflow had not started and is now cancelled.
    Cancelled,
    /// The workflow is running; cancellation will be observed at the next
    /// step boundary or by a step polling the flag.
    Requested,
    /// The workflow was already in a terminal state; nothing changed.
    AlreadyFinished(WorkflowStatus),
}

struct WorkflowState {
    status: WorkflowStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    current_step_index: Option<usize>,
    current_sub_task: Option<String>,
    error: Option<String>,
    failed_step: Option<String>,
    steps: Vec<StepState>,
    /// Set once a runner has reserved the workflow.
    claimed: bool,
}

/// State shared between a workflow, its context and outside observers.
pub(crate) struct WorkflowShared {
    id: String,
    state: Mutex<WorkflowState>,
    cancelled: AtomicBool,
    hub: ProgressHub,
}

impl WorkflowShared {
    fn lock(&self) -> MutexGuard<'_, WorkflowState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn report_sub_task(&self, description: &str) {
        let event = {
            let mut state = self.lock();
            state.current_sub_task = Some(description.to_string());
            let total = state.steps.len();
            let index = state.current_step_index.unwrap_or(0);
            let mut event =
                ProgressEvent::new(&self.id, ProgressKind::SubTask, index, total, state.status)
                    .with_sub_task(description);
            if let Some(step) = state.steps.get(index) {
                event = event.with_step(&step.name, step.status);
            }
            event
        };
        self.hub.emit(&event);
    }
}

/// An ordered sequence of steps bound to one context.
///
/// The step list is fixed at construction. Observable state lives behind a
/// single lock so [`snapshot`](Self::snapshot) never sees `status`,
/// `ended_at` and `current_step_index` out of step with each other.
pub struct Workflow {
    id: String,
    workflow_type: String,
    server_id: String,
    device_type: String,
    steps: Vec<WorkflowStep>,
    shared: Arc<WorkflowShared>,
    context: tokio::sync::Mutex<Option<WorkflowContext>>,
}

impl Workflow {
    pub fn new(
        id: impl Into<String>,
        workflow_type: impl Into<String>,
        mut context: WorkflowContext,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        let id = id.into();
        let state = WorkflowState {
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            current_step_index: None,
            current_sub_task: None,
            error: None,
            failed_step: None,
            steps: steps
                .iter()
                .map(|s| StepState::new(s.name(), s.description()))
                .collect(),
            claimed: false,
        };
        let shared = Arc::new(WorkflowShared {
            id: id.clone(),
            state: Mutex::new(state),
            cancelled: AtomicBool::new(false),
            hub: ProgressHub::default(),
        });
        context.bind(shared.clone());

        Self {
            id,
            workflow_type: workflow_type.into(),
            server_id: context.server_id().to_string(),
            device_type: context.device_type().to_string(),
            steps,
            shared,
            context: tokio::sync::Mutex::new(Some(context)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.shared.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Wall-clock run time; up to now while the workflow is still running.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let state = self.shared.lock();
        let started = state.started_at?;
        Some(state.ended_at.unwrap_or_else(Utc::now) - started)
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let state = self.shared.lock();
        let current_step = state
            .current_step_index
            .and_then(|i| state.steps.get(i))
            .map(|s| s.name.clone());

        WorkflowSnapshot {
            id: self.id.clone(),
            workflow_type: self.workflow_type.clone(),
            server_id: self.server_id.clone(),
            device_type: self.device_type.clone(),
            status: state.status,
            created_at: state.created_at,
            started_at: state.started_at,
            ended_at: state.ended_at,
            current_step_index: state.current_step_index,
            current_step,
            current_sub_task: state.current_sub_task.clone(),
            error: state.error.clone(),
            failed_step: state.failed_step.clone(),
            steps: state.steps.clone(),
        }
    }

    /// Register a progress subscriber.
    pub fn subscribe(&self, callback: ProgressCallback) {
        self.shared.hub.subscribe(callback);
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProgressEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(callback));
    }

    /// The context's data bag. Waits for an in-flight run to finish.
    pub async fn context_data(&self) -> Option<HashMap<String, serde_json::Value>> {
        self.context
            .lock()
            .await
            .as_ref()
            .map(|ctx| ctx.data().clone())
    }

    /// Request cancellation.
    ///
    /// A pending workflow is cancelled at once. A running workflow has its
    /// flag set and stops at the next step boundary; an in-flight step is
    /// never interrupted. Terminal workflows are left untouched.
    pub fn cancel(&self) -> CancelOutcome {
        let event = {
            let mut state = self.shared.lock();
            match state.status {
                WorkflowStatus::Pending => {
                    self.shared.cancelled.store(true, Ordering::SeqCst);
                    state.status = WorkflowStatus::Cancelled;
                    state.ended_at = Some(Utc::now());
                    for step in state.steps.iter_mut() {
                        step.status = StepStatus::Skipped;
                    }
                    ProgressEvent::new(
                        &self.id,
                        ProgressKind::WorkflowFinished,
                        0,
                        state.steps.len(),
                        WorkflowStatus::Cancelled,
                    )
                }
                WorkflowStatus::Running => {
                    self.shared.cancelled.store(true, Ordering::SeqCst);
                    info!(workflow_id = %self.id, "Cancellation requested");
                    return CancelOutcome::Requested;
                }
                status => {
                    info!(workflow_id = %self.id, status = %status, "Cancel ignored, workflow already finished");
                    return CancelOutcome::AlreadyFinished(status);
                }
            }
        };

        info!(workflow_id = %self.id, "Pending workflow cancelled");
        self.shared.hub.emit(&event);
        CancelOutcome::Cancelled
    }

    /// Reserve a pending workflow for a single runner.
    ///
    /// A second claim fails with [`WorkflowError::AlreadyStarted`]; a
    /// workflow that is no longer pending fails with `InvalidState`.
    pub fn claim(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.status != WorkflowStatus::Pending {
            return Err(WorkflowError::InvalidState {
                id: self.id.clone(),
                status: state.status,
            });
        }
        if state.claimed {
            return Err(WorkflowError::AlreadyStarted(self.id.clone()));
        }
        state.claimed = true;
        Ok(())
    }

    /// Execute the steps in order and return the terminal status.
    ///
    /// Only a pending, unclaimed workflow may run. Step failures are
    /// recorded on the workflow rather than returned.
    pub async fn run(&self) -> Result<WorkflowStatus> {
        self.claim()?;
        self.run_claimed().await
    }

    /// Run a workflow reserved with [`claim`](Self::claim). Fails with
    /// `InvalidState` when it was cancelled in the meantime.
    pub(crate) async fn run_claimed(&self) -> Result<WorkflowStatus> {
        let total = self.steps.len();

        let started = {
            let mut state = self.shared.lock();
            if state.status != WorkflowStatus::Pending {
                return Err(WorkflowError::InvalidState {
                    id: self.id.clone(),
                    status: state.status,
                });
            }
            state.status = WorkflowStatus::Running;
            state.started_at = Some(Utc::now());
            state.current_step_index = Some(0);
            ProgressEvent::new(
                &self.id,
                ProgressKind::WorkflowStarted,
                0,
                total,
                WorkflowStatus::Running,
            )
        };

        let mut guard = self.context.lock().await;
        let Some(ctx) = guard.as_mut() else {
            let status = self.finish(WorkflowStatus::Failed, 0, Some("workflow context missing".to_string()), None);
            return Ok(status);
        };

        info!(workflow_id = %self.id, server_id = %self.server_id, steps = total, "Starting workflow");
        self.shared.hub.emit(&started);

        for (index, step) in self.steps.iter().enumerate() {
            if self.shared.is_cancelled() {
                info!(workflow_id = %self.id, next_step = %step.name(), "Cancellation observed at step boundary");
                return Ok(self.finish(WorkflowStatus::Cancelled, index, None, None));
            }

            let event = {
                let mut state = self.shared.lock();
                state.current_step_index = Some(index);
                state.current_sub_task = None;
                let step_state = &mut state.steps[index];
                step_state.status = StepStatus::Running;
                step_state.started_at = Some(Utc::now());
                ProgressEvent::new(
                    &self.id,
                    ProgressKind::StepStarted,
                    index,
                    total,
                    WorkflowStatus::Running,
                )
                .with_step(step.name(), StepStatus::Running)
            };
            info!(workflow_id = %self.id, step = %step.name(), index = index, total = total, "Running step");
            self.shared.hub.emit(&event);

            let outcome = step.execute(ctx).await;

            let (status, error) = match outcome.result {
                Ok(value) => {
                    let mut state = self.shared.lock();
                    // Reaching `total` is left to `finish` so it coincides with `Completed`.
                    if index + 1 < total {
                        state.current_step_index = Some(index + 1);
                    }
                    let step_state = &mut state.steps[index];
                    step_state.status = StepStatus::Completed;
                    step_state.attempts = outcome.attempts;
                    step_state.result = value;
                    step_state.finished_at = Some(Utc::now());
                    (StepStatus::Completed, None)
                }
                Err(e) => {
                    let message = match e {
                        WorkflowError::Cancelled => "cancelled".to_string(),
                        ref other => other.to_string(),
                    };
                    let mut state = self.shared.lock();
                    let step_state = &mut state.steps[index];
                    step_state.status = StepStatus::Failed;
                    step_state.attempts = outcome.attempts;
                    step_state.error = Some(message.clone());
                    step_state.finished_at = Some(Utc::now());
                    (StepStatus::Failed, Some(message))
                }
            };

            let event = ProgressEvent::new(
                &self.id,
                ProgressKind::StepFinished,
                index,
                total,
                WorkflowStatus::Running,
            )
            .with_step(step.name(), status)
            .with_error(error.clone());
            self.shared.hub.emit(&event);

            if let Some(message) = error {
                if self.shared.is_cancelled() {
                    info!(workflow_id = %self.id, step = %step.name(), "Step stopped by cancellation");
                    return Ok(self.finish(WorkflowStatus::Cancelled, index + 1, None, None));
                }
                error!(workflow_id = %self.id, step = %step.name(), error = %message, "Workflow failed");
                return Ok(self.finish(
                    WorkflowStatus::Failed,
                    index + 1,
                    Some(message),
                    Some(step.name().to_string()),
                ));
            }
        }

        Ok(self.finish(WorkflowStatus::Completed, total, None, None))
    }

    /// Move to a terminal status, skipping steps from `skip_from` on.
    fn finish(
        &self,
        status: WorkflowStatus,
        skip_from: usize,
        error: Option<String>,
        failed_step: Option<String>,
    ) -> WorkflowStatus {
        let event = {
            let mut state = self.shared.lock();
            state.status = status;
            state.ended_at = Some(Utc::now());
            state.current_sub_task = None;
            if status == WorkflowStatus::Completed {
                state.current_step_index = Some(state.steps.len());
            }
            for step in state.steps.iter_mut().skip(skip_from) {
                if step.status == StepStatus::Pending {
                    step.status = StepStatus::Skipped;
                }
            }
            state.error = error.clone();
            state.failed_step = failed_step.clone();

            let total = state.steps.len();
            let index = state.current_step_index.unwrap_or(0);
            let mut event =
                ProgressEvent::new(&self.id, ProgressKind::WorkflowFinished, index, total, status)
                    .with_error(error);
            if let Some(name) = failed_step {
                event = event.with_step(&name, StepStatus::Failed);
            }
            event
        };

        match status {
            WorkflowStatus::Completed => info!(workflow_id = %self.id, "Workflow completed"),
            WorkflowStatus::Cancelled => warn!(workflow_id = %self.id, "Workflow cancelled"),
            _ => {}
        }

        self.shared.hub.emit(&event);
        status
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("workflow_type", &self.workflow_type)
            .field("server_id", &self.server_id)
            .field("status", &self.status())
            .field("steps", &self.step_names())
            .finish()
    }
}
