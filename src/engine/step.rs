use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{debug, info, warn};

use crate::engine::context::WorkflowContext;
use crate::engine::types::RetryPolicy;
use crate::error::WorkflowError;

/// Default per-attempt timeout for a step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// The unit of work behind a step.
///
/// Implementations mutate the context in place and may return a result
/// value that is recorded on the step. Long-running actions should poll
/// [`WorkflowContext::is_cancelled`] and return [`WorkflowError::Cancelled`].
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn execute(&self, ctx: &mut WorkflowContext) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Outcome of running a step with its retry policy.
#[derive(Debug)]
pub struct StepOutcome {
    pub attempts: u32,
    pub result: Result<Option<serde_json::Value>, WorkflowError>,
}

/// A named, timeout-bounded, retryable unit of work within a workflow.
#[derive(Clone)]
pub struct WorkflowStep {
    name: String,
    description: String,
    action: Arc<dyn StepAction>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl WorkflowStep {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        action: impl StepAction + 'static,
    ) -> Self {
        Self::from_arc(name, description, Arc::new(action))
    }

    pub fn from_arc(
        name: impl Into<String>,
        description: impl Into<String>,
        action: Arc<dyn StepAction>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            action,
            timeout: DEFAULT_STEP_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry = RetryPolicy::new(retry_count, retry_delay);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Run the action at most `retry_count + 1` times, each attempt bounded
    /// by the step timeout. Cancellation stops the retry loop immediately.
    pub async fn execute(&self, ctx: &mut WorkflowContext) -> StepOutcome {
        let max_attempts = self.retry.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 && ctx.is_cancelled() {
                info!(step = %self.name, "Cancellation observed between attempts");
                return StepOutcome {
                    attempts: attempt - 1,
                    result: Err(WorkflowError::Cancelled),
                };
            }

            debug!(step = %self.name, attempt = attempt, max = max_attempts, "Running step attempt");

            let attempt_run = AssertUnwindSafe(self.action.execute(ctx)).catch_unwind();
            let result = match tokio::time::timeout(self.timeout, attempt_run).await {
                Ok(Ok(r)) => r,
                Ok(Err(panic)) => Err(anyhow::anyhow!("step panicked: {}", panic_message(panic.as_ref()))),
                Err(_) => Err(WorkflowError::StepTimeout {
                    step: self.name.clone(),
                    timeout: self.timeout,
                }
                .into()),
            };

            match result {
                Ok(value) => {
                    return StepOutcome {
                        attempts: attempt,
                        result: Ok(value),
                    };
                }
                Err(e) => {
                    if WorkflowError::is_cancellation(&e) || ctx.is_cancelled() {
                        info!(step = %self.name, attempt = attempt, "Step observed cancellation");
                        return StepOutcome {
                            attempts: attempt,
                            result: Err(WorkflowError::Cancelled),
                        };
                    }

                    let err_msg = format!("{:#}", e);
                    warn!(step = %self.name, attempt = attempt, error = %err_msg, "Step attempt failed");
                    last_error = err_msg;

                    if attempt < max_attempts {
                        debug!(step = %self.name, delay_ms = self.retry.retry_delay.as_millis() as u64, "Retrying after delay");
                        tokio::time::sleep(self.retry.retry_delay).await;
                    }
                }
            }
        }

        StepOutcome {
            attempts: max_attempts,
            result: Err(WorkflowError::StepExecution {
                step: self.name.clone(),
                attempts: max_attempts,
                message: last_error,
            }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

impl std::fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
