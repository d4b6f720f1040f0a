pub mod context;
pub mod factory;
pub mod manager;
pub mod progress;
pub mod step;
pub mod types;
pub mod workflow;

pub use context::WorkflowContext;
pub use factory::{ProvisioningParams, StepDefaults, WorkflowFactory, WorkflowType};
pub use manager::WorkflowManager;
pub use progress::{ProgressCallback, ProgressEvent, ProgressKind};
pub use step::{StepAction, WorkflowStep};
pub use workflow::{CancelOutcome, Workflow};
