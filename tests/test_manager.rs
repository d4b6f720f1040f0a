//! Tests for WorkflowManager: registry rules, background runs, cancellation
//! and persistence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use rackflow::clients::Collaborators;
use rackflow::engine::factory::{ProvisioningParams, StepDefaults, WorkflowFactory, WorkflowType};
use rackflow::engine::progress::ProgressKind;
use rackflow::engine::types::*;
use rackflow::engine::workflow::{CancelOutcome, Workflow};
use rackflow::engine::{StepAction, WorkflowContext, WorkflowManager, WorkflowStep};
use rackflow::error::WorkflowError;
use rackflow::storage::WorkflowStore;
use rackflow::storage::memory_store::MemoryWorkflowStore;

struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl StepAction for Gate {
    async fn execute(&self, _ctx: &mut WorkflowContext) -> anyhow::Result<Option<Value>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(None)
    }
}

struct Noop;

#[async_trait]
impl StepAction for Noop {
    async fn execute(&self, _ctx: &mut WorkflowContext) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }
}

struct AlwaysFails;

#[async_trait]
impl StepAction for AlwaysFails {
    async fn execute(&self, _ctx: &mut WorkflowContext) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("BMC unreachable")
    }
}

struct Explodes;

#[async_trait]
impl StepAction for Explodes {
    async fn execute(&self, _ctx: &mut WorkflowContext) -> anyhow::Result<Option<Value>> {
        panic!("sensor table corrupted");
    }
}

fn fast_defaults() -> StepDefaults {
    StepDefaults {
        timeout: Duration::from_secs(5),
        commission_timeout: Duration::from_secs(5),
        firmware_timeout: Duration::from_secs(5),
        retries: 0,
        retry_delay: Duration::from_millis(5),
        poll_interval: Duration::from_millis(5),
    }
}

fn manager() -> WorkflowManager {
    let factory = WorkflowFactory::new(Collaborators::in_memory()).with_defaults(fast_defaults());
    WorkflowManager::new(factory)
}

fn params(server_id: &str) -> ProvisioningParams {
    ProvisioningParams::new(server_id, "r650")
}

fn custom(id: &str, steps: Vec<WorkflowStep>) -> Workflow {
    let ctx = WorkflowContext::new("srv-custom", "r650", Collaborators::in_memory());
    Workflow::new(id, "custom", ctx, steps)
}

#[tokio::test]
async fn create_registers_in_creation_order() {
    let manager = manager();
    manager.create_standard_workflow("wf-b", params("srv-b")).await.unwrap();
    manager.create_bios_workflow("wf-a", params("srv-a")).await.unwrap();
    manager.create_ipmi_workflow("wf-c", params("srv-c")).await.unwrap();
    manager
        .create_firmware_first_workflow("wf-d", params("srv-d"))
        .await
        .unwrap();

    assert_eq!(manager.list_workflows().await, vec!["wf-b", "wf-a", "wf-c", "wf-d"]);

    let wf = manager.get_workflow("wf-a").await.unwrap();
    assert_eq!(wf.workflow_type(), "bios");
    assert_eq!(wf.server_id(), "srv-a");
    assert_eq!(wf.status(), WorkflowStatus::Pending);
    assert!(manager.get_workflow("missing").await.is_none());
}

#[tokio::test]
async fn duplicate_id_keeps_existing_entry() {
    let manager = manager();
    manager
        .create_workflow("wf-1", WorkflowType::Standard, params("srv-original"))
        .await
        .unwrap();

    let err = manager
        .create_workflow("wf-1", WorkflowType::IpmiSetup, params("srv-other"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::DuplicateWorkflowId(ref id) if id == "wf-1"));

    let err = manager
        .register_workflow(custom("wf-1", vec![WorkflowStep::new("noop", "noop", Noop)]))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::DuplicateWorkflowId(_)));

    let wf = manager.get_workflow("wf-1").await.unwrap();
    assert_eq!(wf.server_id(), "srv-original");
    assert_eq!(wf.workflow_type(), "standard");
    assert_eq!(manager.list_workflows().await.len(), 1);
}

#[tokio::test]
async fn create_by_name_rejects_unknown_types() {
    let manager = manager();
    let err = manager
        .create_workflow_by_name("wf-x", "raid", params("srv-x"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownWorkflowType(ref t) if t == "raid"));
    assert!(manager.list_workflows().await.is_empty());

    let wf = manager
        .create_workflow_by_name("wf-y", "firmware_first", params("srv-y"))
        .await
        .unwrap();
    assert_eq!(wf.steps().len(), 8);
}

#[tokio::test]
async fn unknown_ids_are_reported() {
    let manager = manager();
    assert!(matches!(
        manager.cancel_workflow("nope").await,
        Err(WorkflowError::WorkflowNotFound(_))
    ));
    assert!(matches!(
        manager.start_workflow("nope").await,
        Err(WorkflowError::WorkflowNotFound(_))
    ));
    assert!(matches!(
        manager.remove_workflow("nope").await,
        Err(WorkflowError::WorkflowNotFound(_))
    ));
    assert!(manager.get_snapshot("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn wf3_cancel_running_workflow_through_manager() {
    let manager = manager();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    manager
        .register_workflow(custom(
            "wf-3",
            vec![
                WorkflowStep::new(
                    "one",
                    "blocks",
                    Gate {
                        entered: entered.clone(),
                        release: release.clone(),
                    },
                ),
                WorkflowStep::new("two", "noop", Noop),
                WorkflowStep::new("three", "noop", Noop),
            ],
        ))
        .await
        .unwrap();

    let handle = manager.start_workflow("wf-3").await.unwrap();
    entered.notified().await;

    assert_eq!(manager.cancel_workflow("wf-3").await.unwrap(), CancelOutcome::Requested);
    release.notify_one();

    assert_eq!(handle.await.unwrap(), WorkflowStatus::Cancelled);

    let snap = manager.get_snapshot("wf-3").await.unwrap().unwrap();
    assert_eq!(snap.status, WorkflowStatus::Cancelled);
    assert_eq!(snap.step("two").unwrap().status, StepStatus::Skipped);
    assert_eq!(snap.step("three").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn active_workflows_are_exactly_pending_and_running() {
    let manager = manager();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    // pending
    manager
        .register_workflow(custom("pending", vec![WorkflowStep::new("noop", "noop", Noop)]))
        .await
        .unwrap();
    // running
    manager
        .register_workflow(custom(
            "running",
            vec![WorkflowStep::new(
                "gate",
                "blocks",
                Gate {
                    entered: entered.clone(),
                    release: release.clone(),
                },
            )],
        ))
        .await
        .unwrap();
    // completed
    manager
        .register_workflow(custom("completed", vec![WorkflowStep::new("noop", "noop", Noop)]))
        .await
        .unwrap();
    // failed
    manager
        .register_workflow(custom(
            "failed",
            vec![WorkflowStep::new("boom", "fails", AlwaysFails).with_retry(0, Duration::from_millis(1))],
        ))
        .await
        .unwrap();
    // cancelled
    manager
        .register_workflow(custom("cancelled", vec![WorkflowStep::new("noop", "noop", Noop)]))
        .await
        .unwrap();

    manager.run_workflow("completed").await.unwrap();
    manager.run_workflow("failed").await.unwrap();
    assert_eq!(manager.cancel_workflow("cancelled").await.unwrap(), CancelOutcome::Cancelled);
    let handle = manager.start_workflow("running").await.unwrap();
    entered.notified().await;

    let mut active: Vec<String> = manager
        .get_active_workflows()
        .await
        .iter()
        .map(|w| w.id().to_string())
        .collect();
    active.sort();
    assert_eq!(active, vec!["pending", "running"]);

    release.notify_one();
    handle.await.unwrap();
    let active: Vec<String> = manager
        .get_active_workflows()
        .await
        .iter()
        .map(|w| w.id().to_string())
        .collect();
    assert_eq!(active, vec!["pending"]);
}

#[tokio::test]
async fn failed_workflow_stays_queryable() {
    let manager = manager();
    manager
        .register_workflow(custom(
            "wf-fail",
            vec![
                WorkflowStep::new("ipmi", "fails", AlwaysFails).with_retry(1, Duration::from_millis(1)),
                WorkflowStep::new("after", "noop", Noop),
            ],
        ))
        .await
        .unwrap();

    let snap = manager.run_workflow("wf-fail").await.unwrap();
    assert_eq!(snap.status, WorkflowStatus::Failed);

    let snap = manager.get_snapshot("wf-fail").await.unwrap().unwrap();
    assert_eq!(snap.status, WorkflowStatus::Failed);
    assert_eq!(snap.failed_step.as_deref(), Some("ipmi"));
    assert!(snap.error.unwrap().contains("BMC unreachable"));
    assert_eq!(manager.list_workflows().await, vec!["wf-fail"]);
}

#[tokio::test]
async fn start_rejects_non_pending_workflows() {
    let manager = manager();
    manager
        .register_workflow(custom("wf-done", vec![WorkflowStep::new("noop", "noop", Noop)]))
        .await
        .unwrap();
    manager.run_workflow("wf-done").await.unwrap();

    let err = manager.start_workflow("wf-done").await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::InvalidState {
            status: WorkflowStatus::Completed,
            ..
        }
    ));
    assert!(matches!(
        manager.run_workflow("wf-done").await,
        Err(WorkflowError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let manager = manager();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    manager
        .register_workflow(custom(
            "wf-once",
            vec![WorkflowStep::new(
                "gate",
                "gate",
                Gate {
                    entered: entered.clone(),
                    release: release.clone(),
                },
            )],
        ))
        .await
        .unwrap();

    let handle = manager.start_workflow("wf-once").await.unwrap();
    // The second start is refused before the first run has even begun.
    assert!(matches!(
        manager.start_workflow("wf-once").await,
        Err(WorkflowError::AlreadyStarted(_))
    ));
    assert!(matches!(
        manager.run_workflow("wf-once").await,
        Err(WorkflowError::AlreadyStarted(_))
    ));

    entered.notified().await;
    assert!(matches!(
        manager.start_workflow("wf-once").await,
        Err(WorkflowError::InvalidState {
            status: WorkflowStatus::Running,
            ..
        })
    ));

    release.notify_one();
    assert_eq!(handle.await.unwrap(), WorkflowStatus::Completed);
    let snap = manager.get_snapshot("wf-once").await.unwrap().unwrap();
    assert_eq!(snap.steps[0].attempts, 1);
}

#[tokio::test]
async fn panicking_step_ends_a_background_run() {
    let manager = manager();
    manager
        .register_workflow(custom(
            "wf-panic",
            vec![
                WorkflowStep::new("explode", "explode", Explodes),
                WorkflowStep::new("noop", "noop", Noop),
            ],
        ))
        .await
        .unwrap();

    let handle = manager.start_workflow("wf-panic").await.unwrap();
    assert_eq!(handle.await.unwrap(), WorkflowStatus::Failed);

    let snap = manager.get_snapshot("wf-panic").await.unwrap().unwrap();
    assert!(snap.ended_at.is_some());
    assert_eq!(snap.step_statuses(), vec![StepStatus::Failed, StepStatus::Skipped]);
    assert!(snap.error.unwrap().contains("sensor table corrupted"));

    assert!(manager.get_active_workflows().await.is_empty());
    manager.remove_workflow("wf-panic").await.unwrap();
}

#[tokio::test]
async fn finished_workflows_are_persisted_and_removable() {
    let store = Arc::new(MemoryWorkflowStore::new());
    let factory = WorkflowFactory::new(Collaborators::in_memory()).with_defaults(fast_defaults());
    let manager = WorkflowManager::new(factory).with_store(store.clone());

    manager
        .create_ipmi_workflow("wf-ipmi", params("srv-ipmi"))
        .await
        .unwrap();
    let handle = manager.start_workflow("wf-ipmi").await.unwrap();
    assert_eq!(handle.await.unwrap(), WorkflowStatus::Completed);

    let stored = store.load("wf-ipmi").await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    assert_eq!(stored.server_id, "srv-ipmi");

    manager.remove_workflow("wf-ipmi").await.unwrap();
    assert!(manager.get_workflow("wf-ipmi").await.is_none());
    assert!(store.is_empty());
    assert!(manager.get_snapshot("wf-ipmi").await.unwrap().is_none());
}

#[tokio::test]
async fn snapshot_falls_back_to_the_store() {
    let store = Arc::new(MemoryWorkflowStore::new());
    let factory = WorkflowFactory::new(Collaborators::in_memory()).with_defaults(fast_defaults());

    // A record written by an earlier process.
    let earlier = WorkflowManager::new(factory.clone()).with_store(store.clone());
    earlier
        .create_bios_workflow("wf-old", params("srv-old"))
        .await
        .unwrap();
    earlier.run_workflow("wf-old").await.unwrap();

    let manager = WorkflowManager::new(factory).with_store(store.clone());
    assert!(manager.get_workflow("wf-old").await.is_none());
    let snap = manager.get_snapshot("wf-old").await.unwrap().unwrap();
    assert_eq!(snap.status, WorkflowStatus::Completed);
    assert_eq!(snap.workflow_type, "bios");

    manager.remove_workflow("wf-old").await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn active_workflows_cannot_be_removed() {
    let manager = manager();
    manager
        .create_standard_workflow("wf-pending", params("srv-1"))
        .await
        .unwrap();

    let err = manager.remove_workflow("wf-pending").await.unwrap_err();
    assert!(matches!(err, WorkflowError::WorkflowActive(_)));
    assert!(manager.get_workflow("wf-pending").await.is_some());

    manager.cancel_workflow("wf-pending").await.unwrap();
    manager.remove_workflow("wf-pending").await.unwrap();
    assert!(manager.list_workflows().await.is_empty());
}

#[tokio::test]
async fn broadcast_carries_every_workflow_event() {
    let manager = manager();
    let mut rx = manager.subscribe();

    manager
        .register_workflow(custom(
            "wf-events",
            vec![
                WorkflowStep::new("a", "noop", Noop),
                WorkflowStep::new("b", "noop", Noop),
            ],
        ))
        .await
        .unwrap();
    manager.run_workflow("wf-events").await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.workflow_id, "wf-events");
        kinds.push(event.kind);
    }
    assert_eq!(kinds.first(), Some(&ProgressKind::WorkflowStarted));
    assert_eq!(kinds.last(), Some(&ProgressKind::WorkflowFinished));
    assert_eq!(kinds.len(), 6);
}

#[tokio::test]
async fn concurrency_limit_queues_workflows() {
    let factory = WorkflowFactory::new(Collaborators::in_memory()).with_defaults(fast_defaults());
    let manager = WorkflowManager::new(factory).with_max_concurrent(1);
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    manager
        .register_workflow(custom(
            "first",
            vec![WorkflowStep::new(
                "gate",
                "blocks",
                Gate {
                    entered: entered.clone(),
                    release: release.clone(),
                },
            )],
        ))
        .await
        .unwrap();
    manager
        .register_workflow(custom("second", vec![WorkflowStep::new("noop", "noop", Noop)]))
        .await
        .unwrap();

    let first = manager.start_workflow("first").await.unwrap();
    entered.notified().await;
    let second = manager.start_workflow("second").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        manager.get_workflow("second").await.unwrap().status(),
        WorkflowStatus::Pending
    );

    // Cancelled while queued: never starts.
    assert_eq!(manager.cancel_workflow("second").await.unwrap(), CancelOutcome::Cancelled);
    release.notify_one();

    assert_eq!(first.await.unwrap(), WorkflowStatus::Completed);
    assert_eq!(second.await.unwrap(), WorkflowStatus::Cancelled);
}
