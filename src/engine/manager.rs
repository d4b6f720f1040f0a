use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{RwLock, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::factory::{ProvisioningParams, WorkflowFactory, WorkflowType};
use crate::engine::progress::ProgressEvent;
use crate::engine::types::{WorkflowSnapshot, WorkflowStatus};
use crate::engine::workflow::{CancelOutcome, Workflow};
use crate::error::{Result, WorkflowError};
use crate::storage::WorkflowStore;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Registry of workflows for one process.
///
/// Workflows stay registered after they finish until explicitly removed.
/// Lookups clone the `Arc<Workflow>` and release the registry lock before
/// running or cancelling anything.
pub struct WorkflowManager {
    workflows: RwLock<IndexMap<String, Arc<Workflow>>>,
    factory: WorkflowFactory,
    store: Option<Arc<dyn WorkflowStore>>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<ProgressEvent>,
}

impl WorkflowManager {
    pub fn new(factory: WorkflowFactory) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            workflows: RwLock::new(IndexMap::new()),
            factory,
            store: None,
            permits: Arc::new(Semaphore::new(num_cpus::get())),
            events,
        }
    }

    /// Persist a snapshot of every workflow that finishes.
    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Limit how many workflows run at the same time.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn factory(&self) -> &WorkflowFactory {
        &self.factory
    }

    pub fn store(&self) -> Option<&Arc<dyn WorkflowStore>> {
        self.store.as_ref()
    }

    /// Receive the progress events of every registered workflow.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    // --- creation ---

    pub async fn create_workflow(
        &self,
        id: &str,
        workflow_type: WorkflowType,
        params: ProvisioningParams,
    ) -> Result<Arc<Workflow>> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(id) {
            return Err(WorkflowError::DuplicateWorkflowId(id.to_string()));
        }
        let workflow = Arc::new(self.factory.build(id, workflow_type, params));
        self.forward_events(&workflow);
        workflows.insert(id.to_string(), workflow.clone());

        info!(workflow_id = %id, workflow_type = %workflow_type, server_id = %workflow.server_id(), "Workflow created");
        Ok(workflow)
    }

    pub async fn create_workflow_by_name(
        &self,
        id: &str,
        type_name: &str,
        params: ProvisioningParams,
    ) -> Result<Arc<Workflow>> {
        let workflow_type: WorkflowType = type_name.parse()?;
        self.create_workflow(id, workflow_type, params).await
    }

    /// Register a workflow built outside the factory.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<Arc<Workflow>> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(workflow.id()) {
            return Err(WorkflowError::DuplicateWorkflowId(workflow.id().to_string()));
        }
        let workflow = Arc::new(workflow);
        self.forward_events(&workflow);
        workflows.insert(workflow.id().to_string(), workflow.clone());

        info!(workflow_id = %workflow.id(), steps = workflow.steps().len(), "Workflow registered");
        Ok(workflow)
    }

    pub async fn create_standard_workflow(&self, id: &str, params: ProvisioningParams) -> Result<Arc<Workflow>> {
        self.create_workflow(id, WorkflowType::Standard, params).await
    }

    pub async fn create_firmware_first_workflow(
        &self,
        id: &str,
        params: ProvisioningParams,
    ) -> Result<Arc<Workflow>> {
        self.create_workflow(id, WorkflowType::FirmwareFirst, params).await
    }

    pub async fn create_bios_workflow(&self, id: &str, params: ProvisioningParams) -> Result<Arc<Workflow>> {
        self.create_workflow(id, WorkflowType::BiosConfiguration, params).await
    }

    pub async fn create_ipmi_workflow(&self, id: &str, params: ProvisioningParams) -> Result<Arc<Workflow>> {
        self.create_workflow(id, WorkflowType::IpmiSetup, params).await
    }

    // --- queries ---

    pub async fn get_workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().await.get(id).cloned()
    }

    /// Snapshot of a registered workflow, or its stored record once it is
    /// no longer registered.
    pub async fn get_snapshot(&self, id: &str) -> Result<Option<WorkflowSnapshot>> {
        if let Some(workflow) = self.get_workflow(id).await {
            return Ok(Some(workflow.snapshot()));
        }
        match self.store {
            Some(ref store) => store
                .load(id)
                .await
                .map_err(|e| WorkflowError::Store(format!("{:#}", e))),
            None => Ok(None),
        }
    }

    /// Ids of all registered workflows, in creation order.
    pub async fn list_workflows(&self) -> Vec<String> {
        self.workflows.read().await.keys().cloned().collect()
    }

    pub async fn list_snapshots(&self) -> Vec<WorkflowSnapshot> {
        let workflows: Vec<Arc<Workflow>> = self.workflows.read().await.values().cloned().collect();
        workflows.iter().map(|w| w.snapshot()).collect()
    }

    /// Workflows that are pending or running.
    pub async fn get_active_workflows(&self) -> Vec<Arc<Workflow>> {
        self.workflows
            .read()
            .await
            .values()
            .filter(|w| w.is_active())
            .cloned()
            .collect()
    }

    // --- control ---

    pub async fn cancel_workflow(&self, id: &str) -> Result<CancelOutcome> {
        let workflow = self.lookup(id).await?;
        let outcome = workflow.cancel();
        if outcome == CancelOutcome::Cancelled {
            persist(self.store.as_ref(), &workflow).await;
        }
        Ok(outcome)
    }

    /// Run a pending workflow on its own task.
    ///
    /// The task waits for a concurrency permit first; a workflow cancelled
    /// while waiting never starts. The handle yields the final status.
    pub async fn start_workflow(&self, id: &str) -> Result<JoinHandle<WorkflowStatus>> {
        let workflow = self.lookup(id).await?;
        workflow.claim()?;

        let permits = self.permits.clone();
        let store = self.store.clone();
        info!(workflow_id = %id, "Starting workflow in background");

        Ok(tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(workflow_id = %workflow.id(), "Concurrency limiter closed, workflow not started");
                    return workflow.status();
                }
            };
            let status = match workflow.run_claimed().await {
                Ok(status) => status,
                Err(e) => {
                    info!(workflow_id = %workflow.id(), error = %e, "Workflow not run");
                    workflow.status()
                }
            };
            persist(store.as_ref(), &workflow).await;
            status
        }))
    }

    /// Run a pending workflow to completion on the current task.
    pub async fn run_workflow(&self, id: &str) -> Result<WorkflowSnapshot> {
        let workflow = self.lookup(id).await?;
        workflow.claim()?;
        // The semaphore is never closed; run unthrottled if it ever is.
        let _permit = self.permits.acquire().await.ok();
        workflow.run_claimed().await?;
        persist(self.store.as_ref(), &workflow).await;
        Ok(workflow.snapshot())
    }

    /// Drop a finished workflow from the registry and the store.
    pub async fn remove_workflow(&self, id: &str) -> Result<()> {
        let removed = {
            let mut workflows = self.workflows.write().await;
            match workflows.get(id) {
                Some(w) if w.is_active() => return Err(WorkflowError::WorkflowActive(id.to_string())),
                Some(_) => workflows.shift_remove(id).is_some(),
                None => false,
            }
        };

        let Some(ref store) = self.store else {
            if !removed {
                return Err(WorkflowError::WorkflowNotFound(id.to_string()));
            }
            info!(workflow_id = %id, "Workflow removed");
            return Ok(());
        };

        let stored = store
            .load(id)
            .await
            .map_err(|e| WorkflowError::Store(format!("{:#}", e)))?;
        if !removed && stored.is_none() {
            return Err(WorkflowError::WorkflowNotFound(id.to_string()));
        }
        if stored.is_some() {
            store
                .delete(id)
                .await
                .map_err(|e| WorkflowError::Store(format!("{:#}", e)))?;
        }
        info!(workflow_id = %id, "Workflow removed");
        Ok(())
    }

    async fn lookup(&self, id: &str) -> Result<Arc<Workflow>> {
        self.get_workflow(id)
            .await
            .ok_or_else(|| WorkflowError::WorkflowNotFound(id.to_string()))
    }

    fn forward_events(&self, workflow: &Workflow) {
        let events = self.events.clone();
        workflow.on_progress(move |event| {
            // No receivers is not an error.
            let _ = events.send(event.clone());
            Ok(())
        });
    }
}

async fn persist(store: Option<&Arc<dyn WorkflowStore>>, workflow: &Workflow) {
    let Some(store) = store else {
        return;
    };
    if let Err(e) = store.save(&workflow.snapshot()).await {
        warn!(workflow_id = %workflow.id(), error = %format!("{:#}", e), "Failed to persist workflow snapshot");
    }
}
