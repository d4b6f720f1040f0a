use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::clients::{
    Collaborators, CommissioningClient, RemoteConfigClient, RemoteTarget,
};
use crate::engine::types::RackLocation;
use crate::engine::workflow::WorkflowShared;
use crate::error::WorkflowError;
use crate::storage::ServerRepository;

/// Data key under which the discover step stores the server's address.
pub const IP_ADDRESS_KEY: &str = "ip_address";

/// Mutable execution state threaded through every step of one workflow run.
///
/// The context is owned by exactly one workflow. Steps read the outputs of
/// earlier steps from the data bag, surface fine-grained progress with
/// [`report_sub_task`](Self::report_sub_task) and poll
/// [`is_cancelled`](Self::is_cancelled) at safe points.
pub struct WorkflowContext {
    server_id: String,
    device_type: String,
    target_address: Option<String>,
    rack_location: Option<RackLocation>,
    data: HashMap<String, serde_json::Value>,
    clients: Collaborators,
    link: Option<Arc<WorkflowShared>>,
}

impl WorkflowContext {
    pub fn new(
        server_id: impl Into<String>,
        device_type: impl Into<String>,
        clients: Collaborators,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            device_type: device_type.into(),
            target_address: None,
            rack_location: None,
            data: HashMap::new(),
            clients,
            link: None,
        }
    }

    pub fn with_target_address(mut self, address: impl Into<String>) -> Self {
        self.target_address = Some(address.into());
        self
    }

    pub fn with_rack_location(mut self, location: RackLocation) -> Self {
        self.rack_location = Some(location);
        self
    }

    /// Attach the context to the workflow that owns it.
    pub(crate) fn bind(&mut self, shared: Arc<WorkflowShared>) {
        self.link = Some(shared);
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn target_address(&self) -> Option<&str> {
        self.target_address.as_deref()
    }

    pub fn rack_location(&self) -> Option<&RackLocation> {
        self.rack_location.as_ref()
    }

    // --- data bag ---

    /// Store a value for later steps. Existing keys are overwritten.
    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn get_data(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Typed read that falls back to `default` when the key is missing or
    /// holds a value of another shape.
    pub fn get_data_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn remove_data(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    // --- progress and cancellation ---

    /// Set the workflow's current sub-task and notify its subscribers.
    pub fn report_sub_task(&self, description: impl Into<String>) {
        let description = description.into();
        debug!(server_id = %self.server_id, sub_task = %description, "Sub-task");
        if let Some(ref link) = self.link {
            link.report_sub_task(&description);
        }
    }

    /// Non-blocking check of the cooperative cancellation flag.
    pub fn is_cancelled(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_cancelled())
    }

    pub fn ensure_not_cancelled(&self) -> Result<(), WorkflowError> {
        if self.is_cancelled() {
            Err(WorkflowError::Cancelled)
        } else {
            Ok(())
        }
    }

    // --- collaborators ---

    pub fn clients(&self) -> &Collaborators {
        &self.clients
    }

    pub fn commissioning(&self) -> &dyn CommissioningClient {
        self.clients.commissioning.as_ref()
    }

    pub fn bios(&self) -> &dyn RemoteConfigClient {
        self.clients.bios.as_ref()
    }

    pub fn bmc(&self) -> &dyn RemoteConfigClient {
        self.clients.bmc.as_ref()
    }

    pub fn firmware(&self) -> &dyn RemoteConfigClient {
        self.clients.firmware.as_ref()
    }

    pub fn servers(&self) -> &dyn ServerRepository {
        self.clients.servers.as_ref()
    }

    /// Address used by the remote configuration clients: the explicit target
    /// address, otherwise the address found by discovery.
    pub fn remote_target(&self) -> Result<RemoteTarget> {
        let address = self
            .target_address
            .clone()
            .or_else(|| self.get_str(IP_ADDRESS_KEY).map(str::to_string))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No target address for server '{}': none given and none discovered",
                    self.server_id
                )
            })?;

        Ok(RemoteTarget {
            address,
            device_type: self.device_type.clone(),
        })
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("server_id", &self.server_id)
            .field("device_type", &self.device_type)
            .field("target_address", &self.target_address)
            .field("rack_location", &self.rack_location)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}
