pub mod json_store;
pub mod memory_servers;
pub mod memory_store;
pub mod sql_servers;

use anyhow::Result;
use async_trait::async_trait;

use crate::engine::types::{WorkflowSnapshot, WorkflowStatus};

/// Persistence for workflow records.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Create or replace the record for `snapshot.id`.
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()>;

    /// Load a record; `None` when it does not exist.
    async fn load(&self, id: &str) -> Result<Option<WorkflowSnapshot>>;

    /// List records, optionally filtered by status, oldest first.
    async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowSnapshot>>;

    /// Delete a record. Deleting a missing record is not an error.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Persistence handle for the facts steps learn about servers
/// (addresses, serials, provisioning state).
#[async_trait]
pub trait ServerRepository: Send + Sync {
    /// Create the server record, merging `fields` into an existing one.
    async fn record_server(&self, server_id: &str, fields: &serde_json::Map<String, serde_json::Value>) -> Result<()>;

    /// Set one field, creating the record when missing.
    async fn update_server_field(&self, server_id: &str, key: &str, value: &serde_json::Value) -> Result<()>;

    async fn server_exists(&self, server_id: &str) -> Result<bool>;

    async fn get_server(&self, server_id: &str) -> Result<Option<serde_json::Map<String, serde_json::Value>>>;
}
