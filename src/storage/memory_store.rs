use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;

use crate::engine::types::{WorkflowSnapshot, WorkflowStatus};
use crate::storage::WorkflowStore;

/// In-memory workflow store. Records live as long as the store instance.
pub struct MemoryWorkflowStore {
    records: Mutex<IndexMap<String, WorkflowSnapshot>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(IndexMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowSnapshot>> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowSnapshot>> {
        let mut records: Vec<WorkflowSnapshot> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.lock().unwrap().shift_remove(id);
        Ok(())
    }
}
