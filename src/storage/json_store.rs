use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::engine::types::{WorkflowSnapshot, WorkflowStatus};
use crate::storage::WorkflowStore;

/// File-based JSON workflow store. Each workflow is stored as a separate JSON file.
pub struct JsonWorkflowStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonWorkflowStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            anyhow::bail!("Invalid workflow id for file store: '{}'", id);
        }
        Ok(self.base_dir.join(format!("{}.json", id)))
    }

    async fn read_record(path: &Path) -> Result<WorkflowSnapshot> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse workflow file: {}", path.display()))
    }
}

#[async_trait]
impl WorkflowStore for JsonWorkflowStore {
    async fn save(&self, snapshot: &WorkflowSnapshot) -> Result<()> {
        let _lock = self.lock.write().await;

        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .with_context(|| format!("Failed to create store dir: {}", self.base_dir.display()))?;

        let path = self.record_path(&snapshot.id)?;
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowSnapshot>> {
        let _lock = self.lock.read().await;
        let path = self.record_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).await.map(Some)
    }

    async fn list(&self, status_filter: Option<WorkflowStatus>) -> Result<Vec<WorkflowSnapshot>> {
        let _lock = self.lock.read().await;

        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(record) => {
                    if let Some(filter) = status_filter
                        && record.status != filter
                    {
                        continue;
                    }
                    records.push(record);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "Skipping unreadable workflow record"),
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.record_path(id)?;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
