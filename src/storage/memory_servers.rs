use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::storage::ServerRepository;

/// In-memory server records.
#[derive(Default)]
pub struct MemoryServerRepository {
    servers: Mutex<HashMap<String, Map<String, Value>>>,
}

impl MemoryServerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerRepository for MemoryServerRepository {
    async fn record_server(&self, server_id: &str, fields: &Map<String, Value>) -> Result<()> {
        let mut servers = self.servers.lock().unwrap();
        let record = servers.entry(server_id.to_string()).or_default();
        for (k, v) in fields {
            record.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn update_server_field(&self, server_id: &str, key: &str, value: &Value) -> Result<()> {
        self.servers
            .lock()
            .unwrap()
            .entry(server_id.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn server_exists(&self, server_id: &str) -> Result<bool> {
        Ok(self.servers.lock().unwrap().contains_key(server_id))
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<Map<String, Value>>> {
        Ok(self.servers.lock().unwrap().get(server_id).cloned())
    }
}
