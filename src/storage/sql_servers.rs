use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tokio::sync::Mutex;

use crate::storage::ServerRepository;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS servers (
    id TEXT PRIMARY KEY,
    fields TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const UPSERT: &str = "INSERT INTO servers (id, fields, updated_at) VALUES ($1, $2, $3)
    ON CONFLICT (id) DO UPDATE SET fields = excluded.fields, updated_at = excluded.updated_at";

/// Server records in a SQL database (SQLite by default, Postgres with the
/// `postgres` feature). Fields are stored as one JSON document per server.
pub struct SqlServerRepository {
    pool: AnyPool,
    /// Serializes read-modify-write cycles on the JSON document.
    write_lock: Mutex<()>,
}

impl SqlServerRepository {
    /// Connect and create the `servers` table if needed.
    pub async fn connect(url: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        // Every connection to `sqlite::memory:` is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .with_context(|| format!("Failed to connect to server database '{}'", url))?;

        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .context("Failed to create servers table")?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    async fn fetch(&self, server_id: &str) -> Result<Option<Map<String, Value>>> {
        let row = sqlx::query("SELECT fields FROM servers WHERE id = $1")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load server '{}'", server_id))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let fields: String = row.try_get("fields")?;
        let fields: Map<String, Value> = serde_json::from_str(&fields)
            .with_context(|| format!("Corrupt field document for server '{}'", server_id))?;
        Ok(Some(fields))
    }

    async fn store(&self, server_id: &str, fields: &Map<String, Value>) -> Result<()> {
        let document = serde_json::to_string(fields)?;
        sqlx::query(UPSERT)
            .bind(server_id)
            .bind(document)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to store server '{}'", server_id))?;
        Ok(())
    }
}

#[async_trait]
impl ServerRepository for SqlServerRepository {
    async fn record_server(&self, server_id: &str, fields: &Map<String, Value>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.fetch(server_id).await?.unwrap_or_default();
        for (k, v) in fields {
            record.insert(k.clone(), v.clone());
        }
        self.store(server_id, &record).await
    }

    async fn update_server_field(&self, server_id: &str, key: &str, value: &Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.fetch(server_id).await?.unwrap_or_default();
        record.insert(key.to_string(), value.clone());
        self.store(server_id, &record).await
    }

    async fn server_exists(&self, server_id: &str) -> Result<bool> {
        Ok(self.fetch(server_id).await?.is_some())
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<Map<String, Value>>> {
        self.fetch(server_id).await
    }
}
