//! SQLite-backed store. Definitions and instances are persisted as JSON
//! documents with a few extracted columns for querying.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::engine::ProcessInstance;
use crate::store::{DatabaseConfig, Store};
use crate::Result;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let in_memory = config.sqlite_path == ":memory:";
        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.sqlite_path)
                .create_if_missing(true)
        };

        // A shared in-memory database only exists on one connection.
        let max_connections = if in_memory { 1 } else { config.max_connections };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!("Connected to SQLite database at {}", config.sqlite_path);
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()> {
        let document = serde_json::to_string(definition)?;
        sqlx::query(
            r#"
            INSERT INTO definitions (id, version, name, document, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                name = excluded.name,
                document = excluded.document
            "#,
        )
        .bind(&definition.id)
        .bind(&definition.version)
        .bind(&definition.name)
        .bind(&document)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<ProcessDefinition>> {
        let row = sqlx::query("SELECT document FROM definitions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let document: String = row.get("document");
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>> {
        let rows = sqlx::query("SELECT document FROM definitions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let document: String = row.get("document");
                Ok(serde_json::from_str(&document)?)
            })
            .collect()
    }

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()> {
        let document = serde_json::to_string(instance)?;
        sqlx::query(
            r#"
            INSERT INTO instances (id, definition_id, status, document, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                document = excluded.document,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.definition_id)
        .bind(instance.status.to_string())
        .bind(&document)
        .bind(instance.started_at.to_rfc3339())
        .bind(instance.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let row = sqlx::query("SELECT document FROM instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let document: String = row.get("document");
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }

    async fn list_instances(&self, definition_id: &str) -> Result<Vec<ProcessInstance>> {
        let rows = sqlx::query(
            "SELECT document FROM instances WHERE definition_id = ? ORDER BY started_at",
        )
        .bind(definition_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let document: String = row.get("document");
                Ok(serde_json::from_str(&document)?)
            })
            .collect()
    }
}
