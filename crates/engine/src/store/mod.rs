pub mod config;
mod factory;
mod memory;
mod sqlite;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::create_store;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::engine::ProcessInstance;
use crate::Result;

/// Persistence boundary for definitions and instances. Everything the engine
/// needs to resume an instance is in the persisted documents.
#[async_trait]
pub trait Store: Send + Sync {
    /// Prepare backing storage (run migrations etc.).
    async fn init(&self) -> Result<()>;

    /// Insert or replace a definition by id.
    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()>;

    async fn get_definition(&self, id: &str) -> Result<Option<ProcessDefinition>>;

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>>;

    /// Insert or replace an instance by id.
    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()>;

    async fn get_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>>;

    async fn list_instances(&self, definition_id: &str) -> Result<Vec<ProcessInstance>>;
}
