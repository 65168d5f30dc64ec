use std::sync::Arc;
use tracing::info;

use crate::store::{DatabaseConfig, DatabaseType, MemoryStore, SqliteStore, Store};
use crate::Result;

/// Build and initialize the store selected by configuration.
pub async fn create_store(config: &DatabaseConfig) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.database_type {
        DatabaseType::Memory => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
        DatabaseType::Sqlite => Arc::new(SqliteStore::new(config).await?),
    };
    store.init().await?;
    Ok(store)
}
