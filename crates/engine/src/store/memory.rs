//! In-memory store for tests and ephemeral deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::engine::ProcessInstance;
use crate::store::Store;
use crate::Result;

#[derive(Default)]
pub struct MemoryStore {
    definitions: RwLock<HashMap<String, ProcessDefinition>>,
    instances: RwLock<HashMap<Uuid, ProcessInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()> {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<ProcessDefinition>> {
        Ok(self.definitions.read().await.get(id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>> {
        let mut definitions: Vec<_> = self.definitions.read().await.values().cloned().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()> {
        self.instances
            .write()
            .await
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        Ok(self.instances.read().await.get(&id).cloned())
    }

    async fn list_instances(&self, definition_id: &str) -> Result<Vec<ProcessInstance>> {
        let mut instances: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|instance| instance.definition_id == definition_id)
            .cloned()
            .collect();
        instances.sort_by_key(|instance| instance.started_at);
        Ok(instances)
    }
}
