//! Store round trips, against both backends through the factory.

use serde_json::json;

use jpel_engine::definition::ProcessDefinition;
use jpel_engine::engine::{InstanceStatus, ProcessInstance};
use jpel_engine::store::{create_store, DatabaseConfig, DatabaseType};

fn definition() -> ProcessDefinition {
    serde_json::from_value(json!({
        "id": "probe", "name": "Probe", "start": "a",
        "activities": {
            "a": { "type": "Compute", "script": "x = 1" }
        }
    }))
    .unwrap()
}

fn sqlite_memory() -> DatabaseConfig {
    DatabaseConfig {
        database_type: DatabaseType::Sqlite,
        sqlite_path: ":memory:".to_string(),
        max_connections: 1,
    }
}

fn memory() -> DatabaseConfig {
    DatabaseConfig {
        database_type: DatabaseType::Memory,
        ..DatabaseConfig::default()
    }
}

#[tokio::test]
async fn test_definition_round_trip() {
    for config in [memory(), sqlite_memory()] {
        let store = create_store(&config).await.unwrap();
        let definition = definition();

        store.save_definition(&definition).await.unwrap();
        let loaded = store.get_definition("probe").await.unwrap().unwrap();
        assert_eq!(loaded.id, "probe");
        assert_eq!(loaded.activities.len(), 1);

        assert!(store.get_definition("nope").await.unwrap().is_none());
        assert_eq!(store.list_definitions().await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_instance_save_is_an_upsert() {
    for config in [memory(), sqlite_memory()] {
        let store = create_store(&config).await.unwrap();
        let definition = definition();
        store.save_definition(&definition).await.unwrap();

        let mut instance = ProcessInstance::new(&definition);
        store.save_instance(&instance).await.unwrap();

        instance.status = InstanceStatus::Running;
        instance.variables.insert("x".into(), json!(1));
        store.save_instance(&instance).await.unwrap();

        let loaded = store.get_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert_eq!(loaded.variables.get("x"), Some(&json!(1)));

        let listed = store.list_instances("probe").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list_instances("other").await.unwrap().is_empty());
    }
}
