use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    Sqlite,
    Memory,
}

impl DatabaseType {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "sqlite" => Ok(DatabaseType::Sqlite),
            "memory" => Ok(DatabaseType::Memory),
            other => Err(Error::Config(format!(
                "unsupported database type '{}', expected 'sqlite' or 'memory'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_type: DatabaseType,
    pub sqlite_path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_type: DatabaseType::Sqlite,
            sqlite_path: "jpel.db".to_string(),
            max_connections: 5,
        }
    }
}
