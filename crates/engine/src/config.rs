//! Environment-driven configuration.

use crate::store::{DatabaseConfig, DatabaseType};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    /// A `.env` file is honored when present.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Config::default();

        if let Ok(addr) = std::env::var("SERVER_ADDR") {
            config.server.addr = addr;
        }
        if let Ok(database_type) = std::env::var("DATABASE_TYPE") {
            config.database.database_type = DatabaseType::parse(&database_type)?;
        }
        if let Ok(path) = std::env::var("SQLITE_PATH") {
            config.database.sqlite_path = path;
        }
        if let Ok(max) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            config.database.max_connections = max.parse().map_err(|_| {
                Error::Config("DATABASE_MAX_CONNECTIONS must be a positive integer".to_string())
            })?;
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            database: DatabaseConfig::default(),
        }
    }
}
