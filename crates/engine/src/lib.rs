pub mod config;
pub mod definition;
pub mod engine;
pub mod server;
pub mod store;

use thiserror::Error;
use uuid::Uuid;

pub use engine::resolver::ReferenceError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Definition not found: {0}")]
    DefinitionNotFound(String),
    #[error("Instance not found: {0}")]
    InstanceNotFound(Uuid),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
