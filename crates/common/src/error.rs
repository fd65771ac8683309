//! Error types for KITE

use thiserror::Error;

/// Result type alias using the KITE common Error
pub type Result<T> = std::result::Result<T, Error>;

/// KITE error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing configuration field: {0}")]
    MissingField(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },
}

