//! Error types for the matrix engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Common(#[from] kite_common::Error),

    #[error("Unknown test implementation: {0}")]
    UnknownScript(String),

    #[error("Matrix of {endpoints} endpoint(s) in tuples of {tuple_size} exceeds {limit} tuples")]
    MatrixTooLarge {
        endpoints: usize,
        tuple_size: usize,
        limit: usize,
    },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Callback returned {status}: {body}")]
    Callback { status: u16, body: String },

    #[error("Reporting error: {0}")]
    Reporting(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
