//! KITE Common Library
//!
//! Shared types, configuration and result storage for the KITE matrix engine.

pub mod config;
pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{
    select_remote, InstrumentationConfig, KiteConfig, RemoteBrowser, RemoteConfig, RemoteKind,
    RepeatInterval, ScenarioConfig, TestConfig, TestType, MAX_TUPLE_SIZE,
};
pub use db::ResultStore;
pub use error::{Error, Result};
pub use types::*;

/// KITE version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".kite")
}

/// Default results database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("results.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
