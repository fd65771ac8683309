//! Test scripts and their registry

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kite_common::{Phase, Tuple};
use serde_json::Value;
use thiserror::Error;

use crate::error::{EngineError, EngineResult};
use crate::builtin::{GetStatsScript, IceConnectionScript};
use crate::session::{Session, SessionError};

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("{0}")]
    Failed(String),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// What a script sees while it runs
pub struct ScriptContext<'a> {
    /// Sessions in tuple order
    pub sessions: &'a [Box<dyn Session>],
    pub payload: &'a Value,
    pub phase: Phase,
    pub tuple: &'a Tuple,
}

/// A user-supplied test body
#[async_trait]
pub trait TestScript: Send + Sync {
    async fn run(&self, ctx: ScriptContext<'_>) -> Result<Value, ScriptError>;
}

type Constructor = Arc<dyn Fn() -> Arc<dyn TestScript> + Send + Sync>;

/// Maps `testImpl` identifiers to script constructors
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    constructors: BTreeMap<String, Constructor>,
}

pub const ICE_CONNECTION: &str = "kite.ice-connection";
pub const GET_STATS: &str = "kite.get-stats";

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled WebRTC scripts
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ICE_CONNECTION, || Arc::new(IceConnectionScript));
        registry.register(GET_STATS, || Arc::new(GetStatsScript));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Arc<dyn TestScript> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn resolve(&self, name: &str) -> EngineResult<Arc<dyn TestScript>> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| EngineError::UnknownScript(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}
