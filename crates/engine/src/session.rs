//! Remote endpoint sessions

use async_trait::async_trait;
use kite_common::{EndpointSpec, Negotiated};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Malformed remote address '{0}'")]
    BadAddress(String),

    #[error("No grid address configured for {0}")]
    NoAddress(String),

    #[error("Session creation failed for {endpoint}: {message}")]
    Creation { endpoint: String, message: String },

    #[error("Session command failed: {0}")]
    Command(String),

    #[error("Session already released")]
    Released,
}

/// A live remote-controlled endpoint
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    /// Version and platform reported by the grid
    fn negotiated(&self) -> Negotiated;

    async fn is_alive(&self) -> bool;

    async fn navigate(&self, url: &str) -> Result<(), SessionError>;

    /// Run a script in the page and return its JSON result
    async fn execute_script(&self, script: &str, args: Vec<Value>) -> Result<Value, SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Creates sessions against a grid
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(
        &self,
        endpoint: &EndpointSpec,
        test_name: &str,
    ) -> Result<Box<dyn Session>, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetState {
    Open,
    Released,
}

/// Sessions owned by one runner attempt.
///
/// Release happens at most once; sessions cannot be added afterwards.
pub struct SessionSet {
    sessions: Vec<Box<dyn Session>>,
    state: SetState,
    close_on_release: bool,
}

impl SessionSet {
    pub fn new(close_on_release: bool) -> Self {
        Self {
            sessions: Vec::new(),
            state: SetState::Open,
            close_on_release,
        }
    }

    pub fn push(&mut self, session: Box<dyn Session>) -> Result<(), SessionError> {
        if self.state == SetState::Released {
            return Err(SessionError::Released);
        }
        self.sessions.push(session);
        Ok(())
    }

    pub fn sessions(&self) -> &[Box<dyn Session>] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.state == SetState::Released
    }

    /// Close every session. Close errors are logged, not returned.
    pub async fn release(&mut self) -> usize {
        if self.state == SetState::Released {
            return 0;
        }
        self.state = SetState::Released;

        let count = self.sessions.len();
        for mut session in self.sessions.drain(..) {
            if !self.close_on_release {
                debug!("Leaving session {} open", session.id());
                continue;
            }
            match session.close().await {
                Ok(()) => debug!("Closed session {}", session.id()),
                Err(e) => warn!("Failed to close session {}: {}", session.id(), e),
            }
        }
        count
    }
}

impl Drop for SessionSet {
    fn drop(&mut self) {
        if self.state == SetState::Open && !self.sessions.is_empty() {
            warn!(
                "Dropping {} session(s) that were never released",
                self.sessions.len()
            );
        }
    }
}
