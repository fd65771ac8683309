//! Mock grid, scripts and reporter shared by the engine integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kite_common::{BatchSummary, EndpointSpec, Negotiated, Phase, TestConfig};
use kite_engine::{
    EngineResult, ResultEnvelope, ResultReporter, RunContext, ScriptContext, ScriptError, Session,
    SessionError, SessionFactory, TestScript,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Grid double counting open sessions
#[derive(Default)]
pub struct MockGrid {
    pub open: AtomicUsize,
    pub max_open: AtomicUsize,
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    /// Endpoint name -> remaining failures; usize::MAX fails forever
    failures: Mutex<HashMap<String, usize>>,
    attempts: Mutex<HashMap<String, usize>>,
    created_at: Mutex<Vec<(String, Instant)>>,
    error_text: Mutex<Option<String>>,
}

impl MockGrid {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(self: &Arc<Self>, endpoint: &str, times: usize) -> Arc<Self> {
        self.failures.lock().insert(endpoint.to_string(), times);
        Arc::clone(self)
    }

    pub fn fail_forever(self: &Arc<Self>, endpoint: &str) -> Arc<Self> {
        self.fail(endpoint, usize::MAX)
    }

    pub fn with_error_text(self: &Arc<Self>, text: &str) -> Arc<Self> {
        *self.error_text.lock() = Some(text.to_string());
        Arc::clone(self)
    }

    pub fn attempts(&self, endpoint: &str) -> usize {
        self.attempts.lock().get(endpoint).copied().unwrap_or(0)
    }

    pub fn creation_times(&self) -> Vec<(String, Instant)> {
        self.created_at.lock().clone()
    }

    pub fn open_now(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }
}

pub struct MockFactory(pub Arc<MockGrid>);

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(
        &self,
        endpoint: &EndpointSpec,
        _test_name: &str,
    ) -> Result<Box<dyn Session>, SessionError> {
        let grid = &self.0;
        *grid.attempts.lock().entry(endpoint.name.clone()).or_insert(0) += 1;

        {
            let mut failures = grid.failures.lock();
            if let Some(remaining) = failures.get_mut(&endpoint.name) {
                if *remaining > 0 {
                    if *remaining != usize::MAX {
                        *remaining -= 1;
                    }
                    let message = grid
                        .error_text
                        .lock()
                        .clone()
                        .unwrap_or_else(|| "no matching node".to_string());
                    return Err(SessionError::Creation {
                        endpoint: endpoint.to_string(),
                        message,
                    });
                }
            }
        }

        let id = grid.created.fetch_add(1, Ordering::SeqCst);
        let open = grid.open.fetch_add(1, Ordering::SeqCst) + 1;
        grid.max_open.fetch_max(open, Ordering::SeqCst);
        grid.created_at
            .lock()
            .push((endpoint.name.clone(), Instant::now()));

        Ok(Box::new(MockSession {
            id: format!("session-{}", id),
            grid: Arc::clone(grid),
            negotiated: Negotiated {
                version: endpoint.version.as_ref().map(|v| format!("{}.0.1", v)),
                platform: Some("linux".to_string()),
            },
            closed: false,
        }))
    }
}

pub struct MockSession {
    id: String,
    grid: Arc<MockGrid>,
    negotiated: Negotiated,
    closed: bool,
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn negotiated(&self) -> Negotiated {
        self.negotiated.clone()
    }

    async fn is_alive(&self) -> bool {
        !self.closed
    }

    async fn navigate(&self, _url: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn execute_script(
        &self,
        _script: &str,
        _args: Vec<Value>,
    ) -> Result<Value, SessionError> {
        Ok(json!("connected"))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.closed {
            self.closed = true;
            self.grid.open.fetch_sub(1, Ordering::SeqCst);
            self.grid.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Sleeps, then succeeds with the phase name
pub struct SleepScript(pub Duration);

#[async_trait]
impl TestScript for SleepScript {
    async fn run(&self, ctx: ScriptContext<'_>) -> Result<Value, ScriptError> {
        tokio::time::sleep(self.0).await;
        Ok(json!({ "phase": ctx.phase.name(), "sessions": ctx.sessions.len() }))
    }
}

pub struct FailingScript;

#[async_trait]
impl TestScript for FailingScript {
    async fn run(&self, _ctx: ScriptContext<'_>) -> Result<Value, ScriptError> {
        Err(ScriptError::Assertion("video is frozen".to_string()))
    }
}

pub struct PanickingScript;

#[async_trait]
impl TestScript for PanickingScript {
    async fn run(&self, _ctx: ScriptContext<'_>) -> Result<Value, ScriptError> {
        panic!("script bug")
    }
}

/// Records (tuple, phase) in the order phases start
#[derive(Default)]
pub struct PhaseRecorder {
    pub events: Mutex<Vec<(usize, Phase)>>,
}

#[async_trait]
impl TestScript for PhaseRecorder {
    async fn run(&self, ctx: ScriptContext<'_>) -> Result<Value, ScriptError> {
        self.events.lock().push((ctx.tuple.id, ctx.phase));
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(json!(ctx.phase.name()))
    }
}

/// Reporter remembering every delivery
#[derive(Default)]
pub struct RecordingReporter {
    pub deliveries: Mutex<Vec<(usize, bool, Value)>>,
    pub finalized: Mutex<Vec<BatchSummary>>,
}

impl RecordingReporter {
    pub fn synchronous_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self
            .deliveries
            .lock()
            .iter()
            .filter(|(_, sync, _)| *sync)
            .map(|(id, _, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn delivered_ids(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.deliveries.lock().iter().map(|(id, _, _)| *id).collect();
        ids.sort();
        ids
    }

    pub fn body(&self, tuple_id: usize) -> Option<Value> {
        self.deliveries
            .lock()
            .iter()
            .find(|(id, _, _)| *id == tuple_id)
            .map(|(_, _, body)| body.clone())
    }
}

#[async_trait]
impl ResultReporter for RecordingReporter {
    async fn deliver(&self, envelope: &ResultEnvelope, synchronous: bool) -> EngineResult<()> {
        self.deliveries
            .lock()
            .push((envelope.tuple_id, synchronous, envelope.body.clone()));
        Ok(())
    }

    async fn finalize(&self, summary: &BatchSummary) -> EngineResult<()> {
        self.finalized.lock().push(summary.clone());
        Ok(())
    }
}

pub fn browsers(names: &[&str]) -> Vec<EndpointSpec> {
    names
        .iter()
        .map(|n| EndpointSpec::browser(*n).with_version("70").with_platform("LINUX"))
        .collect()
}

pub fn test_config(tuple_size: usize, threads: usize, retries: u32) -> TestConfig {
    let mut config = TestConfig::new("MatrixTest", "mock", tuple_size);
    config.no_of_threads = threads;
    config.max_retry_count = retries;
    config
}

pub fn context(
    config: TestConfig,
    grid: &Arc<MockGrid>,
    script: Arc<dyn TestScript>,
    reporter: &Arc<RecordingReporter>,
) -> RunContext {
    RunContext::new(
        config,
        Arc::new(MockFactory(Arc::clone(grid))),
        script,
        Arc::clone(reporter) as Arc<dyn ResultReporter>,
    )
}
