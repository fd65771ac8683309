//! Result envelopes and their delivery

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kite_common::{BatchSummary, ResultStore, TestOutcome, Tuple};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::error::{EngineError, EngineResult};
use crate::platform::{destination_json, extract_os_info, target_json};

/// Where a tuple sits in the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub index: usize,
    pub total: usize,
}

impl Position {
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }
}

/// One tuple's result, ready for delivery
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub run_id: String,
    pub tuple_id: usize,
    pub outcome: TestOutcome,
    pub time_taken_ms: u64,
    /// The JSON document sent to callbacks
    pub body: Value,
}

impl ResultEnvelope {
    pub fn build(
        ctx: &RunContext,
        tuple: &Tuple,
        outcome: &TestOutcome,
        time_taken_ms: u64,
        position: Position,
    ) -> Self {
        let os = outcome.message().and_then(extract_os_info);

        let mut body = Map::new();
        body.insert("test".into(), test_json(ctx));
        body.insert(
            "target".into(),
            Value::Array(tuple.iter().map(target_json).collect()),
        );
        body.insert(
            "destination".into(),
            Value::Array(
                tuple
                    .iter()
                    .map(|endpoint| destination_json(endpoint, os.as_ref()))
                    .collect(),
            ),
        );
        body.insert(
            "result".into(),
            json!({
                "timeTaken": time_taken_ms,
                "payload": outcome.payload(),
                "status": outcome.kind(),
            }),
        );

        if position.is_first() || position.is_last() {
            let mut meta = Map::new();
            if position.is_first() {
                meta.insert("totalTests".into(), json!(position.total));
            }
            if position.is_last() {
                meta.insert("lastTest".into(), json!(true));
            }
            meta.insert(
                "browsers".into(),
                Value::Array(ctx.endpoints.iter().map(target_json).collect()),
            );
            meta.insert("description".into(), json!(ctx.config.description));
            body.insert("meta".into(), Value::Object(meta));
        }

        Self {
            run_id: ctx.run_id.clone(),
            tuple_id: tuple.id,
            outcome: outcome.clone(),
            time_taken_ms,
            body: Value::Object(body),
        }
    }

    pub fn has_meta(&self) -> bool {
        self.body.get("meta").is_some()
    }
}

fn test_json(ctx: &RunContext) -> Value {
    let config = &ctx.config;
    let mut test = json!({
        "runId": ctx.run_id,
        "suite": ctx.suite,
        "name": config.name,
        "description": config.description,
        "type": if config.is_load_test() { "load" } else { "interop" },
        "testImpl": config.test_impl,
        "tupleSize": config.tuple_size,
        "noOfThreads": config.no_of_threads,
        "maxRetryCount": config.max_retry_count,
        "permute": config.permute,
        "payload": config.payload,
    });
    if let Some(scenario) = &ctx.scenario {
        test["networkScenario"] = json!(scenario);
    }
    test
}

/// Receives result envelopes
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn begin(&self, _run_id: &str, _test_name: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn deliver(&self, envelope: &ResultEnvelope, synchronous: bool) -> EngineResult<()>;

    /// Called once per run after every delivery has been attempted
    async fn finalize(&self, _summary: &BatchSummary) -> EngineResult<()> {
        Ok(())
    }
}

/// Posts envelopes to an HTTP callback
pub struct HttpCallbackReporter {
    client: reqwest::Client,
    url: String,
}

impl HttpCallbackReporter {
    pub fn new(url: impl Into<String>) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ResultReporter for HttpCallbackReporter {
    async fn deliver(&self, envelope: &ResultEnvelope, synchronous: bool) -> EngineResult<()> {
        debug!(
            "Posting tuple {} to {} ({})",
            envelope.tuple_id,
            self.url,
            if synchronous { "sync" } else { "async" }
        );
        let resp = self.client.post(&self.url).json(&envelope.body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Callback {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Persists envelopes and run summaries in the result store
pub struct ResultStoreReporter {
    store: ResultStore,
}

impl ResultStoreReporter {
    pub fn new(store: ResultStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ResultReporter for ResultStoreReporter {
    async fn begin(&self, run_id: &str, test_name: &str) -> EngineResult<()> {
        self.store.begin_run(run_id, test_name)?;
        Ok(())
    }

    async fn deliver(&self, envelope: &ResultEnvelope, _synchronous: bool) -> EngineResult<()> {
        let stored = self.store.record_result(
            &envelope.run_id,
            envelope.tuple_id,
            &envelope.outcome,
            envelope.time_taken_ms,
            &envelope.body,
        )?;
        if !stored {
            warn!(
                "Tuple {} of run {} was already stored",
                envelope.tuple_id, envelope.run_id
            );
        }
        Ok(())
    }

    async fn finalize(&self, summary: &BatchSummary) -> EngineResult<()> {
        self.store.finish_run(summary)?;
        Ok(())
    }
}

/// Collects envelopes and writes them to a JSON file when the run ends
pub struct JsonFileReporter {
    path: PathBuf,
    results: Mutex<Vec<(usize, Value)>>,
}

impl JsonFileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl ResultReporter for JsonFileReporter {
    async fn deliver(&self, envelope: &ResultEnvelope, _synchronous: bool) -> EngineResult<()> {
        self.results
            .lock()
            .push((envelope.tuple_id, envelope.body.clone()));
        Ok(())
    }

    async fn finalize(&self, summary: &BatchSummary) -> EngineResult<()> {
        let mut results = std::mem::take(&mut *self.results.lock());
        results.sort_by_key(|(tuple_id, _)| *tuple_id);

        let document = json!({
            "summary": summary,
            "results": results.into_iter().map(|(_, body)| body).collect::<Vec<_>>(),
        });

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(&document)?).await?;
        info!("Results written to {}", self.path.display());
        Ok(())
    }
}

/// Fans every call out to several reporters
#[derive(Default)]
pub struct CompositeReporter {
    reporters: Vec<Arc<dyn ResultReporter>>,
}

impl CompositeReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn ResultReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

/// Keep the first error, log the rest
fn first_error(results: Vec<EngineResult<()>>) -> EngineResult<()> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            if first.is_none() {
                first = Some(e);
            } else {
                warn!("Additional reporter error: {}", e);
            }
        }
    }
    first.map_or(Ok(()), Err)
}

#[async_trait]
impl ResultReporter for CompositeReporter {
    async fn begin(&self, run_id: &str, test_name: &str) -> EngineResult<()> {
        let mut results = Vec::with_capacity(self.reporters.len());
        for reporter in &self.reporters {
            results.push(reporter.begin(run_id, test_name).await);
        }
        first_error(results)
    }

    async fn deliver(&self, envelope: &ResultEnvelope, synchronous: bool) -> EngineResult<()> {
        let mut results = Vec::with_capacity(self.reporters.len());
        for reporter in &self.reporters {
            results.push(reporter.deliver(envelope, synchronous).await);
        }
        first_error(results)
    }

    async fn finalize(&self, summary: &BatchSummary) -> EngineResult<()> {
        let mut results = Vec::with_capacity(self.reporters.len());
        for reporter in &self.reporters {
            results.push(reporter.finalize(summary).await);
        }
        first_error(results)
    }
}

/// In-flight asynchronous deliveries of a run
#[derive(Default)]
pub struct DeliveryTracker {
    tasks: Mutex<JoinSet<()>>,
    finished: AtomicUsize,
}

impl DeliveryTracker {
    pub fn spawn(&self, reporter: Arc<dyn ResultReporter>, envelope: ResultEnvelope) {
        let mut tasks = self.tasks.lock();
        self.reap(&mut tasks);
        tasks.spawn(async move {
            if let Err(e) = reporter.deliver(&envelope, false).await {
                warn!("Delivery of tuple {} failed: {}", envelope.tuple_id, e);
            }
        });
    }

    /// Drop tasks that already finished
    fn reap(&self, tasks: &mut JoinSet<()>) {
        while let Some(joined) = tasks.try_join_next() {
            self.record(joined);
        }
    }

    fn record(&self, joined: Result<(), tokio::task::JoinError>) {
        match joined {
            Ok(()) => {
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => error!("Delivery task failed: {}", e),
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait for outstanding deliveries, abandoning whatever is left after
    /// `timeout`. Returns the number of deliveries finished so far.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                self.record(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!("Abandoning {} delivery task(s) still running", tasks.len());
            tasks.detach_all();
        }
        self.finished.load(Ordering::SeqCst)
    }
}
