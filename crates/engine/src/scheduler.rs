//! Batch scheduling of tuples
//!
//! Every tuple gets a runner task. A worker pool of `noOfThreads` slots bounds
//! how many hold sessions at once, and runners that fail to get sessions are
//! resubmitted immediately as fresh attempts. The batch ends when every tuple
//! has a report, on interrupt, or when the batch deadline passes; runners
//! still active at the deadline are abandoned and their tuples reported as
//! aborted.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use kite_common::{BatchSummary, RunState, TestOutcome, Tuple};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::coordination::LoadCoordinator;
use crate::error::{EngineError, EngineResult};
use crate::reporter::Position;
use crate::runner::{RunnerOutcome, TestReport, TestRunner};

type RunnerTasks = JoinSet<(usize, std::thread::Result<RunnerOutcome>)>;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs every tuple of one test
pub struct MatrixRunner {
    ctx: Arc<RunContext>,
    tuples: Vec<Tuple>,
    load: Option<Arc<LoadCoordinator>>,
    state: Mutex<RunState>,
    summary: Mutex<Option<BatchSummary>>,
    interrupted: AtomicBool,
    finalized: AtomicBool,
    drain_timeout: Duration,
}

impl MatrixRunner {
    pub fn new(ctx: RunContext, tuples: Vec<Tuple>) -> EngineResult<Self> {
        let load_test = ctx.config.is_load_test();

        // Load runners hold their slot until every runner reaches load
        if load_test && tuples.len() > ctx.pool.size() {
            return Err(EngineError::InvalidSchedule(format!(
                "{}: load test has {} runner(s) but noOfThreads is {}",
                ctx.config.name,
                tuples.len(),
                ctx.pool.size()
            )));
        }

        let load = load_test.then(|| LoadCoordinator::new(tuples.len()));
        Ok(Self {
            ctx: Arc::new(ctx),
            tuples,
            load,
            state: Mutex::new(RunState::Created),
            summary: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    /// Bound on waiting for background deliveries at the end of the run
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Summary of the finished run
    pub fn summary(&self) -> Option<BatchSummary> {
        self.summary.lock().clone()
    }

    /// Stop admitting runners and tell active ones to wind down
    pub fn interrupt(&self) {
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return;
            }
            info!("Interrupting run {}", self.ctx.run_id);
            *state = RunState::Interrupted;
        }
        self.ctx.signals.terminate();
        self.ctx.pool.shutdown();
    }

    /// Run the batch and return one report per tuple, in tuple order
    pub async fn run(&self) -> EngineResult<Vec<TestReport>> {
        {
            let mut state = self.state.lock();
            if *state != RunState::Created {
                return Err(EngineError::InvalidSchedule(format!(
                    "run {} is already {}",
                    self.ctx.run_id, state
                )));
            }
            *state = RunState::Running;
        }

        let ctx = Arc::clone(&self.ctx);
        let batch_start = Instant::now();

        if let Err(e) = ctx.reporter.begin(&ctx.run_id, &ctx.config.name).await {
            warn!("Reporter refused run {}: {}", ctx.run_id, e);
        }

        if self.tuples.is_empty() {
            info!("No test case was found for {}", ctx.config.name);
            return Ok(self.finish(Vec::new(), batch_start).await);
        }

        let total = self.tuples.len();
        info!(
            "Running {} tuple(s) of {} with {} worker(s)",
            total,
            ctx.config.name,
            ctx.pool.size()
        );

        let mut tasks = RunnerTasks::new();
        for (index, tuple) in self.tuples.iter().cloned().enumerate() {
            let mut runner =
                TestRunner::new(Arc::clone(&ctx), tuple, Position { index, total }, batch_start);
            if let Some(load) = &self.load {
                runner = runner.with_ticket(load.ticket());
            }
            spawn_runner(&mut tasks, runner);
        }

        let deadline = tokio::time::Instant::from_std(batch_start + ctx.config.batch_timeout());
        let mut awaiting_load = self.load.is_some();
        let mut reports = Vec::with_capacity(total);

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((_, Ok(RunnerOutcome::Completed(report)))) => reports.push(report),
                        Ok((_, Ok(RunnerOutcome::Retry(runner)))) => {
                            if ctx.signals.is_terminated() {
                                reports.push(runner.abort("terminated before retry").await);
                            } else {
                                debug!(
                                    "Resubmitting tuple {} (attempt {})",
                                    runner.tuple().id,
                                    runner.attempt() + 1
                                );
                                spawn_runner(&mut tasks, runner);
                            }
                        }
                        Ok((index, Err(_))) => {
                            error!("Runner for tuple {} panicked", index);
                            let outcome = TestOutcome::ScriptFailure("runner panicked".to_string());
                            reports.push(self.conclude(index, outcome, batch_start).await);
                        }
                        Err(e) => error!("Runner task failed: {}", e),
                    }
                }
                _ = all_completed(self.load.as_deref()), if awaiting_load => {
                    awaiting_load = false;
                    if let Some(load) = &self.load {
                        load.raise_done();
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "Batch deadline of {:?} reached with {} runner(s) active",
                        ctx.config.batch_timeout(),
                        tasks.len()
                    );
                    ctx.signals.terminate();
                    ctx.pool.shutdown();
                    tasks.detach_all();
                    break;
                }
            }
        }

        if reports.len() < total {
            let reason = if self.interrupted.load(Ordering::SeqCst) {
                "run interrupted"
            } else {
                "batch deadline reached"
            };
            let seen: HashSet<usize> = reports.iter().map(|r| r.index).collect();
            for index in (0..total).filter(|i| !seen.contains(i)) {
                let outcome = TestOutcome::Aborted(reason.to_string());
                reports.push(self.conclude(index, outcome, batch_start).await);
            }
        }

        Ok(self.finish(reports, batch_start).await)
    }

    /// Report a tuple whose runner never produced a result
    async fn conclude(
        &self,
        index: usize,
        outcome: TestOutcome,
        batch_start: Instant,
    ) -> TestReport {
        let position = Position {
            index,
            total: self.tuples.len(),
        };
        TestRunner::new(
            Arc::clone(&self.ctx),
            self.tuples[index].clone(),
            position,
            batch_start,
        )
        .conclude(outcome)
        .await
    }

    async fn finish(&self, mut reports: Vec<TestReport>, batch_start: Instant) -> Vec<TestReport> {
        reports.sort_by_key(|r| r.index);

        self.ctx.signals.terminate();
        self.ctx.pool.shutdown();

        let state = {
            let mut state = self.state.lock();
            if *state != RunState::Interrupted {
                *state = RunState::Completed;
            }
            *state
        };

        self.finalize(&reports, state, batch_start).await;
        reports
    }

    /// Drain deliveries and hand the summary to the reporter, once per run
    async fn finalize(&self, reports: &[TestReport], state: RunState, batch_start: Instant) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending = self.ctx.deliveries.pending();
        if pending > 0 {
            debug!("Waiting for {} delivery task(s)", pending);
        }
        self.ctx.deliveries.drain(self.drain_timeout).await;

        let mut summary = BatchSummary {
            run_id: self.ctx.run_id.clone(),
            test_name: self.ctx.config.name.clone(),
            state,
            ..Default::default()
        };
        for report in reports {
            summary.record(&report.outcome);
        }
        summary.duration_ms = batch_start.elapsed().as_millis() as u64;

        if let Err(e) = self.ctx.reporter.finalize(&summary).await {
            warn!("Finalizing run {} failed: {}", self.ctx.run_id, e);
        }

        info!(
            "{} {}: {}/{} passed, {} script failure(s), {} grid failure(s), {} aborted",
            self.ctx.config.name,
            state,
            summary.passed,
            summary.total,
            summary.script_failures,
            summary.grid_failures,
            summary.aborted
        );
        *self.summary.lock() = Some(summary);
    }
}

fn spawn_runner(tasks: &mut RunnerTasks, runner: TestRunner) {
    let index = runner.index();
    tasks.spawn(async move { (index, AssertUnwindSafe(runner.call()).catch_unwind().await) });
}

async fn all_completed(load: Option<&LoadCoordinator>) {
    match load {
        Some(load) => load.wait_all_completed().await,
        None => std::future::pending().await,
    }
}
