//! Execution of a single tuple
//!
//! A runner waits for its ramp-up slot, takes a worker slot, opens one
//! session per endpoint, runs the script through each phase, releases the
//! sessions and reports exactly one outcome. Session acquisition failures
//! hand a fresh attempt back to the scheduler while retries remain.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use kite_common::{Phase, TestOutcome, Tuple};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::context::RunContext;
use crate::coordination::PhaseTicket;
use crate::policy::RetryDecision;
use crate::reporter::{Position, ResultEnvelope};
use crate::script::ScriptContext;
use crate::session::{SessionError, SessionSet};

/// How a report reached the reporters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Delivered before the runner returned
    Synchronous,
    /// Handed to a background task
    Asynchronous,
}

/// Final record of one tuple
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub tuple_id: usize,
    pub index: usize,
    pub label: String,
    pub outcome: TestOutcome,
    pub time_taken_ms: u64,
    pub attempts: u32,
    pub delivery: DeliveryMode,
    pub envelope: Value,
}

/// Result of one runner invocation
pub enum RunnerOutcome {
    Completed(TestReport),
    /// Session acquisition failed; the contained runner is the next attempt
    Retry(TestRunner),
}

enum Acquisition {
    Ready,
    Terminated,
    Failed(SessionError),
}

pub struct TestRunner {
    ctx: Arc<RunContext>,
    tuple: Tuple,
    position: Position,
    attempt: u32,
    start_at: Instant,
    ticket: Option<PhaseTicket>,
}

impl TestRunner {
    pub fn new(
        ctx: Arc<RunContext>,
        tuple: Tuple,
        position: Position,
        batch_start: Instant,
    ) -> Self {
        let start_at = batch_start + ctx.ramp_up.delay_for(position.index);
        Self {
            ctx,
            tuple,
            position,
            attempt: 0,
            start_at,
            ticket: None,
        }
    }

    /// Attach this runner to the load barriers
    pub fn with_ticket(mut self, ticket: PhaseTicket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    pub fn index(&self) -> usize {
        self.position.index
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn tuple(&self) -> &Tuple {
        &self.tuple
    }

    pub fn is_first(&self) -> bool {
        self.position.is_first()
    }

    pub fn is_last(&self) -> bool {
        self.position.is_last()
    }

    /// Run this attempt to an outcome
    pub async fn call(self) -> RunnerOutcome {
        let span = info_span!(
            "runner",
            tuple = self.tuple.id,
            label = %self.tuple.label(),
            attempt = self.attempt
        );
        self.execute().instrument(span).await
    }

    /// Report the tuple as aborted without running it
    pub async fn abort(self, reason: impl Into<String>) -> TestReport {
        self.conclude(TestOutcome::Aborted(reason.into())).await
    }

    /// Report an outcome decided outside of `call`
    pub async fn conclude(self, outcome: TestOutcome) -> TestReport {
        self.finish(outcome, None).await
    }

    async fn execute(mut self) -> RunnerOutcome {
        let ctx = Arc::clone(&self.ctx);

        if self.attempt == 0 && !ctx.signals.sleep_until(self.start_at).await {
            return RunnerOutcome::Completed(self.abort("terminated before start").await);
        }

        let Some(permit) = ctx.pool.acquire(&ctx.signals).await else {
            return RunnerOutcome::Completed(
                self.abort("terminated while waiting for a worker").await,
            );
        };

        let started = Instant::now();
        let mut sessions = SessionSet::new(ctx.config.close_sessions);

        let outcome = match self.acquire_sessions(&mut sessions).await {
            Acquisition::Ready => {
                let outcome = self.run_phases(&sessions).await;
                sessions.release().await;
                outcome
            }
            Acquisition::Terminated => {
                sessions.release().await;
                TestOutcome::Aborted("terminated during session setup".to_string())
            }
            Acquisition::Failed(err) => {
                sessions.release().await;
                drop(permit);

                let decision = if ctx.signals.is_terminated() {
                    RetryDecision::GiveUp
                } else {
                    ctx.policy.decide(self.attempt)
                };
                if let RetryDecision::Retry { next_attempt } = decision {
                    warn!(
                        "Session setup failed, retrying ({}/{}): {}",
                        next_attempt,
                        ctx.policy.max_retry_count(),
                        err
                    );
                    return RunnerOutcome::Retry(self.into_attempt(next_attempt));
                }

                error!("Session setup failed after {} attempt(s): {}", self.attempt + 1, err);
                let outcome = TestOutcome::GridFailure(err.to_string());
                return RunnerOutcome::Completed(self.finish(outcome, Some(started)).await);
            }
        };
        drop(permit);

        RunnerOutcome::Completed(self.finish(outcome, Some(started)).await)
    }

    async fn acquire_sessions(&mut self, sessions: &mut SessionSet) -> Acquisition {
        let ctx = Arc::clone(&self.ctx);
        for endpoint in self.tuple.endpoints.iter_mut() {
            if ctx.signals.is_terminated() {
                return Acquisition::Terminated;
            }
            match ctx.factory.create(endpoint, &ctx.config.name).await {
                Ok(session) => {
                    debug!("Session {} ready for {}", session.id(), endpoint);
                    endpoint.negotiated = session.negotiated();
                    if let Err(e) = sessions.push(session) {
                        return Acquisition::Failed(e);
                    }
                }
                Err(e) => return Acquisition::Failed(e),
            }
        }
        Acquisition::Ready
    }

    async fn run_phases(&mut self, sessions: &SessionSet) -> TestOutcome {
        let ctx = Arc::clone(&self.ctx);
        let mut results = Map::new();

        for phase in ctx.phases.iter().copied() {
            if ctx.signals.is_terminated() {
                return TestOutcome::Aborted(format!("terminated before {} phase", phase));
            }

            if phase == Phase::LoadReached {
                if let Some(ticket) = self.ticket.as_mut() {
                    ticket.arrive();
                    let reached = ticket.coordinator().wait_load_reached(&ctx.signals).await;
                    if !reached {
                        return TestOutcome::Aborted(
                            "terminated while waiting for load".to_string(),
                        );
                    }
                }
            }

            debug!("Running {} phase", phase);
            let script = ctx.script.run(ScriptContext {
                sessions: sessions.sessions(),
                payload: &ctx.config.payload,
                phase,
                tuple: &self.tuple,
            });
            let guarded = AssertUnwindSafe(script).catch_unwind();

            match tokio::time::timeout(ctx.config.script_timeout(), guarded).await {
                Ok(Ok(Ok(value))) => {
                    results.insert(phase.name().to_string(), value);
                }
                Ok(Ok(Err(e))) => {
                    warn!("{} phase failed: {}", phase, e);
                    return TestOutcome::ScriptFailure(e.to_string());
                }
                Ok(Err(_)) => {
                    error!("Script panicked in {} phase", phase);
                    return TestOutcome::ScriptFailure(format!(
                        "script panicked in {} phase",
                        phase
                    ));
                }
                Err(_) => {
                    warn!("{} phase exceeded {:?}", phase, ctx.config.script_timeout());
                    return TestOutcome::ScriptFailure(format!(
                        "{} phase timed out after {}s",
                        phase, ctx.config.script_timeout_secs
                    ));
                }
            }
        }

        if let Some(ticket) = self.ticket.as_mut() {
            ticket.complete();
            if !ticket.coordinator().wait_done(&ctx.signals).await {
                info!("Terminated while holding sessions after steady state");
            }
        }

        // A single-phase run reports its phase result directly
        let payload = match (ctx.phases.as_slice(), results.len()) {
            ([_], 1) => results
                .into_iter()
                .next()
                .map(|(_, value)| value)
                .unwrap_or(Value::Null),
            _ => Value::Object(results),
        };
        TestOutcome::Success(payload)
    }

    fn into_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        for endpoint in self.tuple.endpoints.iter_mut() {
            endpoint.negotiated = Default::default();
        }
        self
    }

    /// Settle the load ticket, build the envelope and deliver it once
    async fn finish(mut self, outcome: TestOutcome, started: Option<Instant>) -> TestReport {
        if let Some(ticket) = self.ticket.as_mut() {
            ticket.settle();
        }

        let ctx = Arc::clone(&self.ctx);
        let time_taken_ms = started
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let envelope =
            ResultEnvelope::build(&ctx, &self.tuple, &outcome, time_taken_ms, self.position);
        let delivery = if self.is_first() || self.is_last() {
            DeliveryMode::Synchronous
        } else {
            DeliveryMode::Asynchronous
        };

        let report = TestReport {
            tuple_id: self.tuple.id,
            index: self.position.index,
            label: self.tuple.label(),
            outcome,
            time_taken_ms,
            attempts: self.attempt + 1,
            delivery,
            envelope: envelope.body.clone(),
        };

        // The first claim is the one the reporters see
        if let Some(claimed) = ctx.claim_report(&report) {
            warn!(
                "Tuple {} already reported as {}, dropping {}",
                self.tuple.id,
                claimed.outcome.kind(),
                report.outcome.kind()
            );
            return claimed;
        }

        match delivery {
            DeliveryMode::Synchronous => {
                if let Err(e) = ctx.reporter.deliver(&envelope, true).await {
                    warn!("Delivery of tuple {} failed: {}", self.tuple.id, e);
                }
            }
            DeliveryMode::Asynchronous => {
                ctx.deliveries.spawn(Arc::clone(&ctx.reporter), envelope);
            }
        }

        match &report.outcome {
            TestOutcome::Success(_) => {
                info!("Tuple {} passed in {}ms", self.tuple.id, time_taken_ms)
            }
            other => info!("Tuple {} ended with {}", self.tuple.id, other.kind()),
        }
        report
    }
}
