//! Run Command

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use kite_common::{BatchSummary, KiteConfig, RepeatInterval, ResultStore, RunState, TestConfig};
use kite_engine::{
    tuples_for, CompositeReporter, HttpCallbackReporter, JsonFileReporter, MatrixRunner,
    NetworkInstrumentation, ResultReporter, ResultStoreReporter, RunContext, ScriptRegistry,
    SessionFactory, TestReport, WebDriverConfig, WebDriverSessionFactory,
};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::output::{
    print_info, print_item, print_list, print_success, print_warning, status_cell, OutputFormat,
    TableDisplay,
};

#[derive(Args)]
pub struct RunArgs {
    /// Config file (JSON or YAML)
    pub config: PathBuf,

    /// Only run the named test
    #[arg(short, long)]
    pub test: Option<String>,

    /// Grid hub overriding the config's remoteAddress
    #[arg(long, env = "KITE_GRID")]
    pub grid: Option<String>,

    /// Directory for JSON result files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Do not record results in the database
    #[arg(long)]
    pub no_store: bool,

    /// Repeat the whole config HOURLY, DAILY or WEEKLY (overrides the config)
    #[arg(long)]
    pub interval: Option<RepeatInterval>,

    /// Stop repeating after this many jobs
    #[arg(long)]
    pub max_jobs: Option<usize>,
}

/// Per-tuple row of a run
#[derive(Serialize)]
pub struct ReportDisplay {
    pub tuple: usize,
    pub label: String,
    pub status: String,
    pub attempts: u32,
    pub time_taken_ms: u64,
    pub detail: String,
}

impl From<&TestReport> for ReportDisplay {
    fn from(report: &TestReport) -> Self {
        Self {
            tuple: report.tuple_id,
            label: report.label.clone(),
            status: report.outcome.kind().to_string(),
            attempts: report.attempts,
            time_taken_ms: report.time_taken_ms,
            detail: report.outcome.message().unwrap_or_default().to_string(),
        }
    }
}

impl TableDisplay for ReportDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Tuple", "Endpoints", "Status", "Attempts", "Time", "Detail"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.tuple.to_string(),
            self.label.clone(),
            status_cell(&self.status),
            self.attempts.to_string(),
            format!("{}ms", self.time_taken_ms),
            self.detail.chars().take(80).collect(),
        ]
    }
}

#[derive(Serialize)]
pub struct SummaryDisplay(pub BatchSummary);

impl TableDisplay for SummaryDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "Run", "Test", "State", "Total", "Passed", "Script", "Grid", "Aborted", "Duration",
        ]
    }

    fn row(&self) -> Vec<String> {
        let s = &self.0;
        vec![
            s.run_id.clone(),
            s.test_name.clone(),
            s.state.to_string(),
            s.total.to_string(),
            s.passed.to_string(),
            s.script_failures.to_string(),
            s.grid_failures.to_string(),
            s.aborted.to_string(),
            format!("{:.1}s", s.duration_ms as f64 / 1000.0),
        ]
    }
}

/// Reporter stack for one test
fn reporters(
    config: &KiteConfig,
    test: &TestConfig,
    store: Option<&ResultStore>,
    output: Option<&PathBuf>,
    run_id: &str,
) -> Result<Arc<dyn ResultReporter>> {
    let mut composite = CompositeReporter::new();

    if let Some(store) = store {
        composite = composite.with(Arc::new(ResultStoreReporter::new(store.clone())));
    }
    if let Some(url) = config.callback_for(test) {
        info!("Posting results of {} to {}", test.name, url);
        composite = composite.with(Arc::new(HttpCallbackReporter::new(url)?));
    }
    if let Some(dir) = output {
        let path = dir.join(format!("{}.json", run_id));
        composite = composite.with(Arc::new(JsonFileReporter::new(path)));
    }
    Ok(Arc::new(composite))
}

/// Outcome of one pass over the selected tests
#[derive(Default)]
struct JobOutcome {
    failed: usize,
    interrupted: bool,
}

/// One job: every network scenario, each wrapped around a pass over the tests
struct Job<'a> {
    config: &'a KiteConfig,
    tests: Vec<&'a TestConfig>,
    store: Option<&'a ResultStore>,
    output: Option<&'a PathBuf>,
    factory: Arc<dyn SessionFactory>,
    registry: &'a ScriptRegistry,
    instrumentation: &'a NetworkInstrumentation,
    format: OutputFormat,
}

impl Job<'_> {
    async fn run(&self) -> Result<JobOutcome> {
        let mut outcome = JobOutcome::default();

        for pass in 0..self.instrumentation.passes() {
            let scenario = self.instrumentation.apply(pass).await;
            if let Some(name) = &scenario {
                print_info(&format!("Network scenario {}", name));
            }

            for test in &self.tests {
                let mut test = (*test).clone();
                test.resolve_name();

                let (failed, state) = match self.run_test(&test, scenario.clone()).await {
                    Ok(result) => result,
                    Err(e) => {
                        self.instrumentation.clean(pass).await;
                        return Err(e);
                    }
                };
                outcome.failed += failed;
                if state == RunState::Interrupted {
                    outcome.interrupted = true;
                    break;
                }
            }

            self.instrumentation.clean(pass).await;
            if outcome.interrupted {
                break;
            }
        }
        Ok(outcome)
    }

    /// Run one test, returning its failed tuple count and final state
    async fn run_test(
        &self,
        test: &TestConfig,
        scenario: Option<String>,
    ) -> Result<(usize, RunState)> {
        let script = self.registry.resolve(&test.test_impl)?;
        let tuples = tuples_for(self.config, test)?;

        let run_id = run_id_for(&test.name);
        let reporter = reporters(self.config, test, self.store, self.output, &run_id)?;
        let ctx = RunContext::new(test.clone(), Arc::clone(&self.factory), script, reporter)
            .with_run_id(run_id)
            .with_suite(self.config.name.clone())
            .with_endpoints(self.config.endpoints.clone())
            .with_scenario(scenario);
        let runner = MatrixRunner::new(ctx, tuples)?;

        print_info(&format!(
            "{}: {} tuple(s), {} worker(s)",
            test.name,
            runner.tuples().len(),
            test.no_of_threads
        ));

        let run = runner.run();
        tokio::pin!(run);
        let reports = tokio::select! {
            result = &mut run => result?,
            _ = tokio::signal::ctrl_c() => {
                print_warning("Interrupted, waiting for active tuples to wind down");
                runner.interrupt();
                run.await?
            }
        };

        let rows: Vec<ReportDisplay> = reports.iter().map(ReportDisplay::from).collect();
        print_list(&rows, self.format);

        let mut failed = 0;
        if let Some(summary) = runner.summary() {
            failed = summary.total - summary.passed;
            print_item(&SummaryDisplay(summary), self.format);
        }
        Ok((failed, runner.state()))
    }
}

/// Whether another job follows the `done` jobs already run
fn repeats(schedule: Option<RepeatInterval>, done: usize, max_jobs: Option<usize>) -> bool {
    schedule.is_some() && max_jobs.map_or(true, |max| done < max)
}

pub async fn execute(args: RunArgs, db: PathBuf, format: OutputFormat) -> Result<()> {
    let config = KiteConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let tests: Vec<&TestConfig> = match &args.test {
        Some(name) => vec![config.test(name)?],
        None => config.tests.iter().collect(),
    };

    let store = if args.no_store {
        None
    } else {
        Some(ResultStore::open(&db).with_context(|| format!("opening {}", db.display()))?)
    };

    // --grid sends every endpoint without its own address to one hub
    let factory: Arc<dyn SessionFactory> = Arc::new(WebDriverSessionFactory::new(WebDriverConfig {
        remotes: match &args.grid {
            Some(_) => Vec::new(),
            None => config.remotes.clone(),
        },
        default_hub: args.grid.clone().or_else(|| config.remote_address.clone()),
        ..Default::default()
    })?);
    let registry = ScriptRegistry::with_builtins();
    let instrumentation =
        NetworkInstrumentation::new(&config.network_instrumentation.clone().unwrap_or_default());

    let job = Job {
        config: &config,
        tests,
        store: store.as_ref(),
        output: args.output.as_ref(),
        factory,
        registry: &registry,
        instrumentation: &instrumentation,
        format,
    };

    let schedule = args.interval.or(config.interval);
    let mut ticker = schedule.map(|interval| {
        let mut ticker = tokio::time::interval(interval.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    if let Some(ticker) = ticker.as_mut() {
        // the first tick completes immediately
        ticker.tick().await;
    }

    let mut failed = 0;
    let mut jobs = 0;
    loop {
        let outcome = job.run().await?;
        jobs += 1;
        failed += outcome.failed;

        if outcome.interrupted {
            print_warning("Run interrupted; remaining tests skipped");
            break;
        }
        let Some(ticker) = ticker.as_mut().filter(|_| repeats(schedule, jobs, args.max_jobs))
        else {
            break;
        };

        if let Some(interval) = schedule {
            print_info(&format!("Job {} done, repeating {}", jobs, interval));
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                print_warning("Interrupted while waiting for the next job");
                break;
            }
        }
    }

    if failed == 0 {
        print_success("All tuples passed");
        Ok(())
    } else {
        anyhow::bail!("{} tuple(s) did not pass", failed)
    }
}

/// Run id readable in listings: test name prefix plus a timestamp
fn run_id_for(test_name: &str) -> String {
    let prefix: String = test_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(16)
        .collect::<String>()
        .to_lowercase();
    format!(
        "{}-{}",
        if prefix.is_empty() { "run" } else { &prefix },
        chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeats() {
        assert!(!repeats(None, 1, None));
        assert!(repeats(Some(RepeatInterval::Hourly), 1, None));
        assert!(repeats(Some(RepeatInterval::Daily), 1, Some(2)));
        assert!(!repeats(Some(RepeatInterval::Daily), 2, Some(2)));
    }

    #[test]
    fn test_run_id_format() {
        let id = run_id_for("IceConnectionTest (2024-01-01 10:00:00)");
        assert!(id.starts_with("iceconnectiontes-"));
        assert!(run_id_for("%%").starts_with("run-"));
    }
}
