//! Shared state of one test run

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use kite_common::{EndpointSpec, Phase, TestConfig};
use parking_lot::Mutex;

use crate::coordination::{RunSignals, WorkerPool};
use crate::policy::{RampUp, RetryPolicy};
use crate::reporter::{DeliveryTracker, ResultReporter};
use crate::runner::TestReport;
use crate::script::TestScript;
use crate::session::SessionFactory;

/// Everything the runners of one test share
pub struct RunContext {
    pub run_id: String,
    /// Name of the config the test came from
    pub suite: String,
    pub config: TestConfig,
    /// Every configured endpoint, for envelope metadata
    pub endpoints: Vec<EndpointSpec>,
    /// Network scenario in force while the run executes
    pub scenario: Option<String>,
    pub phases: Vec<Phase>,
    pub ramp_up: RampUp,
    pub policy: RetryPolicy,
    pub factory: Arc<dyn SessionFactory>,
    pub script: Arc<dyn TestScript>,
    pub reporter: Arc<dyn ResultReporter>,
    pub signals: RunSignals,
    pub pool: WorkerPool,
    pub deliveries: DeliveryTracker,
    reported: Mutex<HashMap<usize, TestReport>>,
}

impl RunContext {
    pub fn new(
        config: TestConfig,
        factory: Arc<dyn SessionFactory>,
        script: Arc<dyn TestScript>,
        reporter: Arc<dyn ResultReporter>,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            suite: config.name.clone(),
            endpoints: Vec::new(),
            scenario: None,
            phases: Phase::for_run(config.is_load_test()),
            ramp_up: RampUp::from_config(&config),
            policy: RetryPolicy::new(config.max_retry_count),
            pool: WorkerPool::new(config.no_of_threads),
            config,
            factory,
            script,
            reporter,
            signals: RunSignals::new(),
            deliveries: DeliveryTracker::default(),
            reported: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_suite(mut self, suite: impl Into<String>) -> Self {
        self.suite = suite.into();
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<EndpointSpec>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_scenario(mut self, scenario: Option<String>) -> Self {
        self.scenario = scenario;
        self
    }

    /// Claim the single report slot of a tuple with `report`.
    ///
    /// Returns the report already holding the slot when an earlier claim won.
    pub fn claim_report(&self, report: &TestReport) -> Option<TestReport> {
        match self.reported.lock().entry(report.index) {
            Entry::Occupied(claimed) => Some(claimed.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(report.clone());
                None
            }
        }
    }

    pub fn is_reported(&self, index: usize) -> bool {
        self.reported.lock().contains_key(&index)
    }
}
