//! Scheduling behavior of the matrix runner against a mock grid

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use kite_common::{KiteConfig, RunState, TestOutcome};
use kite_engine::reporter::Position;
use kite_engine::{build_tuples, tuples_for, DeliveryMode, EngineError, MatrixRunner, TestRunner};
use serde_json::json;
use support::*;

fn scheduler(
    config: kite_common::TestConfig,
    endpoints: &[&str],
    grid: &Arc<MockGrid>,
    script: Arc<dyn kite_engine::TestScript>,
    reporter: &Arc<RecordingReporter>,
) -> MatrixRunner {
    let endpoints = browsers(endpoints);
    let tuples = build_tuples(&endpoints, config.tuple_size, config.permute).unwrap();
    let ctx = context(config, grid, script, reporter).with_endpoints(endpoints);
    MatrixRunner::new(ctx, tuples).unwrap()
}

#[tokio::test]
async fn test_concurrency_never_exceeds_pool() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let runner = scheduler(
        test_config(2, 2, 0),
        &["chrome", "firefox", "safari"],
        &grid,
        Arc::new(SleepScript(Duration::from_millis(30))),
        &reporter,
    );

    let reports = runner.run().await.unwrap();

    assert_eq!(reports.len(), 9);
    assert!(reports.iter().all(|r| r.outcome.is_success()));
    // two tuples of two sessions each at most
    assert!(grid.peak() <= 4, "peak was {}", grid.peak());
    assert_eq!(grid.open_now(), 0);
    assert_eq!(runner.state(), RunState::Completed);
}

#[tokio::test]
async fn test_reports_follow_tuple_order() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let runner = scheduler(
        test_config(1, 3, 0),
        &["a", "b", "c", "d", "e"],
        &grid,
        Arc::new(SleepScript(Duration::from_millis(5))),
        &reporter,
    );

    let reports = runner.run().await.unwrap();
    let indices: Vec<usize> = reports.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_first_and_last_delivered_synchronously() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let runner = scheduler(
        test_config(1, 4, 0),
        &["a", "b", "c", "d"],
        &grid,
        Arc::new(SleepScript(Duration::from_millis(5))),
        &reporter,
    );

    let reports = runner.run().await.unwrap();

    assert_eq!(reporter.synchronous_ids(), vec![0, 3]);
    assert_eq!(reporter.delivered_ids(), vec![0, 1, 2, 3]);
    assert_eq!(reports[0].delivery, DeliveryMode::Synchronous);
    assert_eq!(reports[1].delivery, DeliveryMode::Asynchronous);
    assert_eq!(reports[3].delivery, DeliveryMode::Synchronous);

    // meta only on the first and last envelopes
    let first = reporter.body(0).unwrap();
    assert_eq!(first["meta"]["totalTests"], 4);
    assert!(first["meta"].get("lastTest").is_none());
    assert!(reporter.body(1).unwrap().get("meta").is_none());
    assert_eq!(reporter.body(3).unwrap()["meta"]["lastTest"], true);

    let finalized = reporter.finalized.lock();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].passed, 4);
}

#[tokio::test]
async fn test_retry_then_grid_failure() {
    // 3 tuples, pool of 2, one retry each
    let grid = MockGrid::new().fail("flaky", 1).fail_forever("dead");
    let reporter = Arc::new(RecordingReporter::default());
    let runner = scheduler(
        test_config(1, 2, 1),
        &["healthy", "flaky", "dead"],
        &grid,
        Arc::new(SleepScript(Duration::from_millis(5))),
        &reporter,
    );

    let reports = runner.run().await.unwrap();

    assert!(reports[0].outcome.is_success());
    assert_eq!(reports[0].attempts, 1);
    assert!(reports[1].outcome.is_success());
    assert_eq!(reports[1].attempts, 2);
    assert!(matches!(reports[2].outcome, TestOutcome::GridFailure(_)));
    assert_eq!(reports[2].attempts, 2);

    assert_eq!(grid.attempts("healthy"), 1);
    assert_eq!(grid.attempts("flaky"), 2);
    assert_eq!(grid.attempts("dead"), 2);
    assert_eq!(reporter.delivered_ids(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_partial_acquisition_releases_sessions() {
    let grid = MockGrid::new().fail_forever("dead");
    let reporter = Arc::new(RecordingReporter::default());
    let endpoints = browsers(&["chrome", "dead"]);
    let tuples = vec![kite_common::Tuple::new(0, endpoints.clone())];
    let ctx = context(
        test_config(2, 1, 2),
        &grid,
        Arc::new(SleepScript(Duration::ZERO)),
        &reporter,
    )
    .with_endpoints(endpoints)
    .with_scenario(Some("lossy".to_string()));

    let reports = MatrixRunner::new(ctx, tuples).unwrap().run().await.unwrap();

    assert!(matches!(reports[0].outcome, TestOutcome::GridFailure(_)));
    assert_eq!(reports[0].attempts, 3);
    // chrome was opened on every attempt and closed again
    assert_eq!(grid.attempts("chrome"), 3);
    assert_eq!(grid.open_now(), 0);
}

#[tokio::test]
async fn test_script_failure_is_not_retried() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let runner = scheduler(
        test_config(1, 2, 3),
        &["chrome", "firefox"],
        &grid,
        Arc::new(FailingScript),
        &reporter,
    );

    let reports = runner.run().await.unwrap();

    for report in &reports {
        assert_eq!(report.attempts, 1);
        match &report.outcome {
            TestOutcome::ScriptFailure(msg) => assert!(msg.contains("video is frozen")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(grid.attempts("chrome"), 1);
    assert_eq!(grid.open_now(), 0);
}

#[tokio::test]
async fn test_script_panic_is_contained() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let runner = scheduler(
        test_config(1, 1, 0),
        &["chrome"],
        &grid,
        Arc::new(PanickingScript),
        &reporter,
    );

    let reports = runner.run().await.unwrap();
    assert!(matches!(reports[0].outcome, TestOutcome::ScriptFailure(_)));
    assert_eq!(grid.open_now(), 0);
}

#[tokio::test]
async fn test_script_timeout() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let mut config = test_config(1, 1, 0);
    config.script_timeout_secs = 1;
    let runner = scheduler(
        config,
        &["chrome"],
        &grid,
        Arc::new(SleepScript(Duration::from_secs(5))),
        &reporter,
    );

    let reports = runner.run().await.unwrap();
    match &reports[0].outcome {
        TestOutcome::ScriptFailure(msg) => assert!(msg.contains("timed out")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(grid.open_now(), 0);
}

#[tokio::test]
async fn test_batch_deadline_aborts_remaining() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let mut config = test_config(1, 1, 0);
    config.batch_timeout_secs = 1;
    let runner = scheduler(
        config,
        &["chrome", "firefox"],
        &grid,
        Arc::new(SleepScript(Duration::from_secs(3))),
        &reporter,
    );

    let started = std::time::Instant::now();
    let reports = runner.run().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|r| matches!(r.outcome, TestOutcome::Aborted(_))));
    assert_eq!(runner.summary().unwrap().aborted, 2);
}

#[tokio::test]
async fn test_interrupt_aborts_pending_tuples() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let runner = Arc::new(scheduler(
        test_config(1, 1, 0),
        &["a", "b", "c", "d"],
        &grid,
        Arc::new(SleepScript(Duration::from_millis(200))),
        &reporter,
    ));

    let handle = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.run().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    runner.interrupt();
    runner.interrupt();

    let reports = handle.await.unwrap().unwrap();

    assert_eq!(runner.state(), RunState::Interrupted);
    assert_eq!(reports.len(), 4);
    // the running tuple finishes its script, the queued ones never start
    assert!(reports[0].outcome.is_success());
    assert!(reports[1..]
        .iter()
        .all(|r| matches!(r.outcome, TestOutcome::Aborted(_))));
    assert_eq!(grid.attempts("d"), 0);
    assert_eq!(grid.open_now(), 0);
    assert_eq!(reporter.finalized.lock().len(), 1);
}

#[tokio::test]
async fn test_empty_matrix_completes() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let ctx = context(
        test_config(2, 1, 0),
        &grid,
        Arc::new(SleepScript(Duration::ZERO)),
        &reporter,
    );
    let runner = MatrixRunner::new(ctx, Vec::new()).unwrap();

    let reports = runner.run().await.unwrap();
    assert!(reports.is_empty());
    assert_eq!(runner.state(), RunState::Completed);
    assert_eq!(reporter.finalized.lock().len(), 1);
}

#[tokio::test]
async fn test_run_only_once() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let runner = scheduler(
        test_config(1, 1, 0),
        &["chrome"],
        &grid,
        Arc::new(SleepScript(Duration::ZERO)),
        &reporter,
    );

    runner.run().await.unwrap();
    assert!(matches!(
        runner.run().await,
        Err(EngineError::InvalidSchedule(_))
    ));
    assert_eq!(reporter.finalized.lock().len(), 1);
}

#[tokio::test]
async fn test_envelope_records_target_and_destination() {
    let grid = MockGrid::new().fail_forever("edge").with_error_text(
        "Could not start session. os.name: 'Windows 10', os.arch: 'amd64', os.version: '10.0'",
    );
    let reporter = Arc::new(RecordingReporter::default());
    let endpoints = vec![
        kite_common::EndpointSpec::browser("chrome")
            .with_version("70")
            .with_platform("LINUX"),
        kite_common::EndpointSpec::browser("edge").with_platform("WINDOWS"),
    ];
    let tuples = build_tuples(&endpoints, 1, false).unwrap();
    let ctx = context(
        test_config(1, 1, 0),
        &grid,
        Arc::new(SleepScript(Duration::ZERO)),
        &reporter,
    )
    .with_endpoints(endpoints)
    .with_scenario(Some("lossy".to_string()));

    let reports = MatrixRunner::new(ctx, tuples).unwrap().run().await.unwrap();

    let chrome = &reports[0].envelope;
    assert_eq!(chrome["test"]["name"], "MatrixTest");
    assert_eq!(chrome["test"]["networkScenario"], "lossy");
    assert_eq!(chrome["target"][0]["version"], "70");
    assert_eq!(chrome["destination"][0]["version"], "70.0.1");
    assert_eq!(chrome["result"]["status"], "success");
    assert_eq!(chrome["meta"]["browsers"].as_array().unwrap().len(), 2);

    let edge = &reports[1].envelope;
    assert_eq!(edge["result"]["status"], "grid_failure");
    assert_eq!(edge["destination"][0]["platform"], "Windows 10 10.0");
}

#[tokio::test]
async fn test_first_report_claim_wins() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let ctx = Arc::new(context(
        test_config(1, 1, 0),
        &grid,
        Arc::new(SleepScript(Duration::ZERO)),
        &reporter,
    ));
    let tuple = build_tuples(&browsers(&["chrome"]), 1, false).unwrap().remove(0);
    let position = Position { index: 0, total: 1 };

    // a late runner reports first, then the fallback for the same tuple
    let finished = TestRunner::new(Arc::clone(&ctx), tuple.clone(), position, Instant::now())
        .conclude(TestOutcome::Success(json!("connected")))
        .await;
    let fallback = TestRunner::new(Arc::clone(&ctx), tuple, position, Instant::now())
        .conclude(TestOutcome::Aborted("batch deadline reached".to_string()))
        .await;

    assert!(finished.outcome.is_success());
    assert!(fallback.outcome.is_success());
    assert_eq!(fallback.envelope, finished.envelope);
    assert_eq!(reporter.delivered_ids(), vec![0]);
    assert_eq!(reporter.body(0).unwrap()["result"]["status"], "success");
}

#[tokio::test]
async fn test_config_without_endpoints_schedules_nothing() {
    let config = KiteConfig::from_json(
        r#"{
            "name": "Empty",
            "endpoints": [],
            "tests": [{"name": "Interop", "tupleSize": 2, "testImpl": "mock"}]
        }"#,
    )
    .unwrap();
    let test = &config.tests[0];
    let tuples = tuples_for(&config, test).unwrap();
    assert!(tuples.is_empty());

    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let ctx = context(
        test.clone(),
        &grid,
        Arc::new(SleepScript(Duration::ZERO)),
        &reporter,
    );
    let runner = MatrixRunner::new(ctx, tuples).unwrap();
    assert!(runner.run().await.unwrap().is_empty());
    assert_eq!(runner.state(), RunState::Completed);
    assert_eq!(grid.created.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(reporter.finalized.lock()[0].total, 0);
}
