//! Load test ramp-up and phase barriers

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use kite_common::{Phase, TestType, Tuple};
use kite_engine::{EngineError, MatrixRunner};
use support::*;

fn load_config(runners: usize, increment: usize, interval_ms: u64) -> kite_common::TestConfig {
    let mut config = test_config(1, runners, 0);
    config.test_type = TestType::Load;
    config.increment = increment;
    config.interval_ms = interval_ms;
    config
}

/// One single-endpoint tuple per runner
fn load_tuples(count: usize) -> Vec<Tuple> {
    (0..count)
        .map(|i| Tuple::new(i, browsers(&[format!("client-{}", i).as_str()])))
        .collect()
}

#[tokio::test]
async fn test_ramp_up_in_bursts() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let ctx = context(
        load_config(10, 5, 300),
        &grid,
        Arc::new(SleepScript(Duration::from_millis(10))),
        &reporter,
    );
    let runner = MatrixRunner::new(ctx, load_tuples(10)).unwrap();

    let started = Instant::now();
    let reports = runner.run().await.unwrap();

    assert_eq!(reports.len(), 10);
    assert!(reports.iter().all(|r| r.outcome.is_success()));

    for (name, created) in grid.creation_times() {
        let index: usize = name.trim_start_matches("client-").parse().unwrap();
        let offset = created.duration_since(started);
        if index < 5 {
            assert!(offset < Duration::from_millis(250), "{} at {:?}", name, offset);
        } else {
            assert!(offset >= Duration::from_millis(300), "{} at {:?}", name, offset);
        }
    }

    // every runner held its session until the whole load was up
    assert_eq!(grid.peak(), 10);
    assert_eq!(grid.open_now(), 0);
}

#[tokio::test]
async fn test_steady_state_starts_after_full_ramp_up() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let recorder = Arc::new(PhaseRecorder::default());
    let ctx = context(load_config(6, 2, 50), &grid, recorder.clone(), &reporter);
    let runner = MatrixRunner::new(ctx, load_tuples(6)).unwrap();

    let reports = runner.run().await.unwrap();

    let events = recorder.events.lock().clone();
    assert_eq!(events.len(), 12);
    let first_steady = events
        .iter()
        .position(|(_, phase)| *phase == Phase::LoadReached)
        .unwrap();
    assert!(events[..first_steady]
        .iter()
        .all(|(_, phase)| *phase == Phase::RampUp));
    assert_eq!(first_steady, 6);

    // load payloads carry one entry per phase
    let payload = reports[0].outcome.payload();
    assert_eq!(payload["RAMPUP"], "RAMPUP");
    assert_eq!(payload["LOADREACHED"], "LOADREACHED");
}

#[tokio::test]
async fn test_failed_runner_does_not_block_load() {
    let grid = MockGrid::new().fail_forever("client-2");
    let reporter = Arc::new(RecordingReporter::default());
    let ctx = context(
        load_config(4, 4, 0),
        &grid,
        Arc::new(SleepScript(Duration::from_millis(10))),
        &reporter,
    );
    let runner = MatrixRunner::new(ctx, load_tuples(4)).unwrap();

    let reports = tokio::time::timeout(Duration::from_secs(10), runner.run())
        .await
        .expect("load run deadlocked")
        .unwrap();

    let passed = reports.iter().filter(|r| r.outcome.is_success()).count();
    assert_eq!(passed, 3);
    assert_eq!(grid.open_now(), 0);
}

#[tokio::test]
async fn test_load_needs_a_slot_per_runner() {
    let grid = MockGrid::new();
    let reporter = Arc::new(RecordingReporter::default());
    let mut config = load_config(4, 1, 0);
    config.no_of_threads = 2;
    let ctx = context(config, &grid, Arc::new(SleepScript(Duration::ZERO)), &reporter);

    assert!(matches!(
        MatrixRunner::new(ctx, load_tuples(4)),
        Err(EngineError::InvalidSchedule(_))
    ));
}
