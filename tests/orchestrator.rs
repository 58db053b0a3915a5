//! Orchestrator Integration Tests
//!
//! Full runs against scripted providers: idempotent replay, cursor safety,
//! failure isolation and cross-source merging.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use ocean_sync::adapters::FetchError;
use ocean_sync::core::state_store::{SqliteStateStore, SyncStateStore};
use ocean_sync::core::Orchestrator;
use ocean_sync::domain::{
    RejectStage, RunOutcome, SourceId, SourceOutcome, SourceState, VariableType, Watermark,
};
use ocean_sync::sink::{MemorySink, PersistError, Sink, SqliteSink};
use tempfile::TempDir;

fn state() -> Arc<dyn SyncStateStore> {
    Arc::new(SqliteStateStore::in_memory().unwrap())
}

fn three_days(source: &str, quality: f64) -> ScriptedAdapter {
    ScriptedAdapter::new(source, quality)
        .granule(1, csv(&[row(1, 33.0, -118.0, 17.5), row(1, 33.5, -118.0, 17.9)]))
        .granule(2, csv(&[row(2, 33.0, -118.0, 17.6), row(2, 33.5, -118.0, 18.0)]))
        .granule(3, csv(&[row(3, 33.0, -118.0, 17.4), row(3, 33.5, -118.0, 17.8)]))
}

#[tokio::test]
async fn test_replay_leaves_sink_unchanged() {
    let config = test_config();
    let sink = Arc::new(MemorySink::new());

    let first = Orchestrator::new(
        &config,
        vec![three_days("noaa", 0.8).into_arc()],
        state(),
        sink.clone(),
    )
    .run()
    .await;

    assert_eq!(first.outcome, RunOutcome::Success);
    assert_eq!(first.totals().written, 6);
    assert_eq!(sink.count().await.unwrap(), 6);
    let stored = sink.snapshot();

    // Fresh cursor and fresh dedup window: everything is fetched again
    let replay = Orchestrator::new(
        &config,
        vec![three_days("noaa", 0.8).into_arc()],
        state(),
        sink.clone(),
    )
    .run()
    .await;

    let report = replay.source("noaa").unwrap();
    assert_eq!(replay.outcome, RunOutcome::Success);
    assert_eq!(report.counts.fetched, 3);
    assert_eq!(report.counts.written, 0);
    assert_eq!(report.counts.deduped, 6);
    assert_eq!(sink.snapshot(), stored);
}

#[tokio::test]
async fn test_replay_through_sqlite_sink_writes_nothing() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("observations.db");
    let config = test_config();

    // Kelvin readings whose Celsius values carry long binary fractions
    let kelvin = |d: u32| {
        let rows: Vec<String> = (0..100)
            .map(|i| row(d, 30.0 + i as f64 * 0.05, -118.0, 285.0 + i as f64 * 0.0137))
            .collect();
        csv(&rows)
    };
    let adapter = || {
        ScriptedAdapter::new("copernicus", 0.9)
            .with_unit("sst", "K")
            .granule(1, kelvin(1))
            .granule(2, kelvin(2))
            .into_arc()
    };

    let first = Orchestrator::new(
        &config,
        vec![adapter()],
        state(),
        Arc::new(SqliteSink::open(&path).unwrap()),
    )
    .run()
    .await;
    assert_eq!(first.source("copernicus").unwrap().counts.written, 200);

    // Reopened database, fresh cursor and empty window: every key is read back from disk
    let sink = Arc::new(SqliteSink::open(&path).unwrap());
    let replay = Orchestrator::new(&config, vec![adapter()], state(), sink.clone())
        .run()
        .await;

    let report = replay.source("copernicus").unwrap();
    assert_eq!(replay.outcome, RunOutcome::Success);
    assert_eq!(report.counts.deduped, 200);
    assert_eq!(report.counts.merged, 0);
    assert_eq!(report.counts.written, 0);
    assert_eq!(sink.count().await.unwrap(), 200);
}

#[tokio::test]
async fn test_second_run_resumes_after_cursor() {
    let config = test_config();
    let store = state();
    let sink = Arc::new(MemorySink::new());

    let first = Orchestrator::new(
        &config,
        vec![three_days("noaa", 0.8).into_arc()],
        store.clone(),
        sink.clone(),
    )
    .run()
    .await;

    let report = first.source("noaa").unwrap();
    assert_eq!(report.counts.batches_committed, 2);
    assert_eq!(
        report.cursor_after.watermark,
        Some(Watermark::Timestamp(midnight(3)))
    );

    let adapter = Arc::new(three_days("noaa", 0.8));
    let second = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        store.clone(),
        sink.clone(),
    )
    .run()
    .await;

    assert_eq!(second.outcome, RunOutcome::Success);
    assert_eq!(second.source("noaa").unwrap().counts.listed, 0);
    assert_eq!(adapter.fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink.count().await.unwrap(), 6);
}

#[tokio::test]
async fn test_persist_failure_keeps_cursor_at_last_stored_batch() {
    let config = test_config();
    let store = state();
    // Day 1 and day 2 (first batch) store four records, day 3 fails
    let sink = Arc::new(FailingSink::after(
        4,
        PersistError::Permanent("disk full".to_string()),
    ));

    let run = Orchestrator::new(
        &config,
        vec![three_days("noaa", 0.8).into_arc()],
        store.clone(),
        sink.clone(),
    )
    .run()
    .await;

    let report = run.source("noaa").unwrap();
    assert!(matches!(
        &report.state,
        SourceState::Failed { retryable: true, reason } if reason.contains("persist failed")
    ));
    assert!(matches!(run.outcome, RunOutcome::Failed { .. }));
    assert_eq!(run.outcome.exit_code(), 1);

    let cursor = store.get(&SourceId::new("noaa")).await.unwrap();
    assert_eq!(cursor.watermark, Some(Watermark::Timestamp(midnight(2))));
    assert_eq!(cursor.consecutive_failures, 1);
    assert_eq!(sink.snapshot().len(), 4);
}

#[tokio::test]
async fn test_persist_failure_in_first_batch_leaves_zero_cursor() {
    let config = test_config();
    let store = state();
    let sink = Arc::new(FailingSink::after(
        0,
        PersistError::Transient("database is locked".to_string()),
    ));

    let run = Orchestrator::new(
        &config,
        vec![three_days("argo", 0.8).into_arc()],
        store.clone(),
        sink,
    )
    .run()
    .await;

    assert_eq!(run.source("argo").unwrap().outcome(), SourceOutcome::Failure);
    let cursor = store.get(&SourceId::new("argo")).await.unwrap();
    assert!(cursor.is_zero());
    assert_eq!(cursor.consecutive_failures, 1);
}

#[tokio::test]
async fn test_failing_source_does_not_affect_others() {
    let config = test_config();
    let store = state();
    let sink = Arc::new(MemorySink::new());

    let broken = Arc::new(
        ScriptedAdapter::new("copernicus", 0.8).failing_listing(Script::Always(
            FetchError::Transient("503 Service Unavailable".to_string()),
        )),
    );
    let adapters = vec![
        ScriptedAdapter::shared(&broken),
        three_days("noaa", 0.8).into_arc(),
    ];

    let run = Orchestrator::new(&config, adapters, store.clone(), sink.clone())
        .run()
        .await;

    assert_eq!(run.outcome, RunOutcome::Partial);
    assert_eq!(run.outcome.exit_code(), 2);
    assert_eq!(broken.list_calls.load(Ordering::SeqCst), 3);

    let failed = run.source("copernicus").unwrap();
    assert_eq!(failed.listing_attempts, 3);
    assert!(matches!(
        &failed.state,
        SourceState::Failed { retryable: true, reason } if reason.contains("after 3 attempts")
    ));

    let healthy = run.source("noaa").unwrap();
    assert!(healthy.state.is_committed());
    assert_eq!(healthy.counts.written, 6);
    assert_eq!(sink.count().await.unwrap(), 6);
}

#[tokio::test]
async fn test_permanent_listing_error_is_not_retried() {
    let config = test_config();
    let adapter = Arc::new(
        ScriptedAdapter::new("copernicus", 0.8).failing_listing(Script::Always(
            FetchError::Permanent("missing credentials".to_string()),
        )),
    );

    let run = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        state(),
        Arc::new(MemorySink::new()),
    )
    .run()
    .await;

    assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        run.source("copernicus").unwrap().state,
        SourceState::Failed { retryable: false, .. }
    ));
}

#[tokio::test]
async fn test_listing_recovers_within_retry_budget() {
    let config = test_config();
    let adapter = Arc::new(three_days("ncei", 0.7).failing_listing(Script::Times(
        2,
        FetchError::Transient("429 Too Many Requests".to_string()),
    )));

    let run = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        state(),
        Arc::new(MemorySink::new()),
    )
    .run()
    .await;

    let report = run.source("ncei").unwrap();
    assert!(report.state.is_committed());
    assert_eq!(report.listing_attempts, 3);
    assert_eq!(report.counts.written, 6);
}

#[tokio::test]
async fn test_invalid_latitude_never_reaches_sink() {
    let config = test_config();
    let sink = Arc::new(MemorySink::new());
    let adapter = ScriptedAdapter::new("argo", 0.8).granule(
        1,
        csv(&[row(1, 200.0, -118.0, 17.5), row(1, 33.0, -118.0, 17.9)]),
    );

    let run = Orchestrator::new(&config, vec![adapter.into_arc()], state(), sink.clone())
        .run()
        .await;

    let report = run.source("argo").unwrap();
    assert!(report.state.is_committed());
    assert_eq!(report.outcome(), SourceOutcome::Partial);
    assert_eq!(report.counts.rejected, 1);
    assert_eq!(report.rejections[0].stage, RejectStage::Normalize);
    assert!(report.rejections[0].error.contains("latitude"));

    let stored = sink.snapshot();
    assert_eq!(stored.len(), 1);
    assert!(stored
        .iter()
        .all(|(_, obs)| obs.position.latitude.abs() <= 90.0));
}

#[tokio::test]
async fn test_quality_first_keeps_best_source_and_lineage() {
    let config = test_config();
    let sink = Arc::new(MemorySink::new());

    let low = ScriptedAdapter::new("noaa", 0.5).granule(1, csv(&[row(1, 33.0, -118.0, 18.0)]));
    let high =
        ScriptedAdapter::new("copernicus", 0.9).granule(1, csv(&[row(1, 33.0, -118.0, 18.4)]));

    let run = Orchestrator::new(
        &config,
        vec![low.into_arc(), high.into_arc()],
        state(),
        sink.clone(),
    )
    .run()
    .await;

    assert_eq!(run.outcome, RunOutcome::Success);

    let stored = sink.snapshot();
    assert_eq!(stored.len(), 1);
    let (_, record) = &stored[0];
    assert_eq!(record.variable, VariableType::SeaSurfaceTemperature);
    assert_eq!(record.value, 18.4);
    assert_eq!(record.provenance.source, SourceId::new("copernicus"));
    assert_eq!(
        record.contributing_sources(),
        vec![SourceId::new("copernicus"), SourceId::new("noaa")]
    );
}

#[tokio::test]
async fn test_transient_fetch_failure_pins_cursor() {
    let config = test_config();
    let store = state();
    let sink = Arc::new(MemorySink::new());

    // Exactly one run's worth of retries fails
    let adapter = three_days("noaa", 0.8).failing_fetch(
        2,
        Script::Times(3, FetchError::Transient("connection reset".to_string())),
    );
    let adapter = Arc::new(adapter);

    let first = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        store.clone(),
        sink.clone(),
    )
    .run()
    .await;

    let report = first.source("noaa").unwrap();
    assert!(report.state.is_committed());
    assert_eq!(report.counts.rejected, 1);
    assert!(report.rejections[0].retryable);
    // Day 3 is stored but the cursor cannot pass day 2
    assert_eq!(report.counts.written, 4);
    assert_eq!(
        report.cursor_after.watermark,
        Some(Watermark::Timestamp(midnight(1)))
    );

    let second = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        store.clone(),
        sink.clone(),
    )
    .run()
    .await;

    let report = second.source("noaa").unwrap();
    assert_eq!(second.outcome, RunOutcome::Success);
    assert_eq!(report.counts.listed, 2);
    assert_eq!(report.counts.written, 2);
    assert_eq!(report.counts.deduped, 2);
    assert_eq!(
        report.cursor_after.watermark,
        Some(Watermark::Timestamp(midnight(3)))
    );
    assert_eq!(sink.count().await.unwrap(), 6);
}

#[tokio::test]
async fn test_permanent_fetch_failure_is_skipped() {
    let config = test_config();
    let adapter = three_days("noaa", 0.8)
        .failing_fetch(2, Script::Always(FetchError::Permanent("404 Not Found".to_string())));

    let run = Orchestrator::new(
        &config,
        vec![adapter.into_arc()],
        state(),
        Arc::new(MemorySink::new()),
    )
    .run()
    .await;

    let report = run.source("noaa").unwrap();
    assert_eq!(report.rejections.len(), 1);
    assert_eq!(report.rejections[0].stage, RejectStage::Fetch);
    assert!(!report.rejections[0].retryable);
    assert_eq!(
        report.cursor_after.watermark,
        Some(Watermark::Timestamp(midnight(3)))
    );
}

#[tokio::test]
async fn test_unpublished_day_holds_cursor_without_rejection() {
    let config = test_config();
    let store = state();
    let sink = Arc::new(MemorySink::new());

    let adapter = Arc::new(three_days("argo", 0.8).failing_fetch(
        3,
        Script::Times(
            1,
            FetchError::NotYetAvailable("ArgoFloats:2024-03-03 returned no data".to_string()),
        ),
    ));

    let first = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        store.clone(),
        sink.clone(),
    )
    .run()
    .await;

    let report = first.source("argo").unwrap();
    assert_eq!(first.outcome, RunOutcome::Success);
    assert_eq!(report.outcome(), SourceOutcome::Success);
    assert_eq!(report.counts.deferred, 1);
    assert_eq!(report.counts.rejected, 0);
    assert_eq!(adapter.fetch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        report.cursor_after.watermark,
        Some(Watermark::Timestamp(midnight(2)))
    );

    // Published by the next run
    let second = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        store.clone(),
        sink.clone(),
    )
    .run()
    .await;

    let report = second.source("argo").unwrap();
    assert_eq!(report.counts.listed, 1);
    assert_eq!(report.counts.written, 2);
    assert_eq!(
        report.cursor_after.watermark,
        Some(Watermark::Timestamp(midnight(3)))
    );
    assert_eq!(sink.count().await.unwrap(), 6);
}

#[tokio::test]
async fn test_run_timeout_fails_slow_source() {
    let mut config = test_config();
    config.run_timeout_seconds = 1;
    let store = state();

    let slow = three_days("argo", 0.8).slow(Duration::from_secs(5));
    let fast = three_days("noaa", 0.8);

    let run = Orchestrator::new(
        &config,
        vec![slow.into_arc(), fast.into_arc()],
        store.clone(),
        Arc::new(MemorySink::new()),
    )
    .run()
    .await;

    assert_eq!(run.outcome, RunOutcome::Partial);
    assert_eq!(
        run.source("argo").unwrap().state,
        SourceState::Failed {
            reason: "run timeout after 1s".to_string(),
            retryable: true
        }
    );
    let cursor = store.get(&SourceId::new("argo")).await.unwrap();
    assert!(cursor.is_zero());
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_sources() {
    let config = test_config();
    let slow = three_days("ncei", 0.7).slow(Duration::from_secs(10));

    let run = Orchestrator::new(
        &config,
        vec![slow.into_arc()],
        state(),
        Arc::new(MemorySink::new()),
    )
    .run_until(tokio::time::sleep(Duration::from_millis(50)))
    .await;

    assert!(matches!(run.outcome, RunOutcome::Failed { .. }));
    assert!(matches!(
        &run.source("ncei").unwrap().state,
        SourceState::Failed { reason, retryable: true } if reason == "run cancelled"
    ));
}

#[tokio::test]
async fn test_panicking_source_is_isolated() {
    let config = test_config();
    let run = Orchestrator::new(
        &config,
        vec![
            three_days("copernicus", 0.9).panicking().into_arc(),
            three_days("noaa", 0.8).into_arc(),
        ],
        state(),
        Arc::new(MemorySink::new()),
    )
    .run()
    .await;

    assert_eq!(run.outcome, RunOutcome::Partial);
    assert!(matches!(
        &run.source("copernicus").unwrap().state,
        SourceState::Failed { reason, .. } if reason.contains("aborted")
    ));
    assert!(run.source("noaa").unwrap().state.is_committed());
}

#[tokio::test]
async fn test_panic_after_commit_keeps_progress_and_failure_count() {
    let config = test_config();
    let store = state();
    let sink = Arc::new(MemorySink::new());

    // Days 1 and 2 form the first batch; the day 3 fetch panics
    let run = Orchestrator::new(
        &config,
        vec![three_days("argo", 0.8).panicking_from(3).into_arc()],
        store.clone(),
        sink.clone(),
    )
    .run()
    .await;

    let report = run.source("argo").unwrap();
    assert!(matches!(
        &report.state,
        SourceState::Failed { retryable: true, reason } if reason.contains("panicked")
    ));
    assert_eq!(report.counts.fetched, 2);
    assert_eq!(report.counts.written, 4);
    assert_eq!(report.counts.batches_committed, 1);
    assert_eq!(sink.count().await.unwrap(), 4);

    let stored = store.get(&SourceId::new("argo")).await.unwrap();
    assert_eq!(stored.watermark, Some(Watermark::Timestamp(midnight(2))));
    assert_eq!(stored.consecutive_failures, 1);
    assert_eq!(report.cursor_after, stored);
}

#[tokio::test]
async fn test_unreachable_sink_aborts_run() {
    let config = test_config();
    let adapter = Arc::new(three_days("noaa", 0.8));

    let run = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        state(),
        Arc::new(FailingSink::unreachable()),
    )
    .run()
    .await;

    assert!(matches!(run.outcome, RunOutcome::Failed { .. }));
    assert_eq!(run.outcome.exit_code(), 1);
    assert!(run.sources.is_empty());
    assert_eq!(adapter.list_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_recovery_resets_failure_count() {
    let config = test_config();
    let store = state();
    let sink = Arc::new(MemorySink::new());
    let adapter = Arc::new(three_days("noaa", 0.8).failing_listing(Script::Times(
        3,
        FetchError::Transient("timeout".to_string()),
    )));

    let first = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        store.clone(),
        sink.clone(),
    )
    .run()
    .await;
    assert!(!first.source("noaa").unwrap().state.is_committed());
    assert_eq!(
        store.get(&SourceId::new("noaa")).await.unwrap().consecutive_failures,
        1
    );

    let second = Orchestrator::new(
        &config,
        vec![ScriptedAdapter::shared(&adapter)],
        store.clone(),
        sink,
    )
    .run()
    .await;
    assert!(second.source("noaa").unwrap().state.is_committed());

    let cursor = store.get(&SourceId::new("noaa")).await.unwrap();
    assert_eq!(cursor.consecutive_failures, 0);
    assert!(cursor.last_success.is_some());
}
