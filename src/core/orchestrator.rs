//! Synchronization orchestrator.
//!
//! Each enabled source runs as its own task through
//! `LISTING → FETCHING → NORMALIZING → MERGING → PERSISTING → COMMITTED`.
//! A source that fails ends in `FAILED` without touching any other source.
//!
//! Items are processed in list order and committed in batches. After each
//! batch the cursor moves to the last item of the contiguous prefix that is
//! resolved: stored, or rejected for good. A fetch that ran out of transient
//! retries is rejected too but pins the cursor, so it is listed again next run.
//! An item the provider has not published yet pins it without a rejection.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{FetchError, ItemRef, SourceAdapter};
use crate::config::SyncConfig;
use crate::domain::{
    CanonicalObservation, RejectStage, SourceFailure, SourceId, SourceReport, SourceState,
    SyncCursor, SyncRun,
};
use crate::sink::{PersistError, Sink};

use super::dedup::{DedupEngine, MergeDecision};
use super::normalize::Normalizer;
use super::retry::{retry_transient, RetryPolicy, Retryable};
use super::state_store::{StateError, SyncStateStore};

/// How one listed item ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    /// Fetched and every surviving observation stored
    Stored,
    /// Permanently rejected; never worth fetching again
    Rejected,
    /// Transient retries exhausted or not published yet; must be listed again
    Deferred,
}

/// Main sync orchestrator
pub struct Orchestrator {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    state: Arc<dyn SyncStateStore>,
    sink: Arc<dyn Sink>,
    engine: Arc<DedupEngine>,
    normalizer: Normalizer,
    retry: RetryPolicy,
    batch_size: usize,
    run_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &SyncConfig,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        state: Arc<dyn SyncStateStore>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            adapters,
            state,
            sink,
            engine: Arc::new(DedupEngine::new(
                config.dedup.clone(),
                config.dedup_window_size,
                config.merge_policy,
                config.record_lineage,
            )),
            normalizer: Normalizer::new(),
            retry: config.retry.clone(),
            batch_size: config.batch_size.max(1),
            run_timeout: Duration::from_secs(config.run_timeout_seconds),
        }
    }

    /// Run every source to completion or until the run timeout
    pub async fn run(&self) -> SyncRun {
        self.run_until(std::future::pending()).await
    }

    /// Run every source; `shutdown` resolving cancels all in-flight sources
    #[instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run_until<F>(&self, shutdown: F) -> SyncRun
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        info!(sources = self.adapters.len(), "Starting sync run");

        if !self.sink.is_alive().await {
            error!("Sink unreachable, aborting run");
            return SyncRun::aborted(run_id, started_at, "sink unreachable".to_string());
        }

        // Load every cursor before spawning anything: an unreachable state
        // store means nothing can be committed safely
        let mut planned = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let source = adapter.source_id().clone();
            match self.state.get(&source).await {
                Ok(cursor) => planned.push((adapter.clone(), Ok(cursor))),
                Err(e @ StateError::Corrupt { .. }) => {
                    warn!(%source, error = %e, "Cursor unreadable");
                    planned.push((adapter.clone(), Err(e)));
                }
                Err(e) => {
                    error!(%source, error = %e, "State store unreachable, aborting run");
                    return SyncRun::aborted(
                        run_id,
                        started_at,
                        format!("state store unreachable: {}", e),
                    );
                }
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let watcher = tokio::spawn(async move {
            shutdown.await;
            let _ = cancel_tx.send(true);
        });

        let deadline = tokio::time::Instant::now() + self.run_timeout;
        let timeout_secs = self.run_timeout.as_secs();

        let mut handles = Vec::with_capacity(planned.len());
        for (adapter, cursor) in planned {
            let source = adapter.source_id().clone();
            let cursor = match cursor {
                Ok(cursor) => cursor,
                Err(e) => {
                    handles.push((
                        source.clone(),
                        SyncCursor::zero(),
                        Err(SourceReport::failed(
                            source,
                            SyncCursor::zero(),
                            SourceFailure::State(e.to_string()),
                        )),
                    ));
                    continue;
                }
            };

            let task = SourceTask {
                adapter,
                state: self.state.clone(),
                sink: self.sink.clone(),
                engine: self.engine.clone(),
                normalizer: self.normalizer.clone(),
                retry: self.retry.clone(),
                batch_size: self.batch_size,
            };
            let cancel = cancel_rx.clone();
            let start_cursor = cursor.clone();

            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let mut report = SourceReport::new(task.adapter.source_id().clone(), cursor);

                // A panicking adapter still settles through `finish`, so the
                // batches it committed and its failure count are reported
                let guarded = AssertUnwindSafe(task.run(&mut report)).catch_unwind();
                let outcome = tokio::select! {
                    result = tokio::time::timeout_at(deadline, guarded) => match result {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(panic)) => {
                            let message = panic_message(&panic);
                            error!(source = %task.adapter.source_id(), panic = %message, "Source task panicked");
                            Err(SourceFailure::Aborted(format!("panicked: {}", message)))
                        }
                        Err(_) => Err(SourceFailure::Timeout { seconds: timeout_secs }),
                    },
                    _ = cancelled(cancel) => Err(SourceFailure::Cancelled),
                };

                task.finish(&mut report, outcome).await;
                report.duration_ms = started.elapsed().as_millis() as u64;
                report
            });

            handles.push((source, start_cursor, Ok(handle)));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (source, cursor, handle) in handles {
            let report = match handle {
                Ok(handle) => match handle.await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(%source, error = %e, "Source task aborted");
                        SourceReport::failed(source, cursor, SourceFailure::Aborted(e.to_string()))
                    }
                },
                Err(report) => report,
            };
            reports.push(report);
        }
        watcher.abort();

        let run = SyncRun::complete(run_id, started_at, reports);
        let totals = run.totals();
        info!(
            outcome = ?run.outcome,
            listed = totals.listed,
            written = totals.written,
            rejected = totals.rejected,
            duration_ms = run.duration_ms,
            "Sync run finished"
        );
        run
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolves once the cancel flag is raised
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling: never fire
            std::future::pending::<()>().await;
        }
    }
}

/// Everything one source needs inside its task
struct SourceTask {
    adapter: Arc<dyn SourceAdapter>,
    state: Arc<dyn SyncStateStore>,
    sink: Arc<dyn Sink>,
    engine: Arc<DedupEngine>,
    normalizer: Normalizer,
    retry: RetryPolicy,
    batch_size: usize,
}

impl SourceTask {
    #[instrument(skip_all, fields(source = %self.adapter.source_id()))]
    async fn run(&self, report: &mut SourceReport) -> Result<(), SourceFailure> {
        report.state = SourceState::Listing;

        let adapter = &self.adapter;
        let since = &report.cursor_before.clone();
        let listing = retry_transient(&self.retry, "list", move || adapter.list_available(since)).await;
        report.listing_attempts = listing.attempts;

        let items = match listing.result {
            Ok(items) => items,
            Err(FetchError::Transient(message) | FetchError::NotYetAvailable(message)) => {
                return Err(SourceFailure::ListingExhausted {
                    attempts: listing.attempts,
                    message,
                })
            }
            Err(FetchError::Permanent(message)) => {
                return Err(SourceFailure::ListingPermanent(message))
            }
        };
        report.counts.listed = items.len() as u64;
        info!(listed = items.len(), "Listing complete");

        if items.is_empty() && report.cursor_after.consecutive_failures > 0 {
            // Nothing new, but the source is healthy again
            let cleared = SyncCursor {
                consecutive_failures: 0,
                last_success: Some(Utc::now()),
                ..report.cursor_after.clone()
            };
            self.commit(report, cleared).await?;
        }

        let mut pinned = false;
        for batch in items.chunks(self.batch_size) {
            let mut resolved = None;

            for item in batch {
                match self.process_item(item, report).await? {
                    Resolution::Deferred => pinned = true,
                    Resolution::Stored | Resolution::Rejected if !pinned => {
                        resolved = Some(item.watermark.clone());
                    }
                    _ => {}
                }
            }

            if let Some(watermark) = resolved {
                let next = report.cursor_after.advanced_to(watermark, Utc::now());
                self.commit(report, next).await?;
                report.counts.batches_committed += 1;
            }
        }

        Ok(())
    }

    async fn process_item(
        &self,
        item: &ItemRef,
        report: &mut SourceReport,
    ) -> Result<Resolution, SourceFailure> {
        report.state = SourceState::Fetching;
        let adapter = &self.adapter;
        let fetched = retry_transient(&self.retry, "fetch", move || adapter.fetch(item)).await;

        let raw = match fetched.result {
            Ok(raw) => raw,
            Err(FetchError::NotYetAvailable(reason)) => {
                debug!(item = %item.native_id, %reason, "Not published yet, cursor held");
                report.counts.deferred += 1;
                return Ok(Resolution::Deferred);
            }
            Err(e) => {
                let deferred = e.is_transient();
                warn!(
                    item = %item.native_id,
                    attempts = fetched.attempts,
                    error = %e,
                    "Fetch failed"
                );
                report.reject(item.native_id.clone(), RejectStage::Fetch, e.to_string(), deferred);
                return Ok(if deferred {
                    Resolution::Deferred
                } else {
                    Resolution::Rejected
                });
            }
        };
        report.counts.fetched += 1;

        report.state = SourceState::Normalizing;
        let normalized = self.normalizer.normalize(&raw, self.adapter.schema_hint());
        report.counts.normalized += normalized.observations.len() as u64;
        report.counts.missing += normalized.missing;

        for err in normalized.errors {
            debug!(item = %item.native_id, error = %err, "Record rejected");
            let record = err.record.clone().unwrap_or_else(|| item.native_id.clone());
            report.reject(record, RejectStage::Normalize, err.to_string(), false);
        }

        for observation in normalized.observations {
            self.absorb(observation, report)
                .await
                .map_err(|e| SourceFailure::Persist(e.to_string()))?;
        }

        Ok(Resolution::Stored)
    }

    /// Dedup one observation and persist the outcome
    async fn absorb(
        &self,
        observation: CanonicalObservation,
        report: &mut SourceReport,
    ) -> Result<(), PersistError> {
        report.state = SourceState::Merging;
        let key = self.engine.key_for(&observation);
        let mut index = self.engine.lock().await;

        let sink = &self.sink;
        let key_ref = &key;

        if !index.contains(key_ref) {
            let stored = retry_transient(&self.retry, "lookup", move || sink.lookup(key_ref))
                .await
                .result?;
            if let Some(stored) = stored {
                index.remember(key.clone(), stored);
            }
        }

        let record = match index.resolve(key_ref, observation) {
            MergeDecision::Discard => {
                report.counts.deduped += 1;
                return Ok(());
            }
            MergeDecision::Insert(record) => record,
            MergeDecision::Merge { record, conflict } => {
                if conflict {
                    debug!(key = %key, winner = %record.provenance.source, "Merge conflict resolved");
                }
                report.counts.merged += 1;
                record
            }
        };

        report.state = SourceState::Persisting;
        let record_ref = &record;
        retry_transient(&self.retry, "upsert", move || sink.upsert(key_ref, record_ref))
            .await
            .result?;

        index.remember(key, record);
        report.counts.written += 1;
        Ok(())
    }

    async fn commit(&self, report: &mut SourceReport, next: SyncCursor) -> Result<(), SourceFailure> {
        self.state
            .commit(&report.source, &next)
            .await
            .map_err(|e| SourceFailure::State(e.to_string()))?;
        debug!(source = %report.source, watermark = ?next.watermark, "Cursor committed");
        report.cursor_after = next;
        Ok(())
    }

    /// Settle the terminal state; failures bump the failure count only
    async fn finish(&self, report: &mut SourceReport, outcome: Result<(), SourceFailure>) {
        let source: SourceId = report.source.clone();
        match outcome {
            Ok(()) => {
                report.state = SourceState::Committed;
                info!(
                    %source,
                    written = report.counts.written,
                    rejected = report.counts.rejected,
                    "Source committed"
                );
            }
            Err(failure) => {
                warn!(%source, error = %failure, retryable = failure.is_retryable(), "Source failed");
                let failed = report.cursor_after.with_failure();
                match self.state.commit(&source, &failed).await {
                    Ok(()) => report.cursor_after = failed,
                    Err(e) => error!(%source, error = %e, "Could not record failure count"),
                }
                report.state = failure.into_state();
            }
        }
    }
}
