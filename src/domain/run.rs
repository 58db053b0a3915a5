//! Sync run records.
//!
//! A [`SyncRun`] is one invocation of the orchestrator. Each enabled source
//! contributes a [`SourceReport`]; once the run finishes the record is
//! immutable and is written out as the run report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::cursor::SyncCursor;
use super::observation::SourceId;

/// Pipeline state of one source within one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SourceState {
    Pending,
    Listing,
    Fetching,
    Normalizing,
    Merging,
    Persisting,
    Committed,
    Failed { reason: String, retryable: bool },
}

impl SourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed { .. })
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Listing => "listing",
            Self::Fetching => "fetching",
            Self::Normalizing => "normalizing",
            Self::Merging => "merging",
            Self::Persisting => "persisting",
            Self::Committed => "committed",
            Self::Failed { .. } => "failed",
        }
    }
}

impl Default for SourceState {
    fn default() -> Self {
        Self::Pending
    }
}

/// Why a source ended the run FAILED
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceFailure {
    #[error("listing failed after {attempts} attempts: {message}")]
    ListingExhausted { attempts: u32, message: String },

    #[error("listing rejected: {0}")]
    ListingPermanent(String),

    #[error("persist failed: {0}")]
    Persist(String),

    #[error("state store error: {0}")]
    State(String),

    #[error("run timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("run cancelled")]
    Cancelled,

    #[error("source task aborted: {0}")]
    Aborted(String),
}

impl SourceFailure {
    /// Whether the next invocation can expect to make progress
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ListingPermanent(_))
    }

    pub fn into_state(self) -> SourceState {
        SourceState::Failed {
            retryable: self.is_retryable(),
            reason: self.to_string(),
        }
    }
}

/// Pipeline stage an item was rejected in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectStage {
    Fetch,
    Normalize,
}

/// Rejection entries kept per source; the counter keeps counting past it
pub const MAX_REJECTION_ENTRIES: usize = 500;

/// A rejected item or record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub native_id: String,
    pub stage: RejectStage,
    pub error: String,
    /// True when a later run may succeed (transient fetch exhaustion)
    #[serde(default)]
    pub retryable: bool,
}

/// Per-source counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Item refs returned by listing
    pub listed: u64,
    /// Raw items fetched successfully
    pub fetched: u64,
    /// Observations produced by the normalizer
    pub normalized: u64,
    /// Observations merged into an existing record
    pub merged: u64,
    /// Observations discarded as duplicates
    pub deduped: u64,
    /// Records upserted into the sink
    pub written: u64,
    /// Items or records rejected (fetch or normalization)
    pub rejected: u64,
    /// Empty/NaN cells skipped during normalization
    pub missing: u64,
    /// Items the provider has not published yet
    #[serde(default)]
    pub deferred: u64,
    /// Batches whose cursor was committed
    pub batches_committed: u64,
}

/// Outcome of one source within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: SourceId,
    pub state: SourceState,
    pub counts: RunCounts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<Rejection>,
    pub cursor_before: SyncCursor,
    pub cursor_after: SyncCursor,
    pub listing_attempts: u32,
    pub duration_ms: u64,
}

impl SourceReport {
    pub fn new(source: SourceId, cursor: SyncCursor) -> Self {
        Self {
            source,
            state: SourceState::Pending,
            counts: RunCounts::default(),
            rejections: Vec::new(),
            cursor_after: cursor.clone(),
            cursor_before: cursor,
            listing_attempts: 0,
            duration_ms: 0,
        }
    }

    /// Report for a source whose task never produced one
    pub fn failed(source: SourceId, cursor: SyncCursor, failure: SourceFailure) -> Self {
        let mut report = Self::new(source, cursor);
        report.state = failure.into_state();
        report
    }

    pub fn reject(
        &mut self,
        native_id: impl Into<String>,
        stage: RejectStage,
        error: String,
        retryable: bool,
    ) {
        self.counts.rejected += 1;
        if self.rejections.len() < MAX_REJECTION_ENTRIES {
            self.rejections.push(Rejection {
                native_id: native_id.into(),
                stage,
                error,
                retryable,
            });
        }
    }

    /// Success / partial / failure as seen from the run report
    pub fn outcome(&self) -> SourceOutcome {
        match self.state {
            SourceState::Committed if self.counts.rejected == 0 => SourceOutcome::Success,
            SourceState::Committed => SourceOutcome::Partial,
            _ => SourceOutcome::Failure,
        }
    }
}

/// Per-source outcome summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceOutcome {
    Success,
    Partial,
    Failure,
}

/// Overall result of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunOutcome {
    /// Every enabled source committed
    Success,

    /// Some sources committed, others failed
    Partial,

    /// Nothing could be processed
    Failed { error: String },
}

impl RunOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Partial => 2,
            Self::Failed { .. } => 1,
        }
    }
}

/// One orchestrator invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    pub sources: BTreeMap<SourceId, SourceReport>,
}

impl SyncRun {
    /// Finalize a run from its source reports
    pub fn complete(id: Uuid, started_at: DateTime<Utc>, reports: Vec<SourceReport>) -> Self {
        let sources: BTreeMap<SourceId, SourceReport> = reports
            .into_iter()
            .map(|report| (report.source.clone(), report))
            .collect();

        let committed = sources.values().filter(|r| r.state.is_committed()).count();
        let outcome = if sources.is_empty() {
            RunOutcome::Failed {
                error: "no sources enabled".to_string(),
            }
        } else if committed == sources.len() {
            RunOutcome::Success
        } else if committed > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Failed {
                error: "no source reached committed".to_string(),
            }
        };

        Self::finish(id, started_at, outcome, sources)
    }

    /// Run that could not start at all (state store or sink unreachable)
    pub fn aborted(id: Uuid, started_at: DateTime<Utc>, error: String) -> Self {
        Self::finish(id, started_at, RunOutcome::Failed { error }, BTreeMap::new())
    }

    fn finish(
        id: Uuid,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
        sources: BTreeMap<SourceId, SourceReport>,
    ) -> Self {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            id,
            started_at,
            completed_at,
            duration_ms,
            outcome,
            sources,
        }
    }

    /// Sum of counters across sources
    pub fn totals(&self) -> RunCounts {
        self.sources.values().fold(RunCounts::default(), |mut acc, r| {
            acc.listed += r.counts.listed;
            acc.fetched += r.counts.fetched;
            acc.normalized += r.counts.normalized;
            acc.merged += r.counts.merged;
            acc.deduped += r.counts.deduped;
            acc.written += r.counts.written;
            acc.rejected += r.counts.rejected;
            acc.missing += r.counts.missing;
            acc.deferred += r.counts.deferred;
            acc.batches_committed += r.counts.batches_committed;
            acc
        })
    }

    pub fn source(&self, id: &str) -> Option<&SourceReport> {
        self.sources.get(&SourceId::new(id))
    }
}
