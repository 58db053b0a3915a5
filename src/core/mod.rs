//! Core synchronization logic.
//!
//! This module contains:
//! - Normalize: provider payloads to canonical observations
//! - Dedup: dedup keys, merge policy and the bounded dedup window
//! - StateStore: durable per-source cursors
//! - Retry: transient-failure retry with backoff
//! - Orchestrator: per-source pipeline and run lifecycle
//! - Report: run report persistence

pub mod dedup;
pub mod normalize;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod state_store;

// Re-export commonly used types
pub use dedup::{DedupEngine, DedupKey, DedupSettings, MergeDecision, MergePolicy};
pub use normalize::{NormalizationError, NormalizedItem, Normalizer, PayloadFormat, SchemaHint};
pub use orchestrator::Orchestrator;
pub use report::RunLog;
pub use retry::{RetryPolicy, Retryable};
pub use state_store::{
    FileStateStore, SqliteStateStore, StateBackendKind, StateError, SyncStateStore,
};
