//! Storage sinks for canonical observations.
//!
//! A sink stores at most one record per [`DedupKey`]; `upsert` replaces the
//! stored record so replaying a batch leaves the sink unchanged.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::dedup::DedupKey;
use crate::core::retry::Retryable;
use crate::domain::CanonicalObservation;

pub use memory::MemorySink;
pub use sqlite::SqliteSink;

/// A write or read against the sink failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    /// Busy/locked/unreachable; the same call may succeed later
    #[error("sink temporarily unavailable: {0}")]
    Transient(String),

    #[error("sink rejected write: {0}")]
    Permanent(String),
}

impl Retryable for PersistError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Durable store of merged observations
#[async_trait]
pub trait Sink: Send + Sync {
    /// Insert or replace the record stored under `key`
    async fn upsert(&self, key: &DedupKey, record: &CanonicalObservation)
        -> Result<(), PersistError>;

    /// Record currently stored under `key`
    async fn lookup(&self, key: &DedupKey) -> Result<Option<CanonicalObservation>, PersistError>;

    /// Number of stored records
    async fn count(&self) -> Result<u64, PersistError>;

    /// Reachability check run before a sync starts
    async fn is_alive(&self) -> bool;
}
