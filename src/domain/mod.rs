//! Domain types for the synchronization orchestrator.
//!
//! - Observation: canonical schema, raw items, provenance
//! - Cursor: per-source watermark
//! - Run: sync run records and per-source reports

pub mod cursor;
pub mod observation;
pub mod run;

// Re-export commonly used types
pub use cursor::{SyncCursor, Watermark};
pub use observation::{
    CanonicalObservation, Position, Provenance, QualityFlag, RawItem, SourceId, Unit,
    VariableType, GRID_STATION,
};
pub use run::{
    RejectStage, Rejection, RunCounts, RunOutcome, SourceFailure, SourceOutcome, SourceReport,
    SourceState, SyncRun,
};
