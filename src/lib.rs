//! ocean-sync - incremental synchronization of oceanographic observations
//!
//! Pulls data from NOAA ERDDAP, Copernicus Marine, Argo floats and NCEI,
//! normalizes it into one canonical observation schema, deduplicates
//! across providers and stores the result.
//!
//! # Architecture
//!
//! Every source keeps a durable cursor:
//! - A run lists what each provider has published since its cursor
//! - Items are fetched, normalized and merged in batches
//! - The cursor only moves after a batch is stored, so a crashed run is
//!   replayed without duplicates
//!
//! # Modules
//!
//! - `adapters`: Provider integrations (NOAA, Copernicus, Argo, NCEI)
//! - `core`: Normalization, dedup, cursors and the orchestrator
//! - `domain`: Data structures (observations, cursors, run reports)
//! - `sink`: Observation storage
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Sync every enabled source
//! ocean-sync sync
//!
//! # Only two sources, JSON report
//! ocean-sync sync --sources noaa,argo --json
//!
//! # Inspect cursors
//! ocean-sync status
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod sink;

// Re-export main types at crate root for convenience
pub use config::{load_config, ResolvedConfig, SyncConfig};
pub use core::{Orchestrator, RunLog};
pub use domain::{CanonicalObservation, RunOutcome, SourceId, SyncCursor, SyncRun};
