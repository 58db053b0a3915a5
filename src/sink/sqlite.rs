//! SQLite-backed observation sink.
//!
//! One row per dedup key. The full record is kept as JSON next to the
//! indexed columns so `lookup` returns exactly what was stored.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension};

use super::{PersistError, Sink};
use crate::core::dedup::DedupKey;
use crate::domain::CanonicalObservation;

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS observations (
    dedup_key TEXT PRIMARY KEY,
    station_id TEXT NOT NULL,
    observed_at TEXT NOT NULL,
    variable TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    depth REAL NOT NULL,
    value REAL NOT NULL,
    unit TEXT NOT NULL,
    quality REAL NOT NULL,
    source TEXT NOT NULL,
    raw_id TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    contributing_sources TEXT NOT NULL,
    record_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_observations_time ON observations (variable, observed_at);
";

pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    /// Open or create the observation database at `path`
    pub fn open(path: &Path) -> Result<Self, PersistError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PersistError::Permanent(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(classify)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(classify)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, PersistError> {
        Self::init(Connection::open_in_memory().map_err(classify)?)
    }

    fn init(conn: Connection) -> Result<Self, PersistError> {
        conn.execute_batch(CREATE_TABLES).map_err(classify)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, PersistError> {
        self.conn
            .lock()
            .map_err(|_| PersistError::Permanent("sink lock poisoned".to_string()))
    }
}

/// Busy and locked databases are worth retrying; everything else is not
fn classify(err: rusqlite::Error) -> PersistError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            PersistError::Transient(err.to_string())
        }
        _ => PersistError::Permanent(err.to_string()),
    }
}

#[async_trait]
impl Sink for SqliteSink {
    async fn upsert(
        &self,
        key: &DedupKey,
        record: &CanonicalObservation,
    ) -> Result<(), PersistError> {
        let json =
            serde_json::to_string(record).map_err(|e| PersistError::Permanent(e.to_string()))?;
        let sources = record
            .contributing_sources()
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO observations (dedup_key, station_id, observed_at, variable, latitude, \
             longitude, depth, value, unit, quality, source, raw_id, fetched_at, \
             contributing_sources, record_json, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, datetime('now')) \
             ON CONFLICT(dedup_key) DO UPDATE SET station_id = ?2, observed_at = ?3, \
             variable = ?4, latitude = ?5, longitude = ?6, depth = ?7, value = ?8, unit = ?9, \
             quality = ?10, source = ?11, raw_id = ?12, fetched_at = ?13, \
             contributing_sources = ?14, record_json = ?15, updated_at = datetime('now')",
            rusqlite::params![
                key.digest(),
                record.station_id,
                record.timestamp.to_rfc3339(),
                record.variable.as_str(),
                record.position.latitude,
                record.position.longitude,
                record.position.depth,
                record.value,
                record.unit.symbol(),
                record.quality.value(),
                record.provenance.source.as_str(),
                record.provenance.raw_id,
                record.provenance.fetched_at.to_rfc3339(),
                sources,
                json,
            ],
        )
        .map_err(classify)?;
        Ok(())
    }

    async fn lookup(&self, key: &DedupKey) -> Result<Option<CanonicalObservation>, PersistError> {
        let conn = self.lock_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM observations WHERE dedup_key = ?1",
                [key.digest()],
                |row| row.get(0),
            )
            .optional()
            .map_err(classify)?;

        json.map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(|e| PersistError::Permanent(format!("corrupt stored record: {}", e)))
    }

    async fn count(&self) -> Result<u64, PersistError> {
        let conn = self.lock_conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))
            .map_err(classify)?;
        Ok(count.max(0) as u64)
    }

    async fn is_alive(&self) -> bool {
        match self.lock_conn() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => false,
        }
    }
}
