//! Durable per-source cursors.
//!
//! `commit` either fully replaces the stored cursor or leaves the previous
//! one intact. The file backend writes a temp file, syncs it and renames it
//! over the old one; the SQLite backend relies on a single upsert statement.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::domain::{SourceId, SyncCursor};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cursor for {source_id}: {message}")]
    Corrupt { source_id: String, message: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("state store lock poisoned")]
    LockPoisoned,
}

/// Which backend keeps cursors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    File,
    Sqlite,
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Stored cursor, or the zero cursor for a source never synced
    async fn get(&self, source: &SourceId) -> Result<SyncCursor, StateError>;

    /// Atomically replace the cursor of `source`
    async fn commit(&self, source: &SourceId, cursor: &SyncCursor) -> Result<(), StateError>;

    /// Every stored cursor
    async fn list(&self) -> Result<BTreeMap<SourceId, SyncCursor>, StateError>;

    /// Forget a source so the next run starts from zero
    async fn reset(&self, source: &SourceId) -> Result<bool, StateError>;
}

/// One JSON file per source under a directory
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, source: &SourceId) -> PathBuf {
        self.dir.join(format!("{}.json", source))
    }
}

#[async_trait]
impl SyncStateStore for FileStateStore {
    async fn get(&self, source: &SourceId) -> Result<SyncCursor, StateError> {
        let path = self.path_for(source);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SyncCursor::zero()),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
            source_id: source.to_string(),
            message: e.to_string(),
        })
    }

    async fn commit(&self, source: &SourceId, cursor: &SyncCursor) -> Result<(), StateError> {
        let path = self.path_for(source);
        let tmp = self.dir.join(format!(".{}.json.tmp", source));

        let json = serde_json::to_vec_pretty(cursor).map_err(|e| StateError::Corrupt {
            source_id: source.to_string(),
            message: e.to_string(),
        })?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self) -> Result<BTreeMap<SourceId, SyncCursor>, StateError> {
        let mut cursors = BTreeMap::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                let source = SourceId::new(id);
                let cursor = self.get(&source).await?;
                cursors.insert(source, cursor);
            }
        }

        Ok(cursors)
    }

    async fn reset(&self, source: &SourceId) -> Result<bool, StateError> {
        match fs::remove_file(self.path_for(source)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

const CREATE_CURSORS: &str = r"
CREATE TABLE IF NOT EXISTS sync_cursors (
    source TEXT PRIMARY KEY,
    cursor_json TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// Cursors in a SQLite table
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    pub fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(CREATE_CURSORS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_CURSORS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn decode(source: &str, json: &str) -> Result<SyncCursor, StateError> {
        serde_json::from_str(json).map_err(|e| StateError::Corrupt {
            source_id: source.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl SyncStateStore for SqliteStateStore {
    async fn get(&self, source: &SourceId) -> Result<SyncCursor, StateError> {
        let conn = self.lock_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT cursor_json FROM sync_cursors WHERE source = ?1",
                [source.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Self::decode(source.as_str(), &json),
            None => Ok(SyncCursor::zero()),
        }
    }

    async fn commit(&self, source: &SourceId, cursor: &SyncCursor) -> Result<(), StateError> {
        let json = serde_json::to_string(cursor).map_err(|e| StateError::Corrupt {
            source_id: source.to_string(),
            message: e.to_string(),
        })?;

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sync_cursors (source, cursor_json, updated_at) \
             VALUES (?1, ?2, datetime('now')) \
             ON CONFLICT(source) DO UPDATE SET cursor_json = ?2, updated_at = datetime('now')",
            rusqlite::params![source.as_str(), json],
        )?;
        Ok(())
    }

    async fn list(&self) -> Result<BTreeMap<SourceId, SyncCursor>, StateError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT source, cursor_json FROM sync_cursors ORDER BY source")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut cursors = BTreeMap::new();
        for row in rows {
            let (source, json) = row?;
            let cursor = Self::decode(&source, &json)?;
            cursors.insert(SourceId::new(source), cursor);
        }
        Ok(cursors)
    }

    async fn reset(&self, source: &SourceId) -> Result<bool, StateError> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM sync_cursors WHERE source = ?1",
            [source.as_str()],
        )?;
        Ok(removed > 0)
    }
}
