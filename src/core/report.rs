//! Run reports.
//!
//! Every finished [`SyncRun`] is written twice: as `<id>.json` for
//! `show`, and as one line of `history.jsonl` for `runs`. The history is
//! append-only, newest line last.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::SyncRun;

/// File-based run report store
pub struct RunLog {
    runs_dir: PathBuf,
    history_path: PathBuf,
}

impl RunLog {
    pub async fn open(runs_dir: impl Into<PathBuf>) -> Result<Self> {
        let runs_dir = runs_dir.into();
        fs::create_dir_all(&runs_dir)
            .await
            .with_context(|| format!("Failed to create runs directory: {}", runs_dir.display()))?;

        Ok(Self {
            history_path: runs_dir.join("history.jsonl"),
            runs_dir,
        })
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    fn report_path(&self, id: Uuid) -> PathBuf {
        self.runs_dir.join(format!("{}.json", id))
    }

    /// Persist a finished run
    pub async fn record(&self, run: &SyncRun) -> Result<PathBuf> {
        let path = self.report_path(run.id);
        let pretty = serde_json::to_string_pretty(run).context("Failed to serialize run report")?;
        fs::write(&path, pretty)
            .await
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .await
            .with_context(|| {
                format!("Failed to open history file: {}", self.history_path.display())
            })?;

        let json = serde_json::to_string(run).context("Failed to serialize run report")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to append run history")?;
        file.flush().await.context("Failed to flush run history")?;

        Ok(path)
    }

    /// Load one run report
    pub async fn load(&self, id: Uuid) -> Result<Option<SyncRun>> {
        let path = self.report_path(id);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read run report: {}", path.display()))?;
        let run = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run report: {}", path.display()))?;
        Ok(Some(run))
    }

    /// Most recent runs, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<SyncRun>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.history_path).await.with_context(|| {
            format!("Failed to open history file: {}", self.history_path.display())
        })?;

        let mut lines = BufReader::new(file).lines();
        let mut runs = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let run: SyncRun = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse history line: {}", line))?;
            runs.push(run);
        }

        runs.reverse();
        runs.truncate(limit);
        Ok(runs)
    }
}
