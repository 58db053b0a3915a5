//! Per-source synchronization cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How far a source has been synchronized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Watermark {
    /// Everything up to and including this instant is stored
    Timestamp(DateTime<Utc>),

    /// Opaque provider token (page cursor, sequence number)
    Token(String),
}

impl Watermark {
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Token(_) => None,
        }
    }
}

/// Durable cursor for one source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// None until the first successful batch
    pub watermark: Option<Watermark>,

    /// When a batch was last committed
    pub last_success: Option<DateTime<Utc>>,

    /// Failed runs since the last success
    pub consecutive_failures: u32,
}

impl SyncCursor {
    /// Cursor of a source that has never been synchronized
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.watermark.is_none()
    }

    /// Cursor after a successfully stored batch ending at `watermark`
    pub fn advanced_to(&self, watermark: Watermark, at: DateTime<Utc>) -> Self {
        Self {
            watermark: Some(watermark),
            last_success: Some(at),
            consecutive_failures: 0,
        }
    }

    /// Same watermark, one more failure
    pub fn with_failure(&self) -> Self {
        Self {
            watermark: self.watermark.clone(),
            last_success: self.last_success,
            consecutive_failures: self.consecutive_failures.saturating_add(1),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.watermark.as_ref().and_then(Watermark::as_timestamp)
    }
}
