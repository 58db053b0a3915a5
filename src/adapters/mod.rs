//! Source adapters for upstream providers.
//!
//! Each provider implements [`SourceAdapter`]: enumerate what is available
//! since a cursor, fetch one item, and describe its payload layout to the
//! normalizer. Adapters never touch the sink or the state store.

pub mod argo;
pub mod copernicus;
pub mod http;
pub mod ncei;
pub mod noaa;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;

use crate::config::ResolvedConfig;
use crate::core::normalize::SchemaHint;
use crate::core::retry::Retryable;
use crate::domain::{RawItem, SourceId, SyncCursor, Watermark};

pub use argo::ArgoAdapter;
pub use copernicus::CopernicusAdapter;
pub use ncei::NceiAdapter;
pub use noaa::NoaaAdapter;

/// Listing or fetching failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Timeouts, throttling, 5xx: worth retrying
    #[error("transient: {0}")]
    Transient(String),

    /// The request itself is wrong or the item is gone
    #[error("permanent: {0}")]
    Permanent(String),

    /// The provider has not published this item yet; list it again next run
    #[error("not yet available: {0}")]
    NotYetAvailable(String),
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One item available upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    /// Provider-native identifier, e.g. "jplMURSST41:2024-03-01"
    pub native_id: String,

    /// Where to fetch it from
    pub locator: String,

    /// Cursor position once this item is resolved
    pub watermark: Watermark,
}

/// Trait for upstream providers
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable provider id ("noaa", "argo", ...)
    fn source_id(&self) -> &SourceId;

    /// Payload layout handed to the normalizer
    fn schema_hint(&self) -> &SchemaHint;

    /// Items newer than `since`, ordered by watermark. Empty when nothing is new.
    async fn list_available(&self, since: &SyncCursor) -> Result<Vec<ItemRef>, FetchError>;

    /// Download one listed item
    async fn fetch(&self, item: &ItemRef) -> Result<RawItem, FetchError>;
}

/// Build the adapters for every enabled source, in configuration order
pub fn build_adapters(config: &ResolvedConfig) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let settings = &config.settings;
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();

    for source in &settings.sources {
        let adapter: Arc<dyn SourceAdapter> = match source.as_str() {
            "noaa" => Arc::new(NoaaAdapter::new(&settings.noaa, &settings.region)?),
            "copernicus" => Arc::new(CopernicusAdapter::new(
                &settings.copernicus,
                &settings.region,
                config.credentials("copernicus"),
            )?),
            "argo" => Arc::new(ArgoAdapter::new(&settings.argo, &settings.region)?),
            "ncei" => Arc::new(NceiAdapter::new(&settings.ncei, &settings.region)?),
            other => bail!("No adapter for source '{}'", other),
        };
        adapters.push(adapter);
    }

    Ok(adapters)
}
