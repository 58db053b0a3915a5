//! NOAA ERDDAP griddap adapter.
//!
//! Requests one day of a gridded SST product (MUR by default) subset to the
//! configured region. ERDDAP CSV carries a units row, so Kelvin or Celsius
//! products both normalize without extra hints.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use super::http::{daily_granules, empty_answer, granule_refs, is_erddap_empty, ProviderClient};
use super::{FetchError, ItemRef, SourceAdapter};
use crate::config::{NoaaConfig, Region};
use crate::core::normalize::{PayloadFormat, SchemaHint};
use crate::domain::{QualityFlag, RawItem, SourceId, SyncCursor};

/// Gap-filled L4 analyses are trustworthy but not in-situ
const DEFAULT_QUALITY: f64 = 0.8;

pub struct NoaaAdapter {
    source: SourceId,
    config: NoaaConfig,
    region: Region,
    client: ProviderClient,
    hint: SchemaHint,
}

impl NoaaAdapter {
    pub fn new(config: &NoaaConfig, region: &Region) -> Result<Self> {
        let source = SourceId::new("noaa");
        let quality = config.settings.default_quality.unwrap_or(DEFAULT_QUALITY);

        Ok(Self {
            client: ProviderClient::new(source.clone(), &config.settings, None)?,
            source,
            config: config.clone(),
            region: region.clone(),
            hint: SchemaHint::new(PayloadFormat::ErddapCsv).with_quality(QualityFlag::new(quality)),
        })
    }

    /// griddap query for one day over the region
    pub fn granule_url(&self, day: NaiveDate) -> String {
        let r = &self.region;
        let stride = self.config.stride.max(1);
        format!(
            "{}/griddap/{}.csv?{}[({}T00:00:00Z):1:({}T23:59:59Z)][({}):{}:({})][({}):{}:({})]",
            self.config.base_url.trim_end_matches('/'),
            self.config.dataset,
            self.config.variable,
            day,
            day,
            r.lat_min,
            stride,
            r.lat_max,
            r.lon_min,
            stride,
            r.lon_max,
        )
    }
}

#[async_trait]
impl SourceAdapter for NoaaAdapter {
    fn source_id(&self) -> &SourceId {
        &self.source
    }

    fn schema_hint(&self) -> &SchemaHint {
        &self.hint
    }

    async fn list_available(&self, since: &SyncCursor) -> Result<Vec<ItemRef>, FetchError> {
        let days = daily_granules(since, &self.config.settings, Utc::now());
        Ok(granule_refs(&self.config.dataset, days, |d| self.granule_url(d)))
    }

    async fn fetch(&self, item: &ItemRef) -> Result<RawItem, FetchError> {
        let payload = match self.client.get(&item.locator).await {
            Ok(body) => body,
            Err(e) if is_erddap_empty(&e) => {
                empty_answer(item, &self.config.settings, Utc::now())?
            }
            Err(e) => return Err(e),
        };
        Ok(RawItem::new(self.source.clone(), item.native_id.clone(), payload))
    }
}
