//! NCEI access data service (GHCN daily summaries).
//!
//! Coastal stations give daily air temperature extremes and precipitation.
//! Requests metric units with station locations included, so positions come
//! straight from the payload.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use super::http::{daily_granules, granule_refs, ProviderClient};
use super::{FetchError, ItemRef, SourceAdapter};
use crate::config::{NceiConfig, Region};
use crate::core::normalize::{PayloadFormat, SchemaHint};
use crate::domain::{QualityFlag, RawItem, SourceId, SyncCursor};

const DEFAULT_QUALITY: f64 = 0.7;

pub struct NceiAdapter {
    source: SourceId,
    config: NceiConfig,
    client: ProviderClient,
    hint: SchemaHint,
}

impl NceiAdapter {
    /// Stations are chosen explicitly, so the region is not applied here
    pub fn new(config: &NceiConfig, _region: &Region) -> Result<Self> {
        let source = SourceId::new("ncei");
        let quality = config.settings.default_quality.unwrap_or(DEFAULT_QUALITY);

        Ok(Self {
            client: ProviderClient::new(source.clone(), &config.settings, None)?,
            source,
            config: config.clone(),
            hint: SchemaHint::new(PayloadFormat::Csv)
                .with_station_column("station")
                .with_unit("tmax", "degC")
                .with_unit("tmin", "degC")
                .with_unit("prcp", "mm")
                .with_quality(QualityFlag::new(quality)),
        })
    }

    pub fn granule_url(&self, day: NaiveDate) -> String {
        format!(
            "{}?dataset={}&stations={}&startDate={}&endDate={}&dataTypes={}\
             &units=metric&includeStationLocation=1&format=csv",
            self.config.base_url,
            self.config.dataset,
            self.config.stations.join(","),
            day,
            day,
            self.config.data_types.join(","),
        )
    }
}

#[async_trait]
impl SourceAdapter for NceiAdapter {
    fn source_id(&self) -> &SourceId {
        &self.source
    }

    fn schema_hint(&self) -> &SchemaHint {
        &self.hint
    }

    async fn list_available(&self, since: &SyncCursor) -> Result<Vec<ItemRef>, FetchError> {
        if self.config.stations.is_empty() {
            return Err(FetchError::Permanent("no NCEI stations configured".to_string()));
        }
        let days = daily_granules(since, &self.config.settings, Utc::now());
        Ok(granule_refs(&self.config.dataset, days, |d| self.granule_url(d)))
    }

    async fn fetch(&self, item: &ItemRef) -> Result<RawItem, FetchError> {
        let payload = self.client.get(&item.locator).await?;
        Ok(RawItem::new(self.source.clone(), item.native_id.clone(), payload))
    }
}
