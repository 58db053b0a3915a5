//! Copernicus Marine adapter.
//!
//! Pulls a daily CSV subset of the global L4 SST analysis. The service
//! reports `analysed_sst` in Kelvin without a units row, so the unit comes
//! from the schema hint. Requires `COPERNICUS_USERNAME`/`COPERNICUS_PASSWORD`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::warn;

use super::http::{daily_granules, granule_refs, ProviderClient};
use super::{FetchError, ItemRef, SourceAdapter};
use crate::config::{CopernicusConfig, Credentials, Region};
use crate::core::normalize::{PayloadFormat, SchemaHint};
use crate::domain::{QualityFlag, RawItem, SourceId, SyncCursor};

const DEFAULT_QUALITY: f64 = 0.8;

pub struct CopernicusAdapter {
    source: SourceId,
    config: CopernicusConfig,
    region: Region,
    client: ProviderClient,
    has_credentials: bool,
    hint: SchemaHint,
}

impl CopernicusAdapter {
    pub fn new(
        config: &CopernicusConfig,
        region: &Region,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let source = SourceId::new("copernicus");
        if credentials.is_none() {
            warn!(source = %source, "No credentials configured; listing will fail");
        }

        let quality = config.settings.default_quality.unwrap_or(DEFAULT_QUALITY);
        let hint = SchemaHint::new(PayloadFormat::Csv)
            .with_unit(&config.variable, "kelvin")
            .with_quality(QualityFlag::new(quality));

        Ok(Self {
            has_credentials: credentials.is_some(),
            client: ProviderClient::new(source.clone(), &config.settings, credentials)?,
            source,
            config: config.clone(),
            region: region.clone(),
            hint,
        })
    }

    pub fn granule_url(&self, day: NaiveDate) -> String {
        let r = &self.region;
        format!(
            "{}?dataset_id={}&variable={}&start_datetime={}T00:00:00Z&end_datetime={}T23:59:59Z\
             &minimum_latitude={}&maximum_latitude={}&minimum_longitude={}&maximum_longitude={}\
             &format=csv",
            self.config.base_url,
            self.config.dataset,
            self.config.variable,
            day,
            day,
            r.lat_min,
            r.lat_max,
            r.lon_min,
            r.lon_max,
        )
    }
}

#[async_trait]
impl SourceAdapter for CopernicusAdapter {
    fn source_id(&self) -> &SourceId {
        &self.source
    }

    fn schema_hint(&self) -> &SchemaHint {
        &self.hint
    }

    async fn list_available(&self, since: &SyncCursor) -> Result<Vec<ItemRef>, FetchError> {
        if !self.has_credentials {
            return Err(FetchError::Permanent(
                "COPERNICUS_USERNAME and COPERNICUS_PASSWORD are not set".to_string(),
            ));
        }
        let days = daily_granules(since, &self.config.settings, Utc::now());
        Ok(granule_refs(&self.config.dataset, days, |d| self.granule_url(d)))
    }

    async fn fetch(&self, item: &ItemRef) -> Result<RawItem, FetchError> {
        let payload = self.client.get(&item.locator).await?;
        Ok(RawItem::new(self.source.clone(), item.native_id.clone(), payload))
    }
}
