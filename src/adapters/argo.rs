//! Argo float profiles via ERDDAP tabledap.
//!
//! One granule per day of profiles inside the region. Per-value QC flags
//! (`temp_qc`, `psal_qc`) become the observation quality.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};

use super::http::{daily_granules, empty_answer, granule_refs, is_erddap_empty, ProviderClient};
use super::{FetchError, ItemRef, SourceAdapter};
use crate::config::{ArgoConfig, Region};
use crate::core::normalize::{PayloadFormat, SchemaHint};
use crate::domain::{QualityFlag, RawItem, SourceId, SyncCursor};

const COLUMNS: &str = "platform_number,time,latitude,longitude,pres,temp,psal,temp_qc,psal_qc";

pub struct ArgoAdapter {
    source: SourceId,
    config: ArgoConfig,
    region: Region,
    client: ProviderClient,
    hint: SchemaHint,
}

impl ArgoAdapter {
    pub fn new(config: &ArgoConfig, region: &Region) -> Result<Self> {
        let source = SourceId::new("argo");
        let quality = config
            .settings
            .default_quality
            .map(QualityFlag::new)
            .unwrap_or(QualityFlag::UNKNOWN);

        Ok(Self {
            client: ProviderClient::new(source.clone(), &config.settings, None)?,
            source,
            config: config.clone(),
            region: region.clone(),
            hint: SchemaHint::new(PayloadFormat::ErddapCsv)
                .with_station_column("platform_number")
                .with_quality(quality),
        })
    }

    pub fn granule_url(&self, day: NaiveDate) -> String {
        let r = &self.region;
        let next = day.checked_add_days(Days::new(1)).unwrap_or(day);
        format!(
            "{}/tabledap/{}.csv?{}&time>={}T00:00:00Z&time<{}T00:00:00Z\
             &latitude>={}&latitude<={}&longitude>={}&longitude<={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.dataset,
            COLUMNS,
            day,
            next,
            r.lat_min,
            r.lat_max,
            r.lon_min,
            r.lon_max,
        )
    }
}

#[async_trait]
impl SourceAdapter for ArgoAdapter {
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
