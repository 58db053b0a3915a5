//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

use ocean_sync::adapters::{FetchError, ItemRef, SourceAdapter};
use ocean_sync::config::SyncConfig;
use ocean_sync::core::dedup::DedupKey;
use ocean_sync::core::normalize::{PayloadFormat, SchemaHint};
use ocean_sync::core::retry::RetryPolicy;
use ocean_sync::domain::{
    CanonicalObservation, QualityFlag, RawItem, SourceId, SyncCursor, Watermark,
};
use ocean_sync::sink::{MemorySink, PersistError, Sink};

pub const HEADER: &str = "time,latitude,longitude,sst";

/// Fixed fetch time so replayed granules are byte-for-byte the same items
pub fn fetch_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

pub fn midnight(d: u32) -> DateTime<Utc> {
    day(d).and_time(NaiveTime::MIN).and_utc()
}

/// One CSV row of gridded SST on `d`
pub fn row(d: u32, lat: f64, lon: f64, sst: f64) -> String {
    format!("{}T12:00:00Z,{},{},{}", day(d), lat, lon, sst)
}

pub fn csv(rows: &[String]) -> String {
    let mut body = String::from(HEADER);
    for r in rows {
        body.push('\n');
        body.push_str(r);
    }
    body.push('\n');
    body
}

/// Config with fast retries and small batches
pub fn test_config() -> SyncConfig {
    SyncConfig {
        batch_size: 2,
        run_timeout_seconds: 30,
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        },
        ..SyncConfig::default()
    }
}

/// How a scripted call behaves
#[derive(Debug, Clone)]
pub enum Script {
    /// Fail with this error on every call
    Always(FetchError),
    /// Fail with this error for the first n calls, then succeed
    Times(u32, FetchError),
}

/// In-process provider serving one CSV granule per day
pub struct ScriptedAdapter {
    source: SourceId,
    hint: SchemaHint,
    granules: Vec<(NaiveDate, String)>,
    listing: Mutex<Option<Script>>,
    fetches: Mutex<HashMap<NaiveDate, Script>>,
    delay: Option<Duration>,
    panic_from: Option<NaiveDate>,
    pub list_calls: AtomicU32,
    pub fetch_calls: AtomicU32,
}

impl ScriptedAdapter {
    pub fn new(source: &str, quality: f64) -> Self {
        Self {
            source: SourceId::new(source),
            hint: SchemaHint::new(PayloadFormat::Csv).with_quality(QualityFlag::new(quality)),
            granules: Vec::new(),
            listing: Mutex::new(None),
            fetches: Mutex::new(HashMap::new()),
            delay: None,
            panic_from: None,
            list_calls: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
        }
    }

    /// Declare the unit of a payload column, as a provider hint would
    pub fn with_unit(mut self, column: &str, unit: &str) -> Self {
        self.hint = self.hint.with_unit(column, unit);
        self
    }

    pub fn granule(mut self, d: u32, body: String) -> Self {
        self.granules.push((day(d), body));
        self.granules.sort_by_key(|(day, _)| *day);
        self
    }

    pub fn failing_listing(self, script: Script) -> Self {
        *self.listing.lock().unwrap() = Some(script);
        self
    }

    pub fn failing_fetch(self, d: u32, script: Script) -> Self {
        self.fetches.lock().unwrap().insert(day(d), script);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn panicking(self) -> Self {
        self.panicking_from(1)
    }

    /// Panic on every fetch of day `d` or later
    pub fn panicking_from(mut self, d: u32) -> Self {
        self.panic_from = Some(day(d));
        self
    }

    pub fn into_arc(self) -> Arc<dyn SourceAdapter> {
        Arc::new(self)
    }

    /// Share an adapter with the orchestrator while keeping its counters
    pub fn shared(this: &Arc<Self>) -> Arc<dyn SourceAdapter> {
        this.clone()
    }

    fn native_id(&self, d: NaiveDate) -> String {
        format!("{}:{}", self.source, d)
    }
}

/// Apply a script once; returns the error for this call, if any
fn step(script: &mut Option<Script>) -> Option<FetchError> {
    match script {
        Some(Script::Always(e)) => Some(e.clone()),
        Some(Script::Times(0, _)) => {
            *script = None;
            None
        }
        Some(Script::Times(n, e)) => {
            *n -= 1;
            Some(e.clone())
        }
        None => None,
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &SourceId {
        &self.source
    }

    fn schema_hint(&self) -> &SchemaHint {
        &self.hint
    }

    async fn list_available(&self, since: &SyncCursor) -> Result<Vec<ItemRef>, FetchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = step(&mut self.listing.lock().unwrap()) {
            return Err(e);
        }

        let after = since.timestamp();
        Ok(self
            .granules
            .iter()
            .map(|(d, _)| *d)
            .filter(|d| after.map_or(true, |ts| d.and_time(NaiveTime::MIN).and_utc() > ts))
            .map(|d| ItemRef {
                native_id: self.native_id(d),
                locator: format!("mem://{}/{}", self.source, d),
                watermark: Watermark::Timestamp(d.and_time(NaiveTime::MIN).and_utc()),
            })
            .collect())
    }

    async fn fetch(&self, item: &ItemRef) -> Result<RawItem, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let (d, body) = self
            .granules
            .iter()
            .find(|(d, _)| self.native_id(*d) == item.native_id)
            .ok_or_else(|| FetchError::Permanent(format!("unknown item {}", item.native_id)))?;
        if self.panic_from.map_or(false, |from| *d >= from) {
            panic!("scripted adapter panic on {}", d);
        }

        let failure = {
            let mut fetches = self.fetches.lock().unwrap();
            let mut script = fetches.remove(d);
            let failure = step(&mut script);
            if let Some(script) = script {
                fetches.insert(*d, script);
            }
            failure
        };
        if let Some(e) = failure {
            return Err(e);
        }

        Ok(RawItem::new(self.source.clone(), item.native_id.clone(), body.clone().into_bytes())
            .fetched_at(fetch_time()))
    }
}

/// Sink that stores nothing once it starts failing
pub struct FailingSink {
    inner: MemorySink,
    fail_after: u32,
    writes: AtomicU32,
    error: PersistError,
    alive: bool,
}

impl FailingSink {
    /// Accept `fail_after` upserts, then fail every later one with `error`
    pub fn after(fail_after: u32, error: PersistError) -> Self {
        Self {
            inner: MemorySink::new(),
            fail_after,
            writes: AtomicU32::new(0),
            error,
            alive: true,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            alive: false,
            ..Self::after(0, PersistError::Transient("down".to_string()))
        }
    }

    pub fn snapshot(&self) -> Vec<(DedupKey, CanonicalObservation)> {
        self.inner.snapshot()
    }
}

#[async_trait]
impl Sink for FailingSink {
    async fn upsert(
        &self,
        key: &DedupKey,
        record: &CanonicalObservation,
    ) -> Result<(), PersistError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
            return Err(self.error.clone());
        }
        self.inner.upsert(key, record).await
    }

    async fn lookup(&self, key: &DedupKey) -> Result<Option<CanonicalObservation>, PersistError> {
        self.inner.lookup(key).await
    }

    async fn count(&self) -> Result<u64, PersistError> {
        self.inner.count().await
    }

    async fn is_alive(&self) -> bool {
        self.alive
    }
}
