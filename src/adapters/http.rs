//! HTTP plumbing shared by the provider adapters.
//!
//! - one `reqwest::Client` per adapter with the provider's request timeout
//! - a token-bucket limiter per adapter (`governor`)
//! - status classification into transient / permanent [`FetchError`]s
//! - daily granule planning from a cursor

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use tracing::debug;

use super::{FetchError, ItemRef};
use crate::config::{Credentials, ProviderSettings};
use crate::domain::{SourceId, SyncCursor, Watermark};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate-limited HTTP client for one provider
pub struct ProviderClient {
    source: SourceId,
    client: reqwest::Client,
    limiter: DirectRateLimiter,
    credentials: Option<Credentials>,
}

impl ProviderClient {
    pub fn new(
        source: SourceId,
        settings: &ProviderSettings,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .user_agent(concat!("ocean-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .with_context(|| format!("Failed to build HTTP client for {}", source))?;

        let per_second = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            source,
            client,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            credentials,
        })
    }

    /// GET `url` and return the body, waiting for rate budget first
    pub async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.limiter.until_ready().await;
        debug!(source = %self.source, url, "GET");

        let mut request = self.client.get(url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let bytes = response.bytes().await.map_err(classify_reqwest)?;
        Ok(bytes.to_vec())
    }
}

/// Map an HTTP status onto retry semantics
pub fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), snippet.trim());

    // Auth failures count as transient so a bad login freezes the cursor
    // instead of skipping every granule
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status.is_server_error()
    {
        FetchError::Transient(message)
    } else {
        FetchError::Permanent(message)
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::Permanent(err.to_string())
    }
}

/// ERDDAP answers an empty subset with 404 "Your query produced no matching results"
pub fn is_erddap_empty(err: &FetchError) -> bool {
    matches!(err, FetchError::Permanent(m) if m.starts_with("HTTP 404") && m.contains("no matching results"))
}

/// Resolve an empty ERDDAP answer for `item`.
///
/// Inside the settle window the day may simply not be published yet, so the
/// item stays unresolved; after it an empty answer means an empty day.
pub fn empty_answer(
    item: &ItemRef,
    settings: &ProviderSettings,
    now: DateTime<Utc>,
) -> Result<Vec<u8>, FetchError> {
    let settled = item
        .watermark
        .as_timestamp()
        .map_or(true, |day| now - day >= chrono::Duration::days(settings.settle_days.into()));
    if settled {
        Ok(Vec::new())
    } else {
        Err(FetchError::NotYetAvailable(format!(
            "{} returned no data within {} days",
            item.native_id, settings.settle_days
        )))
    }
}

/// Watermark marking `day` as fully stored
pub fn day_watermark(day: NaiveDate) -> Watermark {
    Watermark::Timestamp(day.and_time(NaiveTime::MIN).and_utc())
}

/// Days to request after `since`, oldest first.
///
/// The newest day is `today - lag_days`. A zero cursor starts `days_back`
/// days before that; otherwise listing resumes the day after the watermark.
pub fn daily_granules(
    since: &SyncCursor,
    settings: &ProviderSettings,
    now: DateTime<Utc>,
) -> Vec<NaiveDate> {
    let today = now.date_naive();
    let Some(newest) = today.checked_sub_days(Days::new(settings.lag_days.into())) else {
        return Vec::new();
    };

    let first = match since.timestamp() {
        Some(ts) => match ts.date_naive().checked_add_days(Days::new(1)) {
            Some(day) => day,
            None => return Vec::new(),
        },
        None => {
            let back = u64::from(settings.days_back.saturating_sub(1));
            match newest.checked_sub_days(Days::new(back)) {
                Some(day) => day,
                None => return Vec::new(),
            }
        }
    };

    first.iter_days().take_while(|d| *d <= newest).collect()
}

/// Build one [`ItemRef`] per day
pub fn granule_refs(
    prefix: &str,
    days: Vec<NaiveDate>,
    locator: impl Fn(NaiveDate) -> String,
) -> Vec<ItemRef> {
    days.into_iter()
        .map(|day| ItemRef {
            native_id: format!("{}:{}", prefix, day),
            locator: locator(day),
            watermark: day_watermark(day),
        })
        .collect()
}
