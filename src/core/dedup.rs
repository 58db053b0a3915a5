//! Deduplication and deterministic merge.
//!
//! Observations that describe the same measurement share a [`DedupKey`]:
//! station, time bucket, variable and position buckets. When two records
//! collide the [`MergePolicy`] picks a winner through a total order, so the
//! merged record does not depend on arrival order.
//!
//! The in-memory [`DedupIndex`] only remembers a bounded window of recent
//! keys. Older keys are looked up in the sink before a decision is made.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, MutexGuard};

use crate::domain::{CanonicalObservation, Provenance, SourceId, VariableType};

/// Bucket sizes used to derive dedup keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupSettings {
    /// Timestamps are floored to this many seconds
    #[serde(default = "default_time_granularity")]
    pub time_granularity_seconds: i64,

    /// Latitude/longitude bucket size in degrees
    #[serde(default = "default_position_bucket")]
    pub position_bucket_degrees: f64,

    /// Depth bucket size in metres
    #[serde(default = "default_depth_bucket")]
    pub depth_bucket_meters: f64,
}

fn default_time_granularity() -> i64 {
    3600
}
fn default_position_bucket() -> f64 {
    0.01
}
fn default_depth_bucket() -> f64 {
    1.0
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            time_granularity_seconds: default_time_granularity(),
            position_bucket_degrees: default_position_bucket(),
            depth_bucket_meters: default_depth_bucket(),
        }
    }
}

/// Which record wins a collision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Higher quality wins; fetch time breaks ties
    #[default]
    QualityFirst,

    /// Most recently fetched wins; quality breaks ties
    RecencyFirst,
}

/// Identity of a measurement across providers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub station_id: String,
    /// Epoch seconds floored to the time granularity
    pub time_bucket: i64,
    pub variable: VariableType,
    pub lat_bucket: i64,
    pub lon_bucket: i64,
    pub depth_bucket: i64,
}

impl DedupKey {
    pub fn derive(obs: &CanonicalObservation, settings: &DedupSettings) -> Self {
        let granularity = settings.time_granularity_seconds.max(1);
        let seconds = obs.timestamp.timestamp();

        Self {
            station_id: obs.station_id.clone(),
            time_bucket: seconds.div_euclid(granularity) * granularity,
            variable: obs.variable,
            lat_bucket: bucket(obs.position.latitude, settings.position_bucket_degrees),
            lon_bucket: bucket(obs.position.longitude, settings.position_bucket_degrees),
            depth_bucket: bucket(obs.position.depth, settings.depth_bucket_meters),
        }
    }

    /// Stable primary key for storage
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}",
            self.station_id,
            self.time_bucket,
            self.variable,
            self.lat_bucket,
            self.lon_bucket,
            self.depth_bucket
        )
    }
}

fn bucket(value: f64, size: f64) -> i64 {
    if size <= 0.0 {
        return 0;
    }
    (value / size).round() as i64
}

/// Total order used to pick a winner. Greater wins.
pub fn rank(policy: MergePolicy, a: &CanonicalObservation, b: &CanonicalObservation) -> Ordering {
    let quality = || a.quality.value().total_cmp(&b.quality.value());
    let recency = || a.provenance.fetched_at.cmp(&b.provenance.fetched_at);

    let primary = match policy {
        MergePolicy::QualityFirst => quality().then_with(recency),
        MergePolicy::RecencyFirst => recency().then_with(quality),
    };

    primary
        .then_with(|| b.provenance.source.cmp(&a.provenance.source))
        .then_with(|| b.provenance.raw_id.cmp(&a.provenance.raw_id))
        .then_with(|| a.value.total_cmp(&b.value))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.position.latitude.total_cmp(&b.position.latitude))
        .then_with(|| a.position.longitude.total_cmp(&b.position.longitude))
        .then_with(|| a.position.depth.total_cmp(&b.position.depth))
        .then_with(|| a.station_id.cmp(&b.station_id))
}

/// Merge two records with the same key.
///
/// Commutative and associative: the winner is the maximum under [`rank`] and
/// the lineage is the union of every provenance seen, keeping the latest
/// fetch per raw record and excluding the winner's own record.
pub fn merge(
    policy: MergePolicy,
    record_lineage: bool,
    a: &CanonicalObservation,
    b: &CanonicalObservation,
) -> CanonicalObservation {
    let winner = if rank(policy, a, b) == Ordering::Less { b } else { a };

    let mut merged = winner.clone();
    merged.merged_from = if record_lineage {
        lineage(winner, [a, b])
    } else {
        Vec::new()
    };
    merged
}

fn lineage<'a>(
    winner: &CanonicalObservation,
    records: impl IntoIterator<Item = &'a CanonicalObservation>,
) -> Vec<Provenance> {
    let mut latest: BTreeMap<(SourceId, String), Provenance> = BTreeMap::new();

    for p in records
        .into_iter()
        .flat_map(|r| std::iter::once(&r.provenance).chain(r.merged_from.iter()))
    {
        let id = (p.source.clone(), p.raw_id.clone());
        match latest.get(&id) {
            Some(seen) if seen.fetched_at >= p.fetched_at => {}
            _ => {
                latest.insert(id, p.clone());
            }
        }
    }

    latest.remove(&(winner.provenance.source.clone(), winner.provenance.raw_id.clone()));
    latest.into_values().collect()
}

/// What to do with an incoming observation
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    /// Key unseen: store as is
    Insert(CanonicalObservation),

    /// Key known and the merged record differs from the stored one
    Merge {
        record: CanonicalObservation,
        /// Incoming value disagreed with the stored value
        conflict: bool,
    },

    /// Incoming record adds nothing
    Discard,
}

struct Entry {
    record: CanonicalObservation,
    generation: u64,
}

/// Bounded window of recently seen keys.
///
/// Eviction is least-recently-touched. `resolve` is pure; callers `remember`
/// the outcome only after the sink accepted it.
pub struct DedupIndex {
    capacity: usize,
    policy: MergePolicy,
    record_lineage: bool,
    entries: HashMap<DedupKey, Entry>,
    order: VecDeque<(DedupKey, u64)>,
    generation: u64,
}

impl DedupIndex {
    pub fn new(capacity: usize, policy: MergePolicy, record_lineage: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            record_lineage,
            entries: HashMap::new(),
            order: VecDeque::new(),
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &DedupKey) -> Option<&CanonicalObservation> {
        self.entries.get(key).map(|e| &e.record)
    }

    /// Decide how `incoming` relates to what is stored under `key`
    pub fn resolve(&self, key: &DedupKey, incoming: CanonicalObservation) -> MergeDecision {
        let Some(existing) = self.get(key) else {
            return MergeDecision::Insert(incoming);
        };

        let merged = merge(self.policy, self.record_lineage, existing, &incoming);
        if &merged == existing {
            return MergeDecision::Discard;
        }

        MergeDecision::Merge {
            conflict: existing.value.to_bits() != incoming.value.to_bits(),
            record: merged,
        }
    }

    /// Record the stored state of `key`, evicting the oldest key when full
    pub fn remember(&mut self, key: DedupKey, record: CanonicalObservation) {
        self.generation += 1;
        let generation = self.generation;

        self.entries.insert(key.clone(), Entry { record, generation });
        self.order.push_back((key, generation));

        while self.entries.len() > self.capacity {
            let Some((oldest, stamp)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&oldest).map(|e| e.generation) == Some(stamp) {
                self.entries.remove(&oldest);
            }
        }

        // Drop stale touch markers so the queue stays proportional to the window
        if self.order.len() > self.capacity * 2 {
            let entries = &self.entries;
            self.order
                .retain(|(k, stamp)| entries.get(k).map(|e| e.generation) == Some(*stamp));
        }
    }
}

/// Shared dedup state for all sources of a run.
///
/// The index lock is held across decide, persist and remember so two
/// sources colliding on one key are serialized.
pub struct DedupEngine {
    settings: DedupSettings,
    index: Mutex<DedupIndex>,
}

impl DedupEngine {
    pub fn new(
        settings: DedupSettings,
        window_size: usize,
        policy: MergePolicy,
        record_lineage: bool,
    ) -> Self {
        Self {
            settings,
            index: Mutex::new(DedupIndex::new(window_size, policy, record_lineage)),
        }
    }

    pub fn key_for(&self, obs: &CanonicalObservation) -> DedupKey {
        DedupKey::derive(obs, &self.settings)
    }

    pub async fn lock(&self) -> MutexGuard<'_, DedupIndex> {
        self.index.lock().await
    }
}
