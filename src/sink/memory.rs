//! In-memory sink, used for dry runs and tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{PersistError, Sink};
use crate::core::dedup::DedupKey;
use crate::domain::CanonicalObservation;

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<BTreeMap<DedupKey, CanonicalObservation>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored records ordered by key
    pub fn snapshot(&self) -> Vec<(DedupKey, CanonicalObservation)> {
        match self.records.lock() {
            Ok(records) => records
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<DedupKey, CanonicalObservation>>, PersistError>
    {
        self.records
            .lock()
            .map_err(|_| PersistError::Permanent("memory sink lock poisoned".to_string()))
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn upsert(
        &self,
        key: &DedupKey,
        record: &CanonicalObservation,
    ) -> Result<(), PersistError> {
        self.lock()?.insert(key.clone(), record.clone());
        Ok(())
    }

    async fn lookup(&self, key: &DedupKey) -> Result<Option<CanonicalObservation>, PersistError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn count(&self) -> Result<u64, PersistError> {
        Ok(self.lock()?.len() as u64)
    }

    async fn is_alive(&self) -> bool {
        self.records.lock().is_ok()
    }
}
