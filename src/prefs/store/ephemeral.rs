use std::sync::Arc;

use anyhow::Result;

use crate::prefs::store::{InMemoryPrefStore, PrefStorage};
use crate::prefs::types::{PartitionSet, PrefEntry, PrefFilter, PrefKey, PrefValue};

/// A `PrefStorage` decorator that keeps private-partition rows in memory.
///
/// Normal rows go to the wrapped store; private rows never leave the process
/// and disappear with it, like the rest of a private browsing session.
pub struct EphemeralPrivate {
    inner: Arc<dyn PrefStorage>,
    private: InMemoryPrefStore,
}

impl EphemeralPrivate {
    pub fn new(inner: Arc<dyn PrefStorage>) -> Self {
        Self {
            inner,
            private: InMemoryPrefStore::new(),
        }
    }

    fn split(filter: &PrefFilter) -> (PrefFilter, PrefFilter) {
        let mut normal = filter.clone();
        normal.partitions = filter.partitions & PartitionSet::NORMAL;
        let mut private = filter.clone();
        private.partitions = filter.partitions & PartitionSet::PRIVATE;
        (normal, private)
    }

    fn backend_for(&self, key: &PrefKey) -> &dyn PrefStorage {
        if key.partition.is_private() {
            &self.private
        } else {
            self.inner.as_ref()
        }
    }
}

impl PrefStorage for EphemeralPrivate {
    fn upsert(&self, entry: &PrefEntry) -> Result<()> {
        self.backend_for(&entry.key).upsert(entry)
    }

    fn delete_where(&self, filter: &PrefFilter) -> Result<Vec<PrefKey>> {
        let (normal, private) = Self::split(filter);
        let mut removed = Vec::new();
        if !normal.partitions.is_empty() {
            removed.extend(self.inner.delete_where(&normal)?);
        }
        if !private.partitions.is_empty() {
            removed.extend(self.private.delete_where(&private)?);
        }
        Ok(removed)
    }

    fn query(&self, key: &PrefKey) -> Result<Option<PrefValue>> {
        self.backend_for(key).query(key)
    }

    fn select(&self, filter: &PrefFilter) -> Result<Vec<PrefEntry>> {
        let (normal, private) = Self::split(filter);
        let mut rows = Vec::new();
        if !normal.partitions.is_empty() {
            rows.extend(self.inner.select(&normal)?);
        }
        if !private.partitions.is_empty() {
            rows.extend(self.private.select(&private)?);
        }
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }
}
