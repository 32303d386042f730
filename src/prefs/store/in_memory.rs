use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;

use crate::prefs::store::PrefStorage;
use crate::prefs::types::{PrefEntry, PrefFilter, PrefKey, PrefValue};

/// In‑memory preference table (no persistence). Ordered by key.
#[derive(Default)]
pub struct InMemoryPrefStore {
    rows: RwLock<BTreeMap<PrefKey, PrefValue>>,
}

impl InMemoryPrefStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PrefStorage for InMemoryPrefStore {
    fn upsert(&self, entry: &PrefEntry) -> Result<()> {
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.key.clone(), entry.value.clone());
        Ok(())
    }

    fn delete_where(&self, filter: &PrefFilter) -> Result<Vec<PrefKey>> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<PrefKey> = rows.keys().filter(|k| filter.matches(k)).cloned().collect();
        for key in &doomed {
            rows.remove(key);
        }
        Ok(doomed)
    }

    fn query(&self, key: &PrefKey) -> Result<Option<PrefValue>> {
        Ok(self.rows.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    fn select(&self, filter: &PrefFilter) -> Result<Vec<PrefEntry>> {
        Ok(self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| filter.matches(k))
            .map(|(k, v)| PrefEntry::new(k.clone(), v.clone()))
            .collect())
    }
}
