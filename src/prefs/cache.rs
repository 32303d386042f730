//! In-memory mirror of the durable preference table.
//!
//! The cache is **not** authoritative. It answers a lookup with one of three
//! outcomes:
//!
//! - [`CacheLookup::Hit`]: the value as of the most recently accepted mutation,
//! - [`CacheLookup::Tombstone`]: the entry is known to be absent,
//! - [`CacheLookup::Miss`]: nothing is known; ask the durable store.
//!
//! Mutations (`store`, `invalidate`, `forget`) apply immediately and advance an
//! epoch counter. Backfills from the durable store go through [`PrefCache::populate`]
//! with a [`CacheTicket`] taken before the read was issued; a ticket from an older
//! epoch is refused, so a read that raced a removal can never resurrect data.
use std::collections::VecDeque;

use hashbrown::HashMap;

use super::types::{PrefFilter, PrefKey, PrefValue};

/// Result of a cache-only lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup {
    Hit(PrefValue),
    Tombstone,
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn value(&self) -> Option<&PrefValue> {
        match self {
            CacheLookup::Hit(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
enum Slot {
    Value(PrefValue),
    Tombstone,
}

/// Epoch marker handed out before a durable read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheTicket(u64);

/// Hit/miss counters, mostly for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub tombstones: usize,
    pub evictions: u64,
    pub refused_backfills: u64,
}

#[derive(Debug)]
pub struct PrefCache {
    slots: HashMap<PrefKey, Slot>,
    /// Keys tombstoned so far, oldest first. May hold keys that have since
    /// been overwritten or dropped; eviction skips those.
    tombstoned: VecDeque<PrefKey>,
    epoch: u64,
    capacity: usize,
    evictions: u64,
    refused_backfills: u64,
}

impl PrefCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            tombstoned: VecDeque::new(),
            epoch: 0,
            capacity: capacity.max(1),
            evictions: 0,
            refused_backfills: 0,
        }
    }

    pub fn lookup(&self, key: &PrefKey) -> CacheLookup {
        match self.slots.get(key) {
            Some(Slot::Value(v)) => CacheLookup::Hit(v.clone()),
            Some(Slot::Tombstone) => CacheLookup::Tombstone,
            None => CacheLookup::Miss,
        }
    }

    /// Takes a ticket for a durable read that is about to be issued.
    pub fn ticket(&self) -> CacheTicket {
        CacheTicket(self.epoch)
    }

    /// Write-through for an accepted `set`.
    pub fn store(&mut self, key: PrefKey, value: PrefValue) {
        self.epoch += 1;
        self.insert(key, Slot::Value(value));
    }

    /// Tombstones every mirrored entry matching `filter`. Returns how many.
    pub fn invalidate(&mut self, filter: &PrefFilter) -> usize {
        self.epoch += 1;
        let mut count = 0;
        for (key, slot) in self.slots.iter_mut() {
            if filter.matches(key) {
                if !matches!(slot, Slot::Tombstone) {
                    self.tombstoned.push_back(key.clone());
                }
                *slot = Slot::Tombstone;
                count += 1;
            }
        }
        self.compact_tombstone_queue();
        count
    }

    /// Drops every mirrored entry matching `filter` back to "unknown".
    pub fn forget(&mut self, filter: &PrefFilter) -> usize {
        self.epoch += 1;
        let before = self.slots.len();
        self.slots.retain(|key, _| !filter.matches(key));
        before - self.slots.len()
    }

    /// Backfills the result of a durable read. `None` records a tombstone.
    ///
    /// Returns false (and changes nothing) when any mutation was accepted after
    /// `ticket` was taken.
    pub fn populate(&mut self, key: PrefKey, value: Option<PrefValue>, ticket: CacheTicket) -> bool {
        if ticket.0 != self.epoch {
            self.refused_backfills += 1;
            return false;
        }
        match value {
            Some(v) => self.insert(key, Slot::Value(v)),
            None => {
                self.insert(key.clone(), Slot::Tombstone);
                self.tombstoned.push_back(key);
                self.compact_tombstone_queue();
            }
        }
        true
    }

    /// Cached values (not tombstones) whose keys match `filter`.
    pub fn hits(&self, filter: &PrefFilter) -> Vec<(PrefKey, PrefValue)> {
        let mut out: Vec<_> = self
            .slots
            .iter()
            .filter(|(key, _)| filter.matches(key))
            .filter_map(|(key, slot)| match slot {
                Slot::Value(v) => Some((key.clone(), v.clone())),
                Slot::Tombstone => None,
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.epoch += 1;
        self.slots.clear();
        self.tombstoned.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.slots.len(),
            tombstones: self.slots.values().filter(|s| matches!(s, Slot::Tombstone)).count(),
            evictions: self.evictions,
            refused_backfills: self.refused_backfills,
        }
    }

    fn insert(&mut self, key: PrefKey, slot: Slot) {
        if !self.slots.contains_key(&key) && self.slots.len() >= self.capacity {
            // Any slot may go: an evicted key reads as a miss and is answered by
            // the durable store, which sees every mutation in issue order.
            let victim = self
                .oldest_tombstone()
                .or_else(|| self.slots.keys().next().cloned());
            if let Some(victim) = victim {
                self.slots.remove(&victim);
                self.evictions += 1;
            }
        }
        self.slots.insert(key, slot);
    }

    /// Pops queued keys until one is still a tombstone.
    fn oldest_tombstone(&mut self) -> Option<PrefKey> {
        while let Some(key) = self.tombstoned.pop_front() {
            if matches!(self.slots.get(&key), Some(Slot::Tombstone)) {
                return Some(key);
            }
        }
        None
    }

    /// Rebuilds the queue once stale keys outnumber live slots.
    fn compact_tombstone_queue(&mut self) {
        if self.tombstoned.len() <= 2 * self.capacity {
            return;
        }
        let slots = &self.slots;
        let mut seen = hashbrown::HashSet::new();
        self.tombstoned
            .retain(|key| matches!(slots.get(key), Some(Slot::Tombstone)) && seen.insert(key.clone()));
    }
}
