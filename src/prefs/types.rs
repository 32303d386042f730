use std::fmt::Display;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::domain::{covers, Host};

/// Preference values are arbitrary JSON values (numbers, strings, booleans, ...).
pub type PrefValue = serde_json::Value;

/// Identifies a preference service instance in logs and events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(Uuid);

impl StoreId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StoreId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage segment an entry lives in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Partition {
    Normal,
    Private,
}

impl Partition {
    pub fn is_private(self) -> bool {
        self == Partition::Private
    }

    pub fn as_set(self) -> PartitionSet {
        match self {
            Partition::Normal => PartitionSet::NORMAL,
            Partition::Private => PartitionSet::PRIVATE,
        }
    }
}

bitflags! {
    /// A set of partitions, used by removals and filters.
    pub struct PartitionSet: u8 {
        const NORMAL  = 0b01;
        const PRIVATE = 0b10;
    }
}

impl PartitionSet {
    pub fn includes(self, partition: Partition) -> bool {
        self.contains(partition.as_set())
    }
}

/// Either a site (host) or the global, site-independent scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Domain(Host),
}

impl Scope {
    pub fn host(&self) -> Option<&Host> {
        match self {
            Scope::Global => None,
            Scope::Domain(h) => Some(h),
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => f.write_str("<global>"),
            Scope::Domain(h) => write!(f, "{}", h),
        }
    }
}

/// Identity of a preference entry: at most one value exists per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrefKey {
    pub scope: Scope,
    pub name: String,
    pub partition: Partition,
}

impl PrefKey {
    pub fn new(scope: Scope, name: impl Into<String>, partition: Partition) -> Self {
        Self { scope, name: name.into(), partition }
    }

    pub fn domain(host: Host, name: impl Into<String>, partition: Partition) -> Self {
        Self::new(Scope::Domain(host), name, partition)
    }

    pub fn global(name: impl Into<String>, partition: Partition) -> Self {
        Self::new(Scope::Global, name, partition)
    }

    /// Same scope and name, different partition.
    pub fn with_partition(&self, partition: Partition) -> Self {
        Self { scope: self.scope.clone(), name: self.name.clone(), partition }
    }
}

impl Display for PrefKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{:?}", self.scope, self.name, self.partition)
    }
}

/// A stored preference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrefEntry {
    pub key: PrefKey,
    pub value: PrefValue,
}

impl PrefEntry {
    pub fn new(key: PrefKey, value: impl Into<PrefValue>) -> Self {
        Self { key, value: value.into() }
    }
}

/// Which scopes a [`PrefFilter`] selects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScopeFilter {
    /// Every entry, global or not.
    Any,
    /// Only global entries.
    Global,
    /// Every domain-scoped entry.
    AnyDomain,
    /// Entries for exactly this host.
    Domain(Host),
    /// Entries for this host and all of its subdomains.
    Subdomain(Host),
}

/// Predicate over [`PrefKey`]s.
///
/// The same filter drives cache invalidation and durable deletion, so the two
/// can never disagree about which entries a removal covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefFilter {
    pub scope: ScopeFilter,
    pub name: Option<String>,
    pub partitions: PartitionSet,
}

impl PrefFilter {
    pub fn new(scope: ScopeFilter, partitions: PartitionSet) -> Self {
        Self { scope, name: None, partitions }
    }

    /// Matches every entry in every partition.
    pub fn all() -> Self {
        Self::new(ScopeFilter::Any, PartitionSet::all())
    }

    /// Matches exactly one key.
    pub fn key(key: &PrefKey) -> Self {
        let scope = match &key.scope {
            Scope::Global => ScopeFilter::Global,
            Scope::Domain(h) => ScopeFilter::Domain(h.clone()),
        };
        Self { scope, name: Some(key.name.clone()), partitions: key.partition.as_set() }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn matches(&self, key: &PrefKey) -> bool {
        if !self.partitions.includes(key.partition) {
            return false;
        }
        if let Some(name) = &self.name {
            if *name != key.name {
                return false;
            }
        }
        match (&self.scope, &key.scope) {
            (ScopeFilter::Any, _) => true,
            (ScopeFilter::Global, Scope::Global) => true,
            (ScopeFilter::AnyDomain, Scope::Domain(_)) => true,
            (ScopeFilter::Domain(want), Scope::Domain(have)) => want == have,
            (ScopeFilter::Subdomain(want), Scope::Domain(have)) => covers(want, have),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::domain::normalize;

    fn key(domain: Option<&str>, name: &str, partition: Partition) -> PrefKey {
        match domain {
            Some(d) => PrefKey::domain(normalize(d).unwrap(), name, partition),
            None => PrefKey::global(name, partition),
        }
    }

    #[test]
    fn domain_filter_uses_equality() {
        let f = PrefFilter::new(ScopeFilter::Domain(normalize("a.com").unwrap()), PartitionSet::all());
        assert!(f.matches(&key(Some("a.com"), "foo", Partition::Normal)));
        assert!(f.matches(&key(Some("a.com"), "foo", Partition::Private)));
        assert!(!f.matches(&key(Some("b.a.com"), "foo", Partition::Normal)));
        assert!(!f.matches(&key(None, "foo", Partition::Normal)));
    }

    #[test]
    fn subdomain_filter_uses_coverage() {
        let f = PrefFilter::new(ScopeFilter::Subdomain(normalize("a.com").unwrap()), PartitionSet::NORMAL);
        assert!(f.matches(&key(Some("a.com"), "foo", Partition::Normal)));
        assert!(f.matches(&key(Some("b.a.com"), "foo", Partition::Normal)));
        assert!(!f.matches(&key(Some("b.a.com"), "foo", Partition::Private)));
        assert!(!f.matches(&key(Some("ba.com"), "foo", Partition::Normal)));
        assert!(!f.matches(&key(None, "foo", Partition::Normal)));
    }

    #[test]
    fn global_and_any_domain_are_disjoint() {
        let globals = PrefFilter::new(ScopeFilter::Global, PartitionSet::all());
        let domains = PrefFilter::new(ScopeFilter::AnyDomain, PartitionSet::all());
        let g = key(None, "foo", Partition::Private);
        let d = key(Some("c.com"), "foo", Partition::Private);
        assert!(globals.matches(&g) && !globals.matches(&d));
        assert!(domains.matches(&d) && !domains.matches(&g));
    }

    #[test]
    fn key_filter_matches_only_that_key() {
        let k = key(Some("a.com"), "foo", Partition::Normal);
        let f = PrefFilter::key(&k);
        assert!(f.matches(&k));
        assert!(!f.matches(&k.with_partition(Partition::Private)));
        assert!(!f.matches(&key(Some("a.com"), "bar", Partition::Normal)));
    }

    #[test]
    fn empty_partition_set_matches_nothing() {
        let f = PrefFilter::new(ScopeFilter::Any, PartitionSet::empty());
        assert!(!f.matches(&key(None, "foo", Partition::Normal)));
    }
}
