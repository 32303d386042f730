use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
#[cfg(feature = "sqlite_store")]
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::config::{validate, PrefStoreConfig};
use crate::errors::PrefsError;
use crate::prefs::cache::{CacheLookup, CacheStats, PrefCache};
use crate::prefs::completion::{completion_pair, Completion, OpId, OpState};
use crate::prefs::context::{read_partitions, read_set, remove_partitions, write_partition, LoadContext};
use crate::prefs::domain::{normalize, Host};
use crate::prefs::event::{PrefBus, Subscription};
#[cfg(feature = "sqlite_store")]
use crate::prefs::store::SqlitePrefStore;
use crate::prefs::store::{EphemeralPrivate, InMemoryPrefStore, PrefStorage};
use crate::prefs::types::{
    Partition, PrefEntry, PrefFilter, PrefKey, PrefValue, Scope, ScopeFilter, StoreId,
};
use crate::prefs::worker::{StorageCommand, StorageWorker};

/// Domain-scoped content preferences with a synchronous cache in front of an
/// asynchronous durable store.
///
/// Mutations update the cache before they return and hand back a
/// [`Completion`] for the durable write. Reads consult the cache first and go
/// through the same FIFO queue as writes on a miss, so they never observe a
/// state older than the last mutation issued before them.
///
/// Cloning is cheap; clones share the cache and the worker. The worker stops
/// once every clone is dropped and the queued operations have run.
#[derive(Clone)]
pub struct ContentPrefService {
    id: StoreId,
    config: PrefStoreConfig,
    cache: Arc<RwLock<PrefCache>>,
    cmd_tx: mpsc::UnboundedSender<StorageCommand>,
    bus: Arc<PrefBus>,
    next_op: Arc<AtomicU64>,
}

impl Debug for ContentPrefService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentPrefService")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ContentPrefService {
    /// Creates a service over `storage` and spawns its worker on the current
    /// tokio runtime.
    pub fn new(storage: Arc<dyn PrefStorage>, config: PrefStoreConfig) -> Result<Self, PrefsError> {
        validate(&config)?;
        let runtime = Handle::try_current().map_err(|e| PrefsError::NoRuntime(e.to_string()))?;

        let storage: Arc<dyn PrefStorage> = if config.persist_private {
            storage
        } else {
            Arc::new(EphemeralPrivate::new(storage))
        };

        let id = StoreId::new();
        let cache = Arc::new(RwLock::new(PrefCache::new(config.max_cached_entries)));
        let bus = Arc::new(PrefBus::new(config.event_capacity));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let worker = StorageWorker::new(id, storage, cmd_rx, bus.clone(), cache.clone(), config.failure_policy);
        runtime.spawn(worker.run());

        log::info!("prefs[{}]: service created ({:?})", id, config);
        Ok(Self {
            id,
            config,
            cache,
            cmd_tx,
            bus,
            next_op: Arc::new(AtomicU64::new(1)),
        })
    }

    /// A service backed by a fresh in-memory table with the default config.
    pub fn in_memory() -> Result<Self, PrefsError> {
        Self::new(Arc::new(InMemoryPrefStore::new()), PrefStoreConfig::default())
    }

    /// A service backed by the SQLite database at `path` (created if missing).
    #[cfg(feature = "sqlite_store")]
    pub fn open_sqlite(path: impl AsRef<Path>, config: PrefStoreConfig) -> Result<Self, PrefsError> {
        let store = SqlitePrefStore::new(path)?;
        Self::new(Arc::new(store), config)
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn config(&self) -> &PrefStoreConfig {
        &self.config
    }

    /// Change notifications, published after the durable store applied a change.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache().stats()
    }

    // ---------- writes ----------

    pub fn set(
        &self,
        domain: &str,
        name: &str,
        value: impl Into<PrefValue>,
        ctx: Option<LoadContext>,
    ) -> Result<Completion, PrefsError> {
        let host = parse_domain(domain)?;
        let name = require_name(name)?;
        self.apply_set(PrefKey::domain(host, name, write_partition(ctx)), value.into())
    }

    pub fn set_global(
        &self,
        name: &str,
        value: impl Into<PrefValue>,
        ctx: Option<LoadContext>,
    ) -> Result<Completion, PrefsError> {
        let name = require_name(name)?;
        self.apply_set(PrefKey::global(name, write_partition(ctx)), value.into())
    }

    // ---------- reads ----------

    pub async fn get(
        &self,
        domain: &str,
        name: &str,
        ctx: Option<LoadContext>,
    ) -> Result<Option<PrefValue>, PrefsError> {
        let host = parse_domain(domain)?;
        let name = require_name(name)?;
        self.read(Scope::Domain(host), name, ctx).await
    }

    pub async fn get_global(&self, name: &str, ctx: Option<LoadContext>) -> Result<Option<PrefValue>, PrefsError> {
        let name = require_name(name)?;
        self.read(Scope::Global, name, ctx).await
    }

    /// Answers from the cache alone. `Miss` means the durable store would have
    /// to be asked.
    pub fn get_cached(&self, domain: &str, name: &str, ctx: Option<LoadContext>) -> Result<CacheLookup, PrefsError> {
        let host = parse_domain(domain)?;
        let name = require_name(name)?;
        Ok(self.read_cached(Scope::Domain(host), name, ctx))
    }

    pub fn get_cached_global(&self, name: &str, ctx: Option<LoadContext>) -> Result<CacheLookup, PrefsError> {
        let name = require_name(name)?;
        Ok(self.read_cached(Scope::Global, name, ctx))
    }

    /// Values of `name` for `domain` and every subdomain of it, ordered by host.
    ///
    /// With a private context a private value replaces the normal value of the
    /// same host.
    pub async fn get_by_subdomain_and_name(
        &self,
        domain: &str,
        name: &str,
        ctx: Option<LoadContext>,
    ) -> Result<Vec<(Host, PrefValue)>, PrefsError> {
        let host = parse_domain(domain)?;
        let name = require_name(name)?;
        let filter = PrefFilter::new(ScopeFilter::Subdomain(host), read_set(ctx)).with_name(name.clone());

        let ticket = self.cache().ticket();
        let (reply, rx) = oneshot::channel();
        self.send(StorageCommand::Select { filter, reply })?;
        let rows = rx.await.map_err(|_| PrefsError::StoreClosed)?.map_err(durable)?;

        {
            let mut cache = self.cache_mut();
            let mut backfill: Vec<(PrefKey, Option<PrefValue>)> =
                rows.iter().map(|row| (row.key.clone(), Some(row.value.clone()))).collect();
            if self.config.cache_absent {
                // The select saw every partition of each returned host, so the
                // partitions it did not return are known to be absent.
                let hosts: BTreeSet<&Host> = rows.iter().filter_map(|row| row.key.scope.host()).collect();
                for host in hosts {
                    for &partition in read_partitions(ctx) {
                        let key = PrefKey::domain(host.clone(), name.clone(), partition);
                        if !rows.iter().any(|row| row.key == key) {
                            backfill.push((key, None));
                        }
                    }
                }
            }
            for (key, value) in backfill {
                if !cache.populate(key, value, ticket) {
                    break;
                }
            }
        }
        Ok(merge_by_host(rows.into_iter().map(|e| (e.key, e.value))))
    }

    /// Cache-only variant of [`get_by_subdomain_and_name`](Self::get_by_subdomain_and_name).
    ///
    /// Only mirrored values are reported, and a host is reported only when its
    /// cache slots settle the read the way [`get_cached`](Self::get_cached)
    /// would: with a private context, a normal value is hidden while the private
    /// slot of that host is unknown.
    pub fn get_cached_by_subdomain_and_name(
        &self,
        domain: &str,
        name: &str,
        ctx: Option<LoadContext>,
    ) -> Result<Vec<(Host, PrefValue)>, PrefsError> {
        let host = parse_domain(domain)?;
        let name = require_name(name)?;
        let filter = PrefFilter::new(ScopeFilter::Subdomain(host), read_set(ctx)).with_name(name.clone());

        let cache = self.cache();
        let hosts: BTreeSet<Host> = cache
            .hits(&filter)
            .into_iter()
            .filter_map(|(key, _)| key.scope.host().cloned())
            .collect();
        let mut out = Vec::with_capacity(hosts.len());
        for host in hosts {
            let base = PrefKey::domain(host.clone(), name.clone(), Partition::Normal);
            if let CacheLookup::Hit(value) = lookup_in_read_order(&cache, &base, ctx) {
                out.push((host, value));
            }
        }
        Ok(out)
    }

    // ---------- removals ----------

    pub fn remove(&self, domain: &str, name: &str, ctx: Option<LoadContext>) -> Result<Completion, PrefsError> {
        let host = parse_domain(domain)?;
        let name = require_name(name)?;
        self.apply_removal(PrefFilter::new(ScopeFilter::Domain(host), remove_partitions(ctx)).with_name(name))
    }

    pub fn remove_global(&self, name: &str, ctx: Option<LoadContext>) -> Result<Completion, PrefsError> {
        let name = require_name(name)?;
        self.apply_removal(PrefFilter::new(ScopeFilter::Global, remove_partitions(ctx)).with_name(name))
    }

    /// Removes every preference of exactly this host. Subdomains are kept.
    pub fn remove_by_domain(&self, domain: &str, ctx: Option<LoadContext>) -> Result<Completion, PrefsError> {
        let host = parse_domain(domain)?;
        self.apply_removal(PrefFilter::new(ScopeFilter::Domain(host), remove_partitions(ctx)))
    }

    /// Removes every preference of this host and all of its subdomains.
    pub fn remove_by_subdomain(&self, domain: &str, ctx: Option<LoadContext>) -> Result<Completion, PrefsError> {
        let host = parse_domain(domain)?;
        self.apply_removal(PrefFilter::new(ScopeFilter::Subdomain(host), remove_partitions(ctx)))
    }

    /// Removes `name` from every scope, global included.
    pub fn remove_by_name(&self, name: &str, ctx: Option<LoadContext>) -> Result<Completion, PrefsError> {
        let name = require_name(name)?;
        self.apply_removal(PrefFilter::new(ScopeFilter::Any, remove_partitions(ctx)).with_name(name))
    }

    pub fn remove_all_domains(&self, ctx: Option<LoadContext>) -> Result<Completion, PrefsError> {
        self.apply_removal(PrefFilter::new(ScopeFilter::AnyDomain, remove_partitions(ctx)))
    }

    pub fn remove_all_globals(&self, ctx: Option<LoadContext>) -> Result<Completion, PrefsError> {
        self.apply_removal(PrefFilter::new(ScopeFilter::Global, remove_partitions(ctx)))
    }

    /// Resolves once every durable operation issued before this call has run.
    pub async fn flush(&self) -> Result<(), PrefsError> {
        let (reply, rx) = oneshot::channel();
        self.send(StorageCommand::Flush { reply })?;
        rx.await.map_err(|_| PrefsError::StoreClosed)
    }

    // ---------- internals ----------

    // Commands are queued before the cache changes, so a closed store leaves
    // the cache untouched. The write lock spans both steps: cache order and
    // durable order agree, and the worker cannot touch the cache in between.

    fn apply_set(&self, key: PrefKey, value: PrefValue) -> Result<Completion, PrefsError> {
        let (done, completion) = completion_pair(self.next_op_id());
        let id = done.id();

        let mut cache = self.cache_mut();
        done.advance(OpState::CacheApplied);
        done.advance(OpState::DurablePending);
        self.send(StorageCommand::Upsert { entry: PrefEntry::new(key.clone(), value.clone()), done })?;
        log::debug!("prefs[{}]: {} set {} = {}", self.id, id, key, value);
        cache.store(key, value);
        Ok(completion)
    }

    fn apply_removal(&self, filter: PrefFilter) -> Result<Completion, PrefsError> {
        let (done, completion) = completion_pair(self.next_op_id());
        let id = done.id();

        let mut cache = self.cache_mut();
        done.advance(OpState::CacheApplied);
        done.advance(OpState::DurablePending);
        self.send(StorageCommand::Delete { filter: filter.clone(), done })?;
        let hidden = cache.invalidate(&filter);
        log::debug!("prefs[{}]: {} remove {:?} ({} cached)", self.id, id, filter, hidden);
        Ok(completion)
    }

    async fn read(&self, scope: Scope, name: String, ctx: Option<LoadContext>) -> Result<Option<PrefValue>, PrefsError> {
        let base = PrefKey::new(scope, name, Partition::Normal);
        for &partition in read_partitions(ctx) {
            let key = base.with_partition(partition);
            let (lookup, ticket) = {
                let cache = self.cache();
                (cache.lookup(&key), cache.ticket())
            };
            match lookup {
                CacheLookup::Hit(v) => return Ok(Some(v)),
                CacheLookup::Tombstone => continue,
                CacheLookup::Miss => {}
            }

            let (reply, rx) = oneshot::channel();
            self.send(StorageCommand::Query { key: key.clone(), reply })?;
            let value = rx.await.map_err(|_| PrefsError::StoreClosed)?.map_err(durable)?;

            if value.is_some() || self.config.cache_absent {
                self.cache_mut().populate(key, value.clone(), ticket);
            }
            if value.is_some() {
                return Ok(value);
            }
        }
        Ok(None)
    }

    fn read_cached(&self, scope: Scope, name: String, ctx: Option<LoadContext>) -> CacheLookup {
        let base = PrefKey::new(scope, name, Partition::Normal);
        lookup_in_read_order(&self.cache(), &base, ctx)
    }

    fn send(&self, cmd: StorageCommand) -> Result<(), PrefsError> {
        self.cmd_tx.send(cmd).map_err(|_| PrefsError::StoreClosed)
    }

    fn next_op_id(&self) -> OpId {
        OpId(self.next_op.fetch_add(1, Ordering::Relaxed))
    }

    fn cache(&self) -> RwLockReadGuard<'_, PrefCache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_mut(&self) -> RwLockWriteGuard<'_, PrefCache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_domain(domain: &str) -> Result<Host, PrefsError> {
    if domain.trim().is_empty() {
        return Err(PrefsError::InvalidArgument("domain must not be empty".into()));
    }
    normalize(domain)
}

fn require_name(name: &str) -> Result<String, PrefsError> {
    if name.trim().is_empty() {
        return Err(PrefsError::InvalidArgument("name must not be empty".into()));
    }
    Ok(name.to_string())
}

/// Cache-only read of `base` (any partition) following the read order of `ctx`.
/// A tombstone passes on to the next partition, a miss stops the walk.
fn lookup_in_read_order(cache: &PrefCache, base: &PrefKey, ctx: Option<LoadContext>) -> CacheLookup {
    for &partition in read_partitions(ctx) {
        match cache.lookup(&base.with_partition(partition)) {
            CacheLookup::Tombstone => continue,
            other => return other,
        }
    }
    CacheLookup::Tombstone
}

fn durable(err: anyhow::Error) -> PrefsError {
    PrefsError::DurableFailure(format!("{:#}", err))
}

/// One value per host; private beats normal.
fn merge_by_host(rows: impl IntoIterator<Item = (PrefKey, PrefValue)>) -> Vec<(Host, PrefValue)> {
    let mut by_host: BTreeMap<Host, (Partition, PrefValue)> = BTreeMap::new();
    for (key, value) in rows {
        let Scope::Domain(host) = key.scope else { continue };
        match by_host.get(&host) {
            Some((Partition::Private, _)) if !key.partition.is_private() => {}
            _ => {
                by_host.insert(host, (key.partition, value));
            }
        }
    }
    by_host.into_iter().map(|(host, (_, value))| (host, value)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::prefs::event::PrefEvent;
    use anyhow::{anyhow, Result};
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use serde_json::json;

    const PRIVATE: Option<LoadContext> = Some(LoadContext::Private);
    const NORMAL: Option<LoadContext> = Some(LoadContext::Normal);

    /// Accepts reads, rejects every write.
    struct ReadOnlyStore(InMemoryPrefStore);

    impl PrefStorage for ReadOnlyStore {
        fn upsert(&self, _entry: &PrefEntry) -> Result<()> {
            Err(anyhow!("read-only"))
        }
        fn delete_where(&self, _filter: &PrefFilter) -> Result<Vec<PrefKey>> {
            Err(anyhow!("read-only"))
        }
        fn query(&self, key: &PrefKey) -> Result<Option<PrefValue>> {
            self.0.query(key)
        }
        fn select(&self, filter: &PrefFilter) -> Result<Vec<PrefEntry>> {
            self.0.select(filter)
        }
    }

    fn read_only(policy: FailurePolicy, rows: &[PrefEntry]) -> ContentPrefService {
        let inner = InMemoryPrefStore::new();
        for row in rows {
            inner.upsert(row).unwrap();
        }
        let cfg = PrefStoreConfig::builder().failure_policy(policy).build().unwrap();
        ContentPrefService::new(Arc::new(ReadOnlyStore(inner)), cfg).unwrap()
    }

    #[tokio::test]
    async fn set_then_get() {
        let svc = ContentPrefService::in_memory().unwrap();
        let done = svc.set("a.com", "foo", 1, None).unwrap();
        assert_eq!(done.state(), OpState::DurablePending);
        assert_eq!(svc.get("a.com", "foo", None).await.unwrap(), Some(json!(1)));
        done.wait().await.unwrap();

        svc.set_global("foo", "g", None).unwrap().wait().await.unwrap();
        assert_eq!(svc.get_global("foo", None).await.unwrap(), Some(json!("g")));
        assert_eq!(svc.get("http://A.com/path", "foo", None).await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn private_reads_fall_back_to_normal() {
        let svc = ContentPrefService::in_memory().unwrap();
        svc.set("a.com", "foo", 1, NORMAL).unwrap();
        assert_eq!(svc.get("a.com", "foo", PRIVATE).await.unwrap(), Some(json!(1)));

        svc.set("a.com", "foo", 2, PRIVATE).unwrap();
        assert_eq!(svc.get("a.com", "foo", PRIVATE).await.unwrap(), Some(json!(2)));
        assert_eq!(svc.get("a.com", "foo", None).await.unwrap(), Some(json!(1)));

        svc.set("b.com", "foo", 3, PRIVATE).unwrap();
        assert_eq!(svc.get("b.com", "foo", NORMAL).await.unwrap(), None);
    }

    #[tokio::test]
    async fn removal_is_visible_before_completion() {
        let svc = ContentPrefService::in_memory().unwrap();
        svc.set("a.com", "foo", 1, None).unwrap();
        let done = svc.remove_by_domain("a.com", None).unwrap();
        assert_eq!(svc.get_cached("a.com", "foo", None).unwrap(), CacheLookup::Tombstone);
        assert_eq!(svc.get("a.com", "foo", None).await.unwrap(), None);
        done.wait().await.unwrap();
    }

    #[tokio::test]
    async fn reads_backfill_the_cache() {
        let disk = Arc::new(InMemoryPrefStore::new());
        disk.upsert(&PrefEntry::new(PrefKey::global("foo", Partition::Normal), json!(5))).unwrap();
        let svc = ContentPrefService::new(disk, PrefStoreConfig::default()).unwrap();

        assert_eq!(svc.get_cached_global("foo", None).unwrap(), CacheLookup::Miss);
        assert_eq!(svc.get_global("foo", None).await.unwrap(), Some(json!(5)));
        assert_eq!(svc.get_cached_global("foo", None).unwrap(), CacheLookup::Hit(json!(5)));

        assert_eq!(svc.get_global("bar", None).await.unwrap(), None);
        assert_eq!(svc.get_cached_global("bar", None).unwrap(), CacheLookup::Tombstone);
    }

    #[tokio::test]
    async fn absent_results_are_not_cached_when_disabled() {
        let cfg = PrefStoreConfig::builder().cache_absent(false).build().unwrap();
        let svc = ContentPrefService::new(Arc::new(InMemoryPrefStore::new()), cfg).unwrap();
        assert_eq!(svc.get_global("bar", None).await.unwrap(), None);
        assert_eq!(svc.get_cached_global("bar", None).unwrap(), CacheLookup::Miss);
    }

    #[tokio::test]
    async fn cached_private_lookup_stops_at_a_private_miss() {
        let svc = ContentPrefService::in_memory().unwrap();
        svc.set("a.com", "foo", 1, NORMAL).unwrap();
        assert_eq!(svc.get_cached("a.com", "foo", PRIVATE).unwrap(), CacheLookup::Miss);

        svc.remove("a.com", "foo", PRIVATE).unwrap();
        assert_eq!(svc.get_cached("a.com", "foo", PRIVATE).unwrap(), CacheLookup::Miss);

        svc.set("a.com", "foo", 2, PRIVATE).unwrap();
        svc.remove("a.com", "foo", PRIVATE).unwrap();
        assert_eq!(svc.get_cached("a.com", "foo", PRIVATE).unwrap(), CacheLookup::Hit(json!(1)));
    }

    #[tokio::test]
    async fn invalid_input_fails_without_side_effects() {
        let svc = ContentPrefService::in_memory().unwrap();
        let mut events = svc.subscribe();

        assert!(matches!(svc.set("", "foo", 1, None), Err(PrefsError::InvalidArgument(_))));
        assert!(matches!(svc.set("a.com", " ", 1, None), Err(PrefsError::InvalidArgument(_))));
        assert!(matches!(svc.remove_by_domain("", None), Err(PrefsError::InvalidArgument(_))));
        assert!(matches!(svc.remove_by_subdomain("  ", PRIVATE), Err(PrefsError::InvalidArgument(_))));
        assert!(matches!(svc.set("file:///tmp/x", "foo", 1, None), Err(PrefsError::InvalidDomain(_))));
        assert!(matches!(svc.get("a.com", "", None).await, Err(PrefsError::InvalidArgument(_))));

        svc.flush().await.unwrap();
        assert_eq!(svc.cache_stats().entries, 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_follow_durable_completion() {
        let svc = ContentPrefService::in_memory().unwrap();
        let mut events = svc.subscribe();

        svc.set("a.com", "foo", 1, None).unwrap().wait().await.unwrap();
        svc.set("b.a.com", "foo", 2, PRIVATE).unwrap().wait().await.unwrap();
        svc.remove_by_subdomain("a.com", None).unwrap().wait().await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), PrefEvent::Set { .. }));
        assert!(matches!(events.recv().await.unwrap(), PrefEvent::Set { .. }));
        let mut removed = vec![events.recv().await.unwrap(), events.recv().await.unwrap()];
        removed.sort_by(|a, b| a.key().cmp(b.key()));
        assert!(removed.iter().all(|e| matches!(e, PrefEvent::Removed { .. })));
        assert_eq!(removed[0].key().scope.to_string(), "a.com");
        assert_eq!(removed[1].key().scope.to_string(), "b.a.com");
    }

    #[tokio::test]
    async fn subdomain_reads_prefer_private_values() {
        let svc = ContentPrefService::in_memory().unwrap();
        svc.set("a.com", "foo", 1, None).unwrap();
        svc.set("b.a.com", "foo", 2, None).unwrap();
        svc.set("b.a.com", "foo", 3, PRIVATE).unwrap();
        svc.set("c.com", "foo", 4, None).unwrap();
        svc.set("a.com", "bar", 5, None).unwrap();

        let normal = svc.get_by_subdomain_and_name("a.com", "foo", None).await.unwrap();
        assert_eq!(
            normal,
            vec![(Host::parse("a.com").unwrap(), json!(1)), (Host::parse("b.a.com").unwrap(), json!(2))]
        );

        let private = svc.get_by_subdomain_and_name("a.com", "foo", PRIVATE).await.unwrap();
        assert_eq!(
            private,
            vec![(Host::parse("a.com").unwrap(), json!(1)), (Host::parse("b.a.com").unwrap(), json!(3))]
        );

        let cached = svc.get_cached_by_subdomain_and_name("a.com", "foo", PRIVATE).unwrap();
        assert_eq!(cached, private);
    }

    #[tokio::test]
    async fn remove_by_name_and_all_domains() {
        let svc = ContentPrefService::in_memory().unwrap();
        svc.set("a.com", "foo", 1, None).unwrap();
        svc.set("b.com", "bar", 2, None).unwrap();
        svc.set_global("foo", 3, None).unwrap();
        svc.set_global("bar", 4, None).unwrap();

        svc.remove_by_name("foo", None).unwrap();
        assert_eq!(svc.get("a.com", "foo", None).await.unwrap(), None);
        assert_eq!(svc.get_global("foo", None).await.unwrap(), None);
        assert_eq!(svc.get("b.com", "bar", None).await.unwrap(), Some(json!(2)));

        svc.remove_all_domains(None).unwrap().wait().await.unwrap();
        assert_eq!(svc.get("b.com", "bar", None).await.unwrap(), None);
        assert_eq!(svc.get_global("bar", None).await.unwrap(), Some(json!(4)));
    }

    #[tokio::test]
    async fn durable_failure_keeps_cache_by_default() {
        let svc = read_only(FailurePolicy::KeepCache, &[]);
        let err = svc.set_global("foo", 1, None).unwrap().wait().await.unwrap_err();
        assert!(matches!(err, PrefsError::DurableFailure(ref m) if m.contains("read-only")));
        assert_eq!(svc.get_cached_global("foo", None).unwrap(), CacheLookup::Hit(json!(1)));
    }

    #[tokio::test]
    async fn durable_failure_resyncs_when_configured() {
        let row = PrefEntry::new(PrefKey::global("foo", Partition::Normal), json!(7));
        let svc = read_only(FailurePolicy::Resync, &[row]);

        assert_eq!(svc.get_global("foo", None).await.unwrap(), Some(json!(7)));
        let done = svc.remove_global("foo", None).unwrap();
        assert_eq!(svc.get_cached_global("foo", None).unwrap(), CacheLookup::Tombstone);
        assert!(done.wait().await.is_err());

        assert_eq!(svc.get_cached_global("foo", None).unwrap(), CacheLookup::Miss);
        assert_eq!(svc.get_global("foo", None).await.unwrap(), Some(json!(7)));
    }

    #[test]
    fn construction_requires_a_runtime() {
        assert!(matches!(ContentPrefService::in_memory(), Err(PrefsError::NoRuntime(_))));
    }

    #[test]
    fn merge_prefers_private_regardless_of_order() {
        let host = Host::parse("a.com").unwrap();
        let normal = PrefKey::domain(host.clone(), "foo", Partition::Normal);
        let private = normal.with_partition(Partition::Private);
        let merged = merge_by_host(vec![(private.clone(), json!(2)), (normal.clone(), json!(1))]);
        assert_eq!(merged, vec![(host.clone(), json!(2))]);
        let merged = merge_by_host(vec![(normal, json!(1)), (private, json!(2))]);
        assert_eq!(merged, vec![(host, json!(2))]);
    }

    fn with_stored_rows(rows: &[PrefEntry]) -> ContentPrefService {
        let disk = Arc::new(InMemoryPrefStore::new());
        for row in rows {
            disk.upsert(row).unwrap();
        }
        let cfg = PrefStoreConfig::builder().persist_private(true).build().unwrap();
        ContentPrefService::new(disk, cfg).unwrap()
    }

    #[tokio::test]
    async fn cached_subdomain_read_hides_normal_value_behind_unknown_private_slot() {
        let host = Host::parse("b.a.com").unwrap();
        let stored = PrefEntry::new(PrefKey::domain(host.clone(), "foo", Partition::Private), json!(3));
        let svc = with_stored_rows(&[stored]);
        svc.set("b.a.com", "foo", 2, None).unwrap();

        assert_eq!(svc.get_cached("b.a.com", "foo", PRIVATE).unwrap(), CacheLookup::Miss);
        assert!(svc.get_cached_by_subdomain_and_name("a.com", "foo", PRIVATE).unwrap().is_empty());
        assert_eq!(
            svc.get_cached_by_subdomain_and_name("a.com", "foo", None).unwrap(),
            vec![(host.clone(), json!(2))]
        );

        assert_eq!(svc.get("b.a.com", "foo", PRIVATE).await.unwrap(), Some(json!(3)));
        assert_eq!(
            svc.get_cached_by_subdomain_and_name("a.com", "foo", PRIVATE).unwrap(),
            vec![(host, json!(3))]
        );
    }

    #[tokio::test]
    async fn subdomain_read_records_absent_private_slots() {
        let svc = ContentPrefService::in_memory().unwrap();
        svc.set("a.com", "foo", 1, None).unwrap();
        assert!(svc.get_cached_by_subdomain_and_name("a.com", "foo", PRIVATE).unwrap().is_empty());

        let found = svc.get_by_subdomain_and_name("a.com", "foo", PRIVATE).await.unwrap();
        assert_eq!(found, vec![(Host::parse("a.com").unwrap(), json!(1))]);
        assert_eq!(svc.get_cached("a.com", "foo", PRIVATE).unwrap(), CacheLookup::Hit(json!(1)));
        assert_eq!(svc.get_cached_by_subdomain_and_name("a.com", "foo", PRIVATE).unwrap(), found);
    }

    /// Holds every durable query until the test releases it.
    struct GatedStore {
        inner: InMemoryPrefStore,
        entered: Mutex<std_mpsc::Sender<()>>,
        release: Mutex<std_mpsc::Receiver<()>>,
    }

    impl PrefStorage for GatedStore {
        fn upsert(&self, entry: &PrefEntry) -> Result<()> {
            self.inner.upsert(entry)
        }
        fn delete_where(&self, filter: &PrefFilter) -> Result<Vec<PrefKey>> {
            self.inner.delete_where(filter)
        }
        fn query(&self, key: &PrefKey) -> Result<Option<PrefValue>> {
            self.entered.lock().unwrap().send(())?;
            self.release.lock().unwrap().recv()?;
            self.inner.query(key)
        }
        fn select(&self, filter: &PrefFilter) -> Result<Vec<PrefEntry>> {
            self.inner.select(filter)
        }
    }

    #[tokio::test]
    async fn read_racing_a_removal_does_not_refill_the_cache() {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let store = GatedStore {
            inner: InMemoryPrefStore::new(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let host = Host::parse("a.com").unwrap();
        store.inner.upsert(&PrefEntry::new(PrefKey::domain(host, "foo", Partition::Normal), json!(1))).unwrap();
        let svc = ContentPrefService::new(Arc::new(store), PrefStoreConfig::default()).unwrap();

        let reader = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.get("a.com", "foo", None).await })
        };
        // The query is in the store, queued ahead of the removal.
        let entered_rx = tokio::task::spawn_blocking(move || {
            entered_rx.recv().unwrap();
            entered_rx
        })
        .await
        .unwrap();
        let removed = svc.remove_by_domain("a.com", None).unwrap();
        release_tx.send(()).unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), Some(json!(1)));
        removed.wait().await.unwrap();

        assert_eq!(svc.get_cached("a.com", "foo", None).unwrap(), CacheLookup::Miss);
        assert_eq!(svc.cache_stats().refused_backfills, 1);

        // The follow-up read goes through the gate again and finds nothing.
        let again = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.get("a.com", "foo", None).await })
        };
        release_tx.send(()).unwrap();
        assert_eq!(again.await.unwrap().unwrap(), None);
        drop(entered_rx);
    }

    #[test]
    fn closed_store_leaves_cache_untouched() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let svc = rt.block_on(async { ContentPrefService::in_memory() }).unwrap();
        // Dropping the runtime drops the worker and closes its queue.
        drop(rt);

        assert!(matches!(svc.set("a.com", "foo", 1, None), Err(PrefsError::StoreClosed)));
        assert_eq!(svc.get_cached("a.com", "foo", None).unwrap(), CacheLookup::Miss);
        assert!(matches!(svc.remove_all_globals(None), Err(PrefsError::StoreClosed)));
        assert_eq!(svc.cache_stats().entries, 0);
    }
}
