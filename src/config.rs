//! Preference store configuration.
//!
//! `PrefStoreConfig` controls the cache and durability behavior of a single
//! [`ContentPrefService`](crate::prefs::ContentPrefService). It provides
//! sensible defaults via [`Default`] and a fluent [`PrefStoreConfig::builder()`]
//! with validation.
//!
//! # Examples
//!
//! ```rust
//! use gosub_prefs::config::{FailurePolicy, PrefStoreConfig};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = PrefStoreConfig::builder()
//!     .max_cached_entries(1024)
//!     .cache_absent(false)
//!     .failure_policy(FailurePolicy::Resync)
//!     .build()?; // returns Result<PrefStoreConfig, ConfigError>
//! assert_eq!(cfg.max_cached_entries, 1024);
//! # Ok(()) }
//! ```
//!
//! # Fields (summary)
//! - `max_cached_entries`: Upper bound on mirrored entries, tombstones included (default: 16384).
//! - `cache_absent`: Record "known absent" after a durable miss (default: `true`).
//! - `persist_private`: Let private-partition rows reach the durable store (default: `false`).
//! - `failure_policy`: What the cache does when a durable write fails (default: `KeepCache`).
//! - `event_capacity`: Buffer size of the change notification channel (default: 64).

use std::fmt;

pub const DEFAULT_MAX_CACHED_ENTRIES: usize = 16 * 1024;
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Cache behavior after the durable store rejects an already-applied mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep the cache as the caller left it. A failed removal still reads as
    /// removed; the durable row may linger until the removal is retried.
    #[default]
    KeepCache,
    /// Drop the affected entries back to "unknown" so later reads go to the
    /// durable store and see what it actually holds.
    Resync,
}

#[derive(Debug, Clone)]
pub struct PrefStoreConfig {
    pub max_cached_entries: usize,
    pub cache_absent: bool,
    pub persist_private: bool,
    pub failure_policy: FailurePolicy,
    pub event_capacity: usize,
}

impl Default for PrefStoreConfig {
    fn default() -> Self {
        Self {
            max_cached_entries: DEFAULT_MAX_CACHED_ENTRIES,
            cache_absent: true,
            persist_private: false,
            failure_policy: FailurePolicy::KeepCache,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PrefStoreConfig {
    pub fn builder() -> PrefStoreConfigBuilder {
        PrefStoreConfigBuilder::default()
    }
}

/// Builder for [`PrefStoreConfig`].
#[derive(Debug, Clone, Default)]
pub struct PrefStoreConfigBuilder {
    inner: PrefStoreConfig,
}

impl PrefStoreConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut PrefStoreConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn max_cached_entries(self, n: usize) -> Self { self.map(|c| c.max_cached_entries = n) }
    pub fn cache_absent(self, on: bool) -> Self { self.map(|c| c.cache_absent = on) }
    pub fn persist_private(self, on: bool) -> Self { self.map(|c| c.persist_private = on) }
    pub fn failure_policy(self, policy: FailurePolicy) -> Self { self.map(|c| c.failure_policy = policy) }
    pub fn event_capacity(self, n: usize) -> Self { self.map(|c| c.event_capacity = n) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut PrefStoreConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<PrefStoreConfig, ConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroCacheEntries,
    ZeroEventCapacity,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroCacheEntries =>
                write!(f, "max_cached_entries must be at least 1"),
            ConfigError::ZeroEventCapacity =>
                write!(f, "event_capacity must be at least 1"),
        }
    }
}
impl std::error::Error for ConfigError {}

pub(crate) fn validate(c: &PrefStoreConfig) -> Result<(), ConfigError> {
    if c.max_cached_entries == 0 {
        return Err(ConfigError::ZeroCacheEntries);
    }
    if c.event_capacity == 0 {
        return Err(ConfigError::ZeroEventCapacity);
    }
    Ok(())
}
