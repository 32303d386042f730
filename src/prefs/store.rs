//! Durable preference storage.
//!
//! A [`PrefStorage`] is the durable table behind a
//! [`ContentPrefService`](crate::prefs::ContentPrefService). The service never
//! calls it directly from a caller's thread: every operation is queued and run
//! in issue order by the store's worker, off the async executor.
//!
//! Reference implementations:
//! - [`InMemoryPrefStore`]: ordered in-memory table (tests, ephemeral profiles).
//! - [`SqlitePrefStore`]: SQLite-backed table (feature `sqlite_store`).
//! - [`EphemeralPrivate`]: decorator that keeps private-partition rows in memory
//!   so private browsing data never reaches the disk.
mod ephemeral;
mod in_memory;
#[cfg(feature = "sqlite_store")]
mod sqlite;

use anyhow::Result;

use super::types::{PrefEntry, PrefFilter, PrefKey, PrefValue};

pub use ephemeral::EphemeralPrivate;
pub use in_memory::InMemoryPrefStore;
#[cfg(feature = "sqlite_store")]
pub use sqlite::SqlitePrefStore;

/// Object-safe durable table of preferences.
///
/// Implementations must be internally synchronized; all methods take `&self`.
/// Calls may block (disk I/O), the service runs them on a blocking thread.
pub trait PrefStorage: Send + Sync {
    /// Inserts or overwrites the entry for `entry.key`.
    fn upsert(&self, entry: &PrefEntry) -> Result<()>;

    /// Deletes every entry matching `filter`, returning the removed keys.
    fn delete_where(&self, filter: &PrefFilter) -> Result<Vec<PrefKey>>;

    /// Returns the value stored for `key`, if any.
    fn query(&self, key: &PrefKey) -> Result<Option<PrefValue>>;

    /// Returns every entry matching `filter`, ordered by key.
    fn select(&self, filter: &PrefFilter) -> Result<Vec<PrefEntry>>;
}
