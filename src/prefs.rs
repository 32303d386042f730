//! Content preferences for the Gosub engine.
//!
//! A content preference is a named value attached either to a site (a host
//! such as `a.com`) or to the global scope, e.g. a per-site zoom level or a
//! global default for it. Preferences live in one of two partitions, normal
//! and private, selected by the [`LoadContext`] of the caller.
//!
//! # Concepts
//!
//! - **Host**: callers may pass bare hostnames or full URIs; both are reduced
//!   to a canonical [`Host`]. `b.a.com` is a subdomain of `a.com`, `ba.com` is
//!   not.
//! - **Cache**: every service keeps a [`PrefCache`] mirror. Writes and removals
//!   apply to it before they return, so reads see them immediately.
//! - **Durable store**: a [`PrefStorage`] table, driven by a single worker
//!   that runs operations in issue order. Mutations return a [`Completion`]
//!   that resolves once the durable store has caught up.
//! - **Events**: [`ContentPrefService::subscribe`] yields [`PrefEvent`]s after
//!   changes reach the durable store.
//!
//! # Example
//!
//! ```no_run
//! use gosub_prefs::prefs::{ContentPrefService, LoadContext};
//!
//! # async fn demo() -> Result<(), gosub_prefs::errors::PrefsError> {
//! let prefs = ContentPrefService::in_memory()?;
//! prefs.set("http://a.com/page", "zoom", 1.5, None)?;
//! prefs.set("b.a.com", "zoom", 2.0, Some(LoadContext::Private))?;
//!
//! // Removing a.com and its subdomains is visible right away.
//! let done = prefs.remove_by_subdomain("a.com", None)?;
//! assert_eq!(prefs.get("a.com", "zoom", None).await?, None);
//! done.wait().await?;
//! # Ok(()) }
//! ```

pub mod cache;
pub mod completion;
pub mod context;
pub mod domain;
pub mod event;
pub mod service;
pub mod store;
pub mod types;

mod worker;

pub use cache::{CacheLookup, CacheStats, PrefCache};
pub use completion::{Completion, OpId, OpState};
pub use context::LoadContext;
pub use domain::{covers, normalize, Host};
pub use event::{PrefEvent, Subscription};
pub use service::ContentPrefService;
pub use store::{EphemeralPrivate, InMemoryPrefStore, PrefStorage};
#[cfg(feature = "sqlite_store")]
pub use store::SqlitePrefStore;
pub use types::{Partition, PartitionSet, PrefEntry, PrefFilter, PrefKey, PrefValue, Scope, ScopeFilter, StoreId};
