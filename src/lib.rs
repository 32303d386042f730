pub mod config;
pub mod errors;
pub mod prefs;

pub use config::{FailurePolicy, PrefStoreConfig};
pub use errors::PrefsError;
pub use prefs::*;
