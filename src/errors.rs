use crate::config::ConfigError;

/// Errors returned by the content preference service.
///
/// `InvalidArgument` and `InvalidDomain` are raised synchronously, before the
/// cache or the durable store is touched. `DurableFailure` is delivered later,
/// through a [`Completion`](crate::prefs::Completion) or a failed read.
#[derive(Debug, thiserror::Error)]
pub enum PrefsError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("Durable storage failure: {0}")]
    DurableFailure(String),

    #[error("Preference store is closed")]
    StoreClosed,

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl PrefsError {
    /// True for errors raised by argument validation (nothing was mutated).
    pub fn is_validation(&self) -> bool {
        matches!(self, PrefsError::InvalidArgument(_) | PrefsError::InvalidDomain(_))
    }
}
