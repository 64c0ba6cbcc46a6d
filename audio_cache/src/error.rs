//! Error taxonomy for the cache core.

use thiserror::Error;

pub use crate::store::StoreError;

/// Upstream synthesis failure, carrying whatever status and detail the
/// provider reported. Never retried inside the core.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    /// Genuine storage I/O failure; surfaced, not swallowed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// No credential/configuration exists for the named provider; no
    /// synthesis is attempted.
    #[error("no provider configured for '{0}'")]
    ProviderUnavailable(String),

    /// The upstream synthesis call failed.
    #[error("provider '{provider}' failed: {source}")]
    ProviderFailed {
        provider: String,
        #[source]
        source: ProviderError,
    },
}
