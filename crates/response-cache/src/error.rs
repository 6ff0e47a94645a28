//! Error types for the response cache.

use thiserror::Error;

/// Failures reported by a storage collaborator.
///
/// The orchestrator never lets these escape a request: a failed `get` is a miss and a
/// failed `set`/`remove` is a no-op.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("stored entry under {key} is corrupt")]
    Corrupt { key: String },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Internal invariant breaches. These indicate a bug in the caller, not a cache miss.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("a vary key was requested but no vary rules are present")]
    MissingVaryRules,

    #[error("response headers were not finalized before the body completed")]
    HeadersNotFinalized,
}
