//! Pool allocator errors

use thiserror::Error;

type Cause = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the shared state store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored revision no longer matches the caller's expectation.
    /// The only expected error during normal operation; it drives the
    /// allocator's retry loop and never reaches external callers.
    #[error("state object was modified concurrently")]
    Conflict,

    /// Another writer created the state object first.
    #[error("state object already exists")]
    AlreadyExists,

    /// Transport-level failure talking to the store.
    #[error("state store unavailable: {source}")]
    Unavailable {
        #[source]
        source: Cause,
    },

    /// The stored payload could not be decoded.
    #[error("stored state is corrupt: {source}")]
    Corrupt {
        #[source]
        source: Cause,
    },
}

impl StoreError {
    pub(crate) fn unavailable(source: impl Into<Cause>) -> Self {
        Self::Unavailable {
            source: source.into(),
        }
    }

    pub(crate) fn corrupt(source: impl Into<Cause>) -> Self {
        Self::Corrupt {
            source: source.into(),
        }
    }
}

/// Errors that can occur while managing the VM IP pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every configured IP is currently allocated.
    #[error("no available IPs in pool")]
    PoolExhausted,

    /// The allocation kept losing the optimistic-lock race.
    /// Transient; the caller may retry the whole operation.
    #[error("IP allocation retries exhausted")]
    AllocationRetryExhausted(#[source] StoreError),

    /// The deallocation kept losing the optimistic-lock race.
    #[error("IP deallocation retries exhausted")]
    DeallocationRetryExhausted(#[source] StoreError),

    /// Startup state recovery kept losing the optimistic-lock race.
    #[error("state recovery retries exhausted")]
    RecoveryRetryExhausted(#[source] StoreError),

    /// Shared state store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The local node name could not be determined from any source.
    #[error(
        "node identity unknown: tried the NODE_NAME environment variable, \
         the downward-API file and the hostname file"
    )]
    NodeIdentityUnknown,

    /// An address failed syntax validation.
    #[error("invalid IP address {ip:?}: {source}")]
    InvalidIpAddress {
        ip: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// The pool configuration is unusable.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}
