//! Error types for the tiered cache.
//!
//! `StoreError` is what a tier implementation reports. `CacheError` is what the
//! orchestrator hands back to callers. Every variant is `Clone` because a single
//! flight outcome is delivered to many waiters.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::payload::EncodingError;

/// Shared, type-erased error produced by a caller-supplied factory.
pub type FactoryError = Arc<dyn StdError + Send + Sync + 'static>;

/// Identifies one of the two cache tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Local, per-process store.
    Local,
    /// Shared, network-reachable store.
    Remote,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "L1"),
            Self::Remote => write!(f, "L2"),
        }
    }
}

/// Errors reported by a tier implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Could not obtain a connection to the backend.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
    },

    /// The backend did not answer within the allotted time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend was skipped because it is considered unhealthy.
    #[error("Backend unavailable (circuit open)")]
    Unavailable,

    /// The backend answered with an error.
    #[error("Backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },
}

impl StoreError {
    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns `true` if the call was skipped without reaching the backend.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// Returns `true` if the call timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors surfaced to callers of the cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The application key cannot be mapped into the cache key space.
    #[error("Invalid cache key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected application key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Settings rejected before the cache was built.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The value could not be turned into a payload.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The factory failed. Shared verbatim with every waiter of the flight.
    #[error("Factory failed: {0}")]
    Factory(#[source] FactoryError),

    /// The factory execution was cancelled before producing a result.
    #[error("Operation cancelled")]
    Cancelled,

    /// A concurrent flight for the same key produced a value of another type.
    #[error("In-flight value for key {key:?} is not a {expected}")]
    TypeMismatch {
        /// The key of the flight.
        key: String,
        /// The type name the waiter asked for.
        expected: &'static str,
    },

    /// Exactly one tier failed to remove the entry; the other removal succeeded.
    #[error("Removal failed on {tier}: {source}")]
    PartialRemoval {
        /// The tier that failed.
        tier: Tier,
        /// The failure reported by that tier.
        #[source]
        source: StoreError,
    },

    /// Both tiers failed to remove the entry.
    #[error("Removal failed on both tiers (L1: {tier1}; L2: {tier2})")]
    RemovalFailed {
        /// The Tier-1 failure.
        tier1: StoreError,
        /// The Tier-2 failure.
        tier2: StoreError,
    },
}

impl CacheError {
    /// Creates a new `InvalidKey` error.
    #[must_use]
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Wraps a factory failure so it can be shared between waiters.
    #[must_use]
    pub fn factory<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::Factory(Arc::from(err.into()))
    }

    /// Returns `true` if this is a factory failure.
    #[must_use]
    pub fn is_factory(&self) -> bool {
        matches!(self, Self::Factory(_))
    }

    /// Returns `true` if this is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidKey { .. } | Self::InvalidConfig(_) | Self::TypeMismatch { .. } => {
                ErrorCategory::Contract
            }
            Self::Encoding(_) => ErrorCategory::Codec,
            Self::Factory(_) => ErrorCategory::Factory,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::PartialRemoval { .. } | Self::RemovalFailed { .. } => ErrorCategory::Store,
        }
    }
}

/// Categories of cache errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Caller misuse (bad key or settings, mismatched types).
    Contract,
    /// Payload encoding.
    Codec,
    /// The caller's factory failed.
    Factory,
    /// Cancellation.
    Cancelled,
    /// A tier store failed.
    Store,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contract => write!(f, "contract"),
            Self::Codec => write!(f, "codec"),
            Self::Factory => write!(f, "factory"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Store => write!(f, "store"),
        }
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
