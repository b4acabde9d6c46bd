//! Tier store traits consumed by the orchestrator.
//!
//! Tier-1 is local and synchronous: it holds decoded values behind `Arc` so a
//! hit is a reference-count bump. Tier-2 is remote and asynchronous: it only
//! ever sees bytes produced by the `SerializationGate`.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::key::CacheKey;
use crate::policy::{Tier1Policy, Tier2Policy};

/// A decoded value held by the local tier.
pub type LocalValue = Arc<dyn Any + Send + Sync>;

/// Local, per-process store (Tier-1).
///
/// Implementations may evict entries at any time. Calls must not block on I/O.
pub trait LocalTier: Send + Sync {
    /// Returns the live value for `key`, or `None` if absent or expired.
    fn get(&self, key: &CacheKey) -> Option<LocalValue>;

    /// Inserts or replaces the value for `key`.
    fn set(&self, key: &CacheKey, value: LocalValue, policy: &Tier1Policy);

    /// Removes the value for `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` only when the store itself is broken.
    fn remove(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// Number of entries currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared, network-reachable store (Tier-2).
///
/// Every call may fail or stall; the orchestrator never calls an implementation
/// directly, only through its resilience guard which bounds each call with a
/// timeout.
#[async_trait]
pub trait RemoteTier: Send + Sync {
    /// Fetches the payload for `key`.
    ///
    /// Returns `Ok(None)` when the key does not exist.
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores the payload for `key`, replacing any previous one. The write is
    /// all-or-nothing.
    async fn set(&self, key: &CacheKey, payload: &[u8], policy: &Tier2Policy)
    -> Result<(), StoreError>;

    /// Deletes `key`. Deleting a missing key is not an error.
    async fn remove(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// Checks that the backend answers. Stores without a connection have
    /// nothing to check.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;
}

/// A remote tier that stores nothing, for Tier-1-only deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTier;

#[async_trait]
impl RemoteTier for NullTier {
    async fn get(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &CacheKey,
        _payload: &[u8],
        _policy: &Tier2Policy,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn remove(&self, _key: &CacheKey) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}
