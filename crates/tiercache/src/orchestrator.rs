//! The read-through orchestrator.
//!
//! ## Lookup Order
//!
//! ```text
//! get_or_create(key)
//!   → Tier-1 hit?                    return
//!   → Tier-2 hit (via guard)?        promote to Tier-1, return
//!   → acquire flight
//!       Owner:    re-check Tier-1 → factory() → Tier-2 → Tier-1 → release
//!       Follower: wait for the owner's outcome
//! ```
//!
//! Tier-2 is only ever reached through the [`ResilienceGuard`]; its failures
//! are logged and absorbed, never returned to the caller. The only errors a
//! read path can produce are an invalid key, a factory failure, an encoding
//! failure of the produced value, cancellation, or a type mismatch between
//! concurrent flights.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tiercache_core::{
    CacheError, CacheKey, CacheResult, CacheValue, EntryOptions, KeyCodec, LocalTier,
    LocalValue, NullTier, PayloadFormat, RemoteTier, SerializationGate, StoreError, Tier,
    Tier1Policy,
};
use tiercache_redis::create_redis_tier;
use tokio_util::sync::CancellationToken;

use crate::config::CacheSettings;
use crate::memory::MemoryTier;
use crate::metrics;
use crate::resilience::{HealthMode, ResilienceConfig, ResilienceGuard, ResilienceSnapshot};
use crate::single_flight::{FollowerTicket, OwnerTicket, SingleFlightRegistry, Ticket};

/// Tier-1 policy applied when a Tier-2 hit is promoted by [`TieredCache::get`].
pub const DEFAULT_TIER1_TTL: Duration = Duration::from_secs(300);

/// Two-tier read-through cache with per-key factory deduplication.
///
/// Share it behind an `Arc`; every operation takes `&self`.
pub struct TieredCache {
    local: Arc<dyn LocalTier>,
    remote: Arc<dyn RemoteTier>,
    guard: ResilienceGuard,
    flights: SingleFlightRegistry,
    keys: KeyCodec,
    gate: SerializationGate,
    default_tier1: Tier1Policy,
    remove_corrupt_entries: bool,
    tier1_hits: AtomicU64,
    tier2_hits: AtomicU64,
    misses: AtomicU64,
    factory_invocations: AtomicU64,
    factory_failures: AtomicU64,
}

impl TieredCache {
    pub fn builder() -> TieredCacheBuilder {
        TieredCacheBuilder::default()
    }

    /// Wire a cache from settings: a [`MemoryTier`], plus Redis when enabled.
    ///
    /// Settings are validated first. Falls back to Tier-1-only when the Redis
    /// pool cannot be created. The Tier-1 sweeper is started when called
    /// inside a Tokio runtime.
    pub fn from_settings(settings: &CacheSettings) -> CacheResult<Self> {
        settings.validate().map_err(CacheError::InvalidConfig)?;

        let memory = Arc::new(match settings.tier1.max_entries {
            Some(max) => MemoryTier::with_capacity(max),
            None => MemoryTier::new(),
        });
        if let Some(interval) = settings.tier1.cleanup_interval() {
            if tokio::runtime::Handle::try_current().is_ok() {
                let _ = memory.spawn_cleanup_task(interval);
            } else {
                tracing::debug!("no Tokio runtime, tier-1 cleanup task not started");
            }
        }

        let remote: Arc<dyn RemoteTier> = if settings.redis.enabled {
            match create_redis_tier(&settings.redis) {
                Ok(tier) => Arc::new(tier),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Failed to create Redis pool. Falling back to tier-1 only."
                    );
                    Arc::new(NullTier)
                }
            }
        } else {
            tracing::info!("Redis disabled, using tier-1 only");
            Arc::new(NullTier)
        };

        Ok(Self::builder()
            .local_tier(memory)
            .remote_tier(remote)
            .payload_format(settings.codec)
            .namespace(settings.namespace.clone())
            .max_key_len(settings.max_key_len)
            .resilience((&settings.resilience).into())
            .default_tier1_policy(settings.tier1.default_policy())
            .remove_corrupt_entries(settings.remove_corrupt_entries)
            .build())
    }

    /// Look `key` up in both tiers without ever calling a factory.
    ///
    /// A Tier-2 hit is promoted into Tier-1 with the default Tier-1 policy.
    ///
    /// # Errors
    ///
    /// Only `CacheError::InvalidKey`.
    pub async fn get<T: CacheValue>(&self, key: &str) -> CacheResult<Option<T>> {
        let key = self.keys.encode(key)?;
        let found = self.lookup::<T>(&key, &self.default_tier1).await;
        if found.is_none() {
            self.record_miss(&key);
        }
        Ok(found)
    }

    /// Return the cached value for `key`, computing it with `factory` on a
    /// miss in both tiers.
    ///
    /// Concurrent callers for the same key share one factory execution and
    /// its outcome. A failed factory result is never cached.
    ///
    /// # Errors
    ///
    /// `InvalidKey`, `Factory` (shared by every waiter of the flight),
    /// `Encoding` if the produced value cannot be serialized, `Cancelled` if
    /// the flight owner was dropped, or `TypeMismatch` if a concurrent flight
    /// for the key produced another type.
    pub async fn get_or_create<T, F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        options: EntryOptions,
    ) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.get_or_create_with_cancellation(key, factory, options, &CancellationToken::new())
            .await
    }

    /// [`get_or_create`](Self::get_or_create) with an explicit cancellation
    /// token.
    ///
    /// Cancelling the flight owner resolves the flight with `Cancelled` for
    /// every follower. Cancelling a follower only stops its own wait.
    ///
    /// # Errors
    ///
    /// Same as [`get_or_create`](Self::get_or_create), plus `Cancelled` when
    /// `cancel` fires first.
    pub async fn get_or_create_with_cancellation<T, F, Fut, E>(
        &self,
        key: &str,
        factory: F,
        options: EntryOptions,
        cancel: &CancellationToken,
    ) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let key = self.keys.encode(key)?;

        if let Some(value) = self.lookup::<T>(&key, &options.tier1).await {
            return Ok(value);
        }
        self.record_miss(&key);

        match self.flights.acquire(&key) {
            Ticket::Owner(ticket) => self.run_owner(ticket, factory, &options, cancel).await,
            Ticket::Follower(ticket) => self.await_flight::<T>(&key, ticket, cancel).await,
        }
    }

    /// Write `value` to both tiers, replacing whatever is there.
    ///
    /// # Errors
    ///
    /// `InvalidKey`, or `Encoding` if the value cannot be serialized. Tier-2
    /// failures are absorbed.
    pub async fn set<T: CacheValue>(
        &self,
        key: &str,
        value: T,
        options: EntryOptions,
    ) -> CacheResult<()> {
        let key = self.keys.encode(key)?;
        self.write_through(&key, value, &options).await?;
        Ok(())
    }

    /// Remove `key` from both tiers.
    ///
    /// Both removals are always attempted.
    ///
    /// # Errors
    ///
    /// `InvalidKey`; `PartialRemoval` when exactly one tier failed;
    /// `RemovalFailed` when both did. A Tier-2 removal skipped because the
    /// backend is degraded counts as a Tier-2 failure.
    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        let key = self.keys.encode(key)?;

        // Tier-2 first so a concurrent `get` cannot promote the old value back.
        let tier2 = self
            .guard
            .call("remove", || self.remote.remove(&key))
            .await;
        let tier1 = self.local.remove(&key);

        match (tier1, tier2) {
            (Ok(()), Ok(())) => {
                tracing::debug!(key = %key, "cache entry removed (L1+L2)");
                Ok(())
            }
            (Err(source), Ok(())) => Err(CacheError::PartialRemoval {
                tier: Tier::Local,
                source,
            }),
            (Ok(()), Err(source)) => Err(CacheError::PartialRemoval {
                tier: Tier::Remote,
                source,
            }),
            (Err(tier1), Err(tier2)) => Err(CacheError::RemovalFailed { tier1, tier2 }),
        }
    }

    /// Check Tier-2 reachability through the guard.
    ///
    /// # Errors
    ///
    /// The `StoreError` from the backend, or `Unavailable` while degraded.
    pub async fn ping_tier2(&self) -> Result<(), StoreError> {
        self.guard.call("ping", || self.remote.ping()).await
    }

    pub fn tier2_mode(&self) -> HealthMode {
        self.guard.mode()
    }

    pub fn tier2_name(&self) -> &'static str {
        self.remote.name()
    }

    pub fn resilience(&self) -> ResilienceSnapshot {
        self.guard.snapshot()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            tier1_hits: self.tier1_hits.load(Ordering::Relaxed),
            tier2_hits: self.tier2_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            factory_invocations: self.factory_invocations.load(Ordering::Relaxed),
            factory_failures: self.factory_failures.load(Ordering::Relaxed),
            tier1_entries: self.local.len(),
            tier2_mode: self.guard.mode(),
            in_flight: self.flights.in_flight(),
        }
    }

    /// Tier-1, then Tier-2 with promotion. Records hits, not misses.
    async fn lookup<T: CacheValue>(&self, key: &CacheKey, promote: &Tier1Policy) -> Option<T> {
        if let Some(value) = self.local_get::<T>(key) {
            tracing::debug!(key = %key, "cache hit (L1)");
            self.tier1_hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_hit("L1");
            return Some(value);
        }

        let value = self.remote_get::<T>(key).await?;
        tracing::debug!(key = %key, "cache hit (L2)");
        self.tier2_hits.fetch_add(1, Ordering::Relaxed);
        metrics::record_hit("L2");
        self.local.set(key, Arc::new(value.clone()), promote);
        Some(value)
    }

    fn local_get<T: CacheValue>(&self, key: &CacheKey) -> Option<T> {
        let value = self.local.get(key)?;
        match value.downcast_ref::<T>() {
            Some(value) => Some(value.clone()),
            None => {
                tracing::debug!(
                    key = %key,
                    expected = SerializationGate::type_tag::<T>(),
                    "L1 entry holds another type, treating as miss"
                );
                None
            }
        }
    }

    async fn remote_get<T: CacheValue>(&self, key: &CacheKey) -> Option<T> {
        let bytes = match self.guard.call("get", || self.remote.get(key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            // Already counted and logged by the guard
            Err(_) => return None,
        };

        match self.gate.decode::<T>(&bytes) {
            Ok(value) => value,
            Err(e) if !e.is_corrupt() => {
                tracing::debug!(key = %key, error = %e, "L2 entry holds another type, treating as miss");
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable L2 payload, treating as miss");
                if self.remove_corrupt_entries {
                    if let Err(e) = self.guard.call("remove", || self.remote.remove(key)).await {
                        tracing::debug!(key = %key, error = %e, "could not remove corrupt L2 entry");
                    }
                }
                None
            }
        }
    }

    /// Encode, write Tier-2, then Tier-1. Returns the value stored in Tier-1.
    async fn write_through<T: CacheValue>(
        &self,
        key: &CacheKey,
        value: T,
        options: &EntryOptions,
    ) -> CacheResult<LocalValue> {
        let payload = self.gate.encode(&value)?;

        let result = self
            .guard
            .call("set", || {
                self.remote
                    .set(key, payload.as_bytes(), &options.tier2)
            })
            .await;
        match result {
            Ok(()) => tracing::debug!(key = %key, bytes = payload.len(), "cache set (L2)"),
            Err(e) => tracing::debug!(key = %key, error = %e, "L2 write skipped"),
        }

        let local: LocalValue = Arc::new(value);
        self.local.set(key, Arc::clone(&local), &options.tier1);
        tracing::debug!(key = %key, "cache set (L1)");
        Ok(local)
    }

    async fn run_owner<T, F, Fut, E>(
        &self,
        ticket: OwnerTicket<'_>,
        factory: F,
        options: &EntryOptions,
        cancel: &CancellationToken,
    ) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        let key = ticket.key().clone();

        // A previous flight may have populated Tier-1 since our lookup.
        if let Some(value) = self.local_get::<T>(&key) {
            tracing::debug!(key = %key, "cache hit (L1) after acquiring flight");
            ticket.release(Ok(Arc::new(value.clone())));
            return Ok(value);
        }

        self.factory_invocations.fetch_add(1, Ordering::Relaxed);
        metrics::record_factory_invocation();
        tracing::debug!(key = %key, "invoking factory");

        // Returning early drops the ticket, which cancels the followers.
        let produced = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(key = %key, "factory cancelled");
                return Err(CacheError::Cancelled);
            }
            produced = factory() => produced,
        };

        let value = match produced {
            Ok(value) => value,
            Err(e) => {
                self.factory_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_factory_failure();
                let error = CacheError::factory(e);
                tracing::debug!(key = %key, error = %error, "factory failed");
                ticket.release(Err(error.clone()));
                return Err(error);
            }
        };

        match self.write_through(&key, value.clone(), options).await {
            Ok(local) => {
                ticket.release(Ok(local));
                Ok(value)
            }
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "factory value could not be encoded");
                ticket.release(Err(error.clone()));
                Err(error)
            }
        }
    }

    async fn await_flight<T: CacheValue>(
        &self,
        key: &CacheKey,
        ticket: FollowerTicket,
        cancel: &CancellationToken,
    ) -> CacheResult<T> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            outcome = ticket.wait() => outcome,
        };

        let value = outcome?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| CacheError::TypeMismatch {
                key: self.keys.decode(key).to_string(),
                expected: SerializationGate::type_tag::<T>(),
            })
    }

    fn record_miss(&self, key: &CacheKey) {
        tracing::debug!(key = %key, "cache miss");
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_miss();
    }
}

/// Builder for [`TieredCache`].
///
/// Defaults: unbounded [`MemoryTier`], [`NullTier`], MessagePack payloads,
/// no namespace, default resilience thresholds.
pub struct TieredCacheBuilder {
    local: Option<Arc<dyn LocalTier>>,
    remote: Option<Arc<dyn RemoteTier>>,
    format: PayloadFormat,
    namespace: String,
    max_key_len: usize,
    resilience: ResilienceConfig,
    default_tier1: Tier1Policy,
    remove_corrupt_entries: bool,
}

impl Default for TieredCacheBuilder {
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            format: PayloadFormat::default(),
            namespace: String::new(),
            max_key_len: tiercache_core::DEFAULT_MAX_KEY_LEN,
            resilience: ResilienceConfig::default(),
            default_tier1: Tier1Policy::absolute(DEFAULT_TIER1_TTL),
            remove_corrupt_entries: true,
        }
    }
}

impl TieredCacheBuilder {
    pub fn local_tier(mut self, tier: Arc<dyn LocalTier>) -> Self {
        self.local = Some(tier);
        self
    }

    pub fn remote_tier(mut self, tier: Arc<dyn RemoteTier>) -> Self {
        self.remote = Some(tier);
        self
    }

    pub fn payload_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    /// Prefix applied to every key in both tiers.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn max_key_len(mut self, max_key_len: usize) -> Self {
        self.max_key_len = max_key_len;
        self
    }

    pub fn resilience(mut self, config: ResilienceConfig) -> Self {
        self.resilience = config;
        self
    }

    /// Tier-1 policy used when [`TieredCache::get`] promotes a Tier-2 hit.
    pub fn default_tier1_policy(mut self, policy: Tier1Policy) -> Self {
        self.default_tier1 = policy;
        self
    }

    pub fn remove_corrupt_entries(mut self, enabled: bool) -> Self {
        self.remove_corrupt_entries = enabled;
        self
    }

    pub fn build(self) -> TieredCache {
        let local = self
            .local
            .unwrap_or_else(|| Arc::new(MemoryTier::new()) as Arc<dyn LocalTier>);
        let remote = self
            .remote
            .unwrap_or_else(|| Arc::new(NullTier) as Arc<dyn RemoteTier>);
        let guard = ResilienceGuard::new(remote.name(), self.resilience);

        TieredCache {
            local,
            remote,
            guard,
            flights: SingleFlightRegistry::new(),
            keys: KeyCodec::new(self.namespace).with_max_len(self.max_key_len),
            gate: SerializationGate::new(self.format),
            default_tier1: self.default_tier1,
            remove_corrupt_entries: self.remove_corrupt_entries,
            tier1_hits: AtomicU64::new(0),
            tier2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            factory_invocations: AtomicU64::new(0),
            factory_failures: AtomicU64::new(0),
        }
    }
}

/// Counters for one [`TieredCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub tier1_hits: u64,
    pub tier2_hits: u64,
    /// Lookups that missed both tiers.
    pub misses: u64,
    pub factory_invocations: u64,
    pub factory_failures: u64,
    pub tier1_entries: usize,
    pub tier2_mode: HealthMode,
    pub in_flight: usize,
}

impl CacheStats {
    /// Hit rate across both tiers as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.tier1_hits + self.tier2_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tiercache_core::ErrorCategory;

    fn options() -> EntryOptions {
        EntryOptions::with_ttls(Duration::from_secs(60), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_get_on_empty_cache_returns_none() {
        let cache = TieredCache::builder().build();
        let value: Option<String> = cache.get("missing").await.unwrap();
        assert!(value.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected() {
        let cache = TieredCache::builder().build();
        let err = cache.get::<String>("").await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));

        let err = cache.set("bad\nkey", 1u32, options()).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn test_get_or_create_caches_factory_value() {
        let cache = TieredCache::builder().build();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: String = cache
                .get_or_create(
                    "k",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, std::io::Error>("computed".to_string())
                    },
                    options(),
                )
                .await
                .unwrap();
            assert_eq!(value, "computed");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.factory_invocations, 1);
        assert_eq!(stats.tier1_hits, 2);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_factory_failure_is_not_cached() {
        let cache = TieredCache::builder().build();

        let err = cache
            .get_or_create::<u32, _, _, _>("k", || async { Err("boom") }, options())
            .await
            .unwrap_err();
        assert!(err.is_factory());

        let value = cache
            .get_or_create("k", || async { Ok::<_, std::io::Error>(7u32) }, options())
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(cache.stats().factory_failures, 1);
    }

    #[tokio::test]
    async fn test_set_overwrites_and_remove_clears() {
        let cache = TieredCache::builder().build();

        cache.set("k", 1u64, options()).await.unwrap();
        cache.set("k", 2u64, options()).await.unwrap();
        assert_eq!(cache.get::<u64>("k").await.unwrap(), Some(2));

        cache.remove("k").await.unwrap();
        assert_eq!(cache.get::<u64>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tier1_type_mismatch_is_a_miss() {
        let cache = TieredCache::builder().build();
        cache.set("k", 1u64, options()).await.unwrap();

        assert_eq!(cache.get::<String>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancelled_before_factory_runs() {
        let cache = TieredCache::builder().build();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = cache
            .get_or_create_with_cancellation(
                "k",
                || async { Ok::<_, std::io::Error>(1u8) },
                options(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(cache.stats().in_flight, 0);
        assert_eq!(cache.get::<u8>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_namespace_isolates_caches_sharing_a_tier() {
        let local: Arc<dyn LocalTier> = Arc::new(MemoryTier::new());
        let a = TieredCache::builder()
            .local_tier(Arc::clone(&local))
            .namespace("a")
            .build();
        let b = TieredCache::builder().local_tier(local).namespace("b").build();

        a.set("k", "from-a".to_string(), options()).await.unwrap();
        assert_eq!(b.get::<String>("k").await.unwrap(), None);
        assert_eq!(a.get::<String>("k").await.unwrap().as_deref(), Some("from-a"));
    }

    #[tokio::test]
    async fn test_from_settings_without_redis() {
        let mut settings = CacheSettings::default();
        settings.namespace = "svc".into();
        let cache = TieredCache::from_settings(&settings).unwrap();

        assert_eq!(cache.tier2_name(), "none");
        cache.set("k", 5i32, options()).await.unwrap();
        assert_eq!(cache.get::<i32>("k").await.unwrap(), Some(5));
        assert!(cache.ping_tier2().await.is_ok());
    }

    #[test]
    fn test_from_settings_rejects_invalid_settings() {
        let mut settings = CacheSettings::default();
        settings.resilience.failure_threshold = 0;

        let err = TieredCache::from_settings(&settings).err().unwrap();
        assert!(matches!(err, CacheError::InvalidConfig(ref m) if m.contains("failure_threshold")));
        assert_eq!(err.category(), ErrorCategory::Contract);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            tier1_hits: 2,
            tier2_hits: 1,
            misses: 1,
            factory_invocations: 1,
            factory_failures: 0,
            tier1_entries: 1,
            tier2_mode: HealthMode::Healthy,
            in_flight: 0,
        };
        assert!((stats.hit_rate() - 75.0).abs() < 0.001);
    }
}
