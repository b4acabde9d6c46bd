//! Two-tier read-through cache.
//!
//! ## Architecture
//!
//! - **Tier-1 ([`MemoryTier`])**: in-process, decoded values behind `Arc`
//! - **Tier-2 ([`RedisTier`])**: shared across instances, encoded payloads
//! - **Factory**: the caller's slow source, run at most once per key at a time
//!
//! ## Cache Hierarchy
//!
//! ```text
//! get_or_create → Tier-1 → Tier-2 (guarded) → factory (single flight)
//!                   ↓           ↓                  ↓
//!               <1µs        ~1-5ms             caller-defined
//! ```
//!
//! ## Graceful Degradation
//!
//! Tier-2 failures never reach the caller. After repeated failures the
//! [`ResilienceGuard`] stops calling Tier-2 and the cache serves from Tier-1
//! and the factory until a probe succeeds again.

pub mod config;
pub mod memory;
pub mod metrics;
pub mod observability;
pub mod orchestrator;
pub mod resilience;
pub mod single_flight;

pub use config::{CacheSettings, LoggingConfig, ResilienceSettings, Tier1Settings};
pub use memory::{MemoryTier, MemoryTierStats};
pub use orchestrator::{CacheStats, DEFAULT_TIER1_TTL, TieredCache, TieredCacheBuilder};
pub use resilience::{HealthMode, ResilienceConfig, ResilienceGuard, ResilienceSnapshot};
pub use single_flight::{SingleFlightRegistry, Ticket};

pub use tiercache_core::{
    CacheError, CacheKey, CacheResult, CacheValue, EntryOptions, ErrorCategory, Expiration,
    KeyCodec, LocalTier, NullTier, PayloadFormat, Priority, RemoteTier, StoreError, Tier,
    Tier1Policy, Tier2Policy,
};
pub use tiercache_redis::{RedisConfig, RedisTier};
pub use tokio_util::sync::CancellationToken;

/// Create a cache from settings and report Tier-2 reachability.
///
/// Applies `logging.level` when tracing was set up with
/// [`observability::init_tracing`].
///
/// ## Graceful Degradation
///
/// An unreachable Redis at startup is logged but kept: the guard counts the
/// failure and will probe it again, so the cache recovers on its own once
/// Redis comes up.
pub async fn create_tiered_cache(settings: &CacheSettings) -> CacheResult<TieredCache> {
    let cache = TieredCache::from_settings(settings)?;
    observability::apply_logging_level(&settings.logging.level);

    if settings.redis.enabled && cache.tier2_name() == "redis" {
        tracing::info!(url = %settings.redis.url, "Connecting to Redis");
        match cache.ping_tier2().await {
            Ok(()) => tracing::info!("Connected to Redis successfully"),
            Err(e) => tracing::warn!(
                error = %e,
                mode = cache.tier2_mode().as_str(),
                "Redis unreachable at startup. Serving from tier-1 until it recovers."
            ),
        }
    }

    Ok(cache)
}
