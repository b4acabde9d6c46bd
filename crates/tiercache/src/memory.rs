//! In-memory local tier (L1).
//!
//! Values are stored decoded, behind `Arc`, in a sharded `DashMap`. Expiry is
//! checked lazily on read; [`MemoryTier::cleanup_expired`] (or the background
//! task from [`MemoryTier::spawn_cleanup_task`]) sweeps entries nobody reads.
//!
//! ## Capacity
//!
//! With `max_entries` set, inserting a new key into a full tier first drops
//! expired entries, then evicts by ascending priority and least recent
//! access. `Priority::NeverRemove` entries are never evicted for room; if
//! only those remain the insert is skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tiercache_core::{CacheKey, LocalTier, LocalValue, Priority, StoreError, Tier1Policy};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::metrics;

struct LocalEntry {
    value: LocalValue,
    deadline: Option<Instant>,
    sliding: Option<Duration>,
    last_access: Instant,
    priority: Priority,
}

impl LocalEntry {
    fn new(value: LocalValue, policy: &Tier1Policy, now: Instant) -> Self {
        let expiration = policy.expiration;
        Self {
            value,
            // Overflowing deadlines are treated as "never".
            deadline: expiration.absolute_ttl().and_then(|ttl| now.checked_add(ttl)),
            sliding: expiration.sliding_ttl(),
            last_access: now,
            priority: policy.priority,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
            || self
                .sliding
                .is_some_and(|idle| now.duration_since(self.last_access) >= idle)
    }
}

/// Local tier backed by a concurrent hash map.
pub struct MemoryTier {
    entries: DashMap<CacheKey, LocalEntry>,
    max_entries: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTier {
    /// Unbounded tier.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Tier holding at most `max_entries` keys.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::new()
        }
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
        metrics::set_tier1_entries(0);
    }

    /// Remove expired entries.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "expired tier-1 entries swept");
            metrics::set_tier1_entries(self.entries.len());
        }
        removed
    }

    /// Sweep expired entries every `interval` until the tier is dropped.
    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let tier: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tier) = tier.upgrade() else {
                    tracing::debug!("tier-1 dropped, stopping cleanup task");
                    break;
                };
                tier.cleanup_expired();
            }
        })
    }

    pub fn stats(&self) -> MemoryTierStats {
        MemoryTierStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Free one slot below `max`. Returns `false` if nothing can be evicted.
    fn make_room(&self, max: usize) -> bool {
        let expired = self.cleanup_expired();
        self.evictions.fetch_add(expired as u64, Ordering::Relaxed);

        while self.entries.len() >= max {
            let victim = self
                .entries
                .iter()
                .filter(|entry| entry.priority != Priority::NeverRemove)
                .min_by_key(|entry| (entry.priority, entry.last_access))
                .map(|entry| entry.key().clone());

            let Some(victim) = victim else {
                return false;
            };
            if self.entries.remove(&victim).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %victim, "tier-1 entry evicted for capacity");
            }
        }
        true
    }
}

impl LocalTier for MemoryTier {
    fn get(&self, key: &CacheKey) -> Option<LocalValue> {
        let now = Instant::now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.value));
            }
            drop(entry);
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set(&self, key: &CacheKey, value: LocalValue, policy: &Tier1Policy) {
        if let Some(max) = self.max_entries {
            let full = !self.entries.contains_key(key) && self.entries.len() >= max;
            if full && !self.make_room(max) {
                tracing::warn!(
                    key = %key,
                    max_entries = max,
                    "tier-1 at capacity with only non-evictable entries, skipping insertion"
                );
                return;
            }
        }

        let entry = LocalEntry::new(value, policy, Instant::now());
        self.entries.insert(key.clone(), entry);
        metrics::set_tier1_entries(self.entries.len());
    }

    fn remove(&self, key: &CacheKey) -> Result<(), StoreError> {
        if self.entries.remove(key).is_some() {
            metrics::set_tier1_entries(self.entries.len());
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Statistics for the in-memory tier.
#[derive(Debug, Clone, Default)]
pub struct MemoryTierStats {
    pub entries: usize,
    pub max_entries: Option<usize>,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to make room, including expired ones swept for it.
    pub evictions: u64,
}

impl MemoryTierStats {
    /// Hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiercache_core::KeyCodec;

    fn key(k: &str) -> CacheKey {
        KeyCodec::default().encode(k).unwrap()
    }

    fn value(v: &str) -> LocalValue {
        Arc::new(v.to_string())
    }

    fn read(tier: &MemoryTier, k: &str) -> Option<String> {
        tier.get(&key(k))
            .and_then(|v| v.downcast_ref::<String>().cloned())
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_and_get() {
        let tier = MemoryTier::new();
        tier.set(&key("a"), value("1"), &Tier1Policy::absolute(Duration::from_secs(60)));

        assert_eq!(read(&tier, "a").as_deref(), Some("1"));
        assert_eq!(read(&tier, "missing"), None);

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_expiration() {
        let tier = MemoryTier::new();
        tier.set(&key("a"), value("1"), &Tier1Policy::absolute(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(read(&tier, "a").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(read(&tier, "a").is_none());
        assert!(tier.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_expiration_extended_by_reads() {
        let tier = MemoryTier::new();
        tier.set(&key("a"), value("1"), &Tier1Policy::sliding(Duration::from_secs(2)));

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(read(&tier, "a").is_some());
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(read(&tier, "a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_capped_by_absolute() {
        let tier = MemoryTier::new();
        let policy = Tier1Policy::new(tiercache_core::Expiration::sliding_within(
            Duration::from_secs(2),
            Duration::from_secs(3),
        ));
        tier.set(&key("a"), value("1"), &policy);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(read(&tier, "a").is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(read(&tier, "a").is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(read(&tier, "a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let tier = MemoryTier::new();
        tier.set(&key("short"), value("1"), &Tier1Policy::absolute(Duration::from_secs(1)));
        tier.set(&key("long"), value("2"), &Tier1Policy::absolute(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tier.cleanup_expired(), 1);
        assert_eq!(tier.len(), 1);
        assert!(read(&tier, "long").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_lowest_priority_first() {
        let tier = MemoryTier::with_capacity(2);
        let ttl = Duration::from_secs(60);
        tier.set(
            &key("low"),
            value("1"),
            &Tier1Policy::absolute(ttl).with_priority(Priority::Low),
        );
        tier.set(
            &key("high"),
            value("2"),
            &Tier1Policy::absolute(ttl).with_priority(Priority::High),
        );
        tier.set(&key("new"), value("3"), &Tier1Policy::absolute(ttl));

        assert!(read(&tier, "low").is_none());
        assert!(read(&tier, "high").is_some());
        assert!(read(&tier, "new").is_some());
        assert_eq!(tier.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used_within_priority() {
        let tier = MemoryTier::with_capacity(2);
        let policy = Tier1Policy::absolute(Duration::from_secs(60));
        tier.set(&key("a"), value("1"), &policy);
        tokio::time::advance(Duration::from_millis(10)).await;
        tier.set(&key("b"), value("2"), &policy);
        tokio::time::advance(Duration::from_millis(10)).await;
        // Touch "a" so "b" is the least recently used
        assert!(read(&tier, "a").is_some());

        tier.set(&key("c"), value("3"), &policy);
        assert!(read(&tier, "a").is_some());
        assert!(read(&tier, "b").is_none());
        assert!(read(&tier, "c").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_prefers_expired_entries() {
        let tier = MemoryTier::with_capacity(2);
        tier.set(
            &key("stale"),
            value("1"),
            &Tier1Policy::absolute(Duration::from_secs(1)).with_priority(Priority::High),
        );
        tier.set(
            &key("low"),
            value("2"),
            &Tier1Policy::absolute(Duration::from_secs(60)).with_priority(Priority::Low),
        );
        tokio::time::advance(Duration::from_secs(2)).await;

        tier.set(&key("new"), value("3"), &Tier1Policy::absolute(Duration::from_secs(60)));
        assert!(read(&tier, "low").is_some());
        assert!(read(&tier, "new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_remove_entries_survive_capacity_pressure() {
        let tier = MemoryTier::with_capacity(1);
        let ttl = Duration::from_secs(60);
        tier.set(
            &key("pinned"),
            value("1"),
            &Tier1Policy::absolute(ttl).with_priority(Priority::NeverRemove),
        );
        tier.set(&key("other"), value("2"), &Tier1Policy::absolute(ttl));

        assert!(read(&tier, "pinned").is_some());
        assert!(read(&tier, "other").is_none());
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let tier = MemoryTier::with_capacity(1);
        let policy = Tier1Policy::absolute(Duration::from_secs(60));
        tier.set(&key("a"), value("1"), &policy);
        tier.set(&key("a"), value("2"), &policy);

        assert_eq!(read(&tier, "a").as_deref(), Some("2"));
        assert_eq!(tier.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_clear() {
        let tier = MemoryTier::new();
        let policy = Tier1Policy::absolute(Duration::from_secs(60));
        tier.set(&key("a"), value("1"), &policy);
        tier.set(&key("b"), value("2"), &policy);

        tier.remove(&key("a")).unwrap();
        tier.remove(&key("a")).unwrap();
        assert!(read(&tier, "a").is_none());

        tier.clear();
        assert!(tier.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_sweeps_and_stops_with_tier() {
        let tier = Arc::new(MemoryTier::new());
        tier.set(&key("a"), value("1"), &Tier1Policy::absolute(Duration::from_secs(1)));
        let handle = tier.spawn_cleanup_task(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(tier.len(), 0);

        drop(tier);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
    }

    #[test]
    fn test_hit_rate() {
        let stats = MemoryTierStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 75.0).abs() < 0.001);
        assert_eq!(MemoryTierStats::default().hit_rate(), 0.0);
    }
}
