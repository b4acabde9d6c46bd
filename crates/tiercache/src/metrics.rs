//! Metrics emitted by the tiered cache.
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op. Exporting is left to the embedding
//! application.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const HITS_TOTAL: &str = "tiercache_hits_total";
    pub const MISSES_TOTAL: &str = "tiercache_misses_total";
    pub const FACTORY_INVOCATIONS_TOTAL: &str = "tiercache_factory_invocations_total";
    pub const FACTORY_FAILURES_TOTAL: &str = "tiercache_factory_failures_total";
    pub const TIER2_FAILURES_TOTAL: &str = "tiercache_tier2_failures_total";
    pub const TIER2_SKIPPED_TOTAL: &str = "tiercache_tier2_skipped_total";
    pub const TIER2_DEGRADED: &str = "tiercache_tier2_degraded";
    pub const TIER1_ENTRIES: &str = "tiercache_tier1_entries";
}

/// Record a cache hit on the given tier (`"L1"` or `"L2"`).
pub fn record_hit(tier: &str) {
    counter!(names::HITS_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a miss on both tiers.
pub fn record_miss() {
    counter!(names::MISSES_TOTAL).increment(1);
}

pub fn record_factory_invocation() {
    counter!(names::FACTORY_INVOCATIONS_TOTAL).increment(1);
}

pub fn record_factory_failure() {
    counter!(names::FACTORY_FAILURES_TOTAL).increment(1);
}

/// Record a failed Tier-2 call (error or timeout).
pub fn record_tier2_failure(op: &'static str) {
    counter!(names::TIER2_FAILURES_TOTAL, "op" => op).increment(1);
}

/// Record a Tier-2 call skipped while degraded.
pub fn record_tier2_skipped(op: &'static str) {
    counter!(names::TIER2_SKIPPED_TOTAL, "op" => op).increment(1);
}

pub fn set_tier2_degraded(backend: &'static str, degraded: bool) {
    gauge!(names::TIER2_DEGRADED, "backend" => backend).set(if degraded { 1.0 } else { 0.0 });
}

pub fn set_tier1_entries(count: usize) {
    gauge!(names::TIER1_ENTRIES).set(count as f64);
}
