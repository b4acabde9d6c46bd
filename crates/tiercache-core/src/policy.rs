//! Per-tier expiration and eviction directives.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Expiration directive shared by both tiers.
///
/// At least one of the two durations is always set: the constructors are the
/// only way to build a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiration {
    absolute: Option<Duration>,
    sliding: Option<Duration>,
}

impl Expiration {
    /// Expire a fixed duration after the write.
    pub const fn absolute(ttl: Duration) -> Self {
        Self {
            absolute: Some(ttl),
            sliding: None,
        }
    }

    /// Expire once the entry has not been read for `idle`.
    pub const fn sliding(idle: Duration) -> Self {
        Self {
            absolute: None,
            sliding: Some(idle),
        }
    }

    /// Sliding expiration capped by an absolute lifetime.
    pub const fn sliding_within(idle: Duration, ttl: Duration) -> Self {
        Self {
            absolute: Some(ttl),
            sliding: Some(idle),
        }
    }

    /// Absolute lifetime after the write, if any.
    pub fn absolute_ttl(&self) -> Option<Duration> {
        self.absolute
    }

    /// Idle window, if any.
    pub fn sliding_ttl(&self) -> Option<Duration> {
        self.sliding
    }

    /// Time-to-live to apply at write time: the shorter of the two windows.
    pub fn initial_ttl(&self) -> Duration {
        match (self.absolute, self.sliding) {
            (Some(a), Some(s)) => a.min(s),
            (Some(a), None) => a,
            (None, Some(s)) => s,
            (None, None) => Duration::ZERO,
        }
    }
}

/// Eviction priority hint for the local tier when it runs out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    /// Never evicted for capacity; still expires.
    NeverRemove,
}

/// Tier-1 directive: expiration plus an eviction priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier1Policy {
    pub expiration: Expiration,
    pub priority: Priority,
}

impl Tier1Policy {
    pub const fn new(expiration: Expiration) -> Self {
        Self {
            expiration,
            priority: Priority::Normal,
        }
    }

    pub fn absolute(ttl: Duration) -> Self {
        Self::new(Expiration::absolute(ttl))
    }

    pub fn sliding(idle: Duration) -> Self {
        Self::new(Expiration::sliding(idle))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Tier-2 directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier2Policy {
    pub expiration: Expiration,
}

impl Tier2Policy {
    pub const fn new(expiration: Expiration) -> Self {
        Self { expiration }
    }

    pub fn absolute(ttl: Duration) -> Self {
        Self::new(Expiration::absolute(ttl))
    }

    pub fn sliding(idle: Duration) -> Self {
        Self::new(Expiration::sliding(idle))
    }
}

/// Options passed with every write: one independent policy per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOptions {
    pub tier1: Tier1Policy,
    pub tier2: Tier2Policy,
}

impl EntryOptions {
    pub const fn new(tier1: Tier1Policy, tier2: Tier2Policy) -> Self {
        Self { tier1, tier2 }
    }

    /// Absolute TTLs for both tiers.
    pub fn with_ttls(tier1: Duration, tier2: Duration) -> Self {
        Self::new(Tier1Policy::absolute(tier1), Tier2Policy::absolute(tier2))
    }
}
