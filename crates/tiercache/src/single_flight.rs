//! Per-key deduplication of factory executions.
//!
//! ## How It Works
//!
//! The registry maps each key with an unresolved flight to a one-shot,
//! multi-waiter cell (a `watch` channel that is written exactly once).
//!
//! ```text
//! caller A: acquire("k") → Owner    ── runs factory ── release(result) ─┐
//! caller B: acquire("k") → Follower ── wait() ─────────────────────────┤→ same result
//! caller C: acquire("k") → Follower ── wait() ─────────────────────────┘
//! caller D: acquire("k") → Owner    (entry was removed on release: fresh flight)
//! ```
//!
//! The check-and-create runs under the map's entry lock, so two callers can
//! never both become owner of the same key. An owner ticket that is dropped
//! without being released (cancelled future, panic, early return) resolves
//! the flight with `CacheError::Cancelled`, so followers never hang.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tiercache_core::{CacheError, CacheKey, LocalValue};
use tokio::sync::watch;

/// Result delivered to every waiter of a flight.
pub type FlightOutcome = Result<LocalValue, CacheError>;

type Slot = watch::Sender<Option<FlightOutcome>>;

/// Registry of in-flight factory executions, one per key.
#[derive(Default)]
pub struct SingleFlightRegistry {
    flights: DashMap<CacheKey, Arc<Slot>>,
}

/// Handle returned by [`SingleFlightRegistry::acquire`].
pub enum Ticket<'a> {
    /// This caller must run the factory and release the ticket.
    Owner(OwnerTicket<'a>),
    /// Another caller is already running the factory.
    Follower(FollowerTicket),
}

impl SingleFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, creating it if none is in progress.
    pub fn acquire(&self, key: &CacheKey) -> Ticket<'_> {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(key = %key, "joining in-flight factory");
                Ticket::Follower(FollowerTicket {
                    rx: entry.get().subscribe(),
                })
            }
            Entry::Vacant(entry) => {
                let (tx, _) = watch::channel(None);
                let slot = Arc::new(tx);
                entry.insert(Arc::clone(&slot));
                Ticket::Owner(OwnerTicket {
                    registry: self,
                    key: key.clone(),
                    slot,
                    released: false,
                })
            }
        }
    }

    /// Number of unresolved flights.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    fn finish(&self, key: &CacheKey, slot: &Arc<Slot>, outcome: FlightOutcome) {
        // Unregister before publishing: anyone arriving after this starts a new flight.
        self.flights
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot));
        slot.send_replace(Some(outcome));
    }
}

/// Exclusive right to run the factory for one key.
pub struct OwnerTicket<'a> {
    registry: &'a SingleFlightRegistry,
    key: CacheKey,
    slot: Arc<Slot>,
    released: bool,
}

impl OwnerTicket<'_> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Deliver the outcome to every follower and close the flight.
    pub fn release(mut self, outcome: FlightOutcome) {
        self.released = true;
        self.registry.finish(&self.key, &self.slot, outcome);
    }
}

impl Drop for OwnerTicket<'_> {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(key = %self.key, "flight owner abandoned, cancelling followers");
            self.registry
                .finish(&self.key, &self.slot, Err(CacheError::Cancelled));
        }
    }
}

/// Read-only handle on another caller's flight.
pub struct FollowerTicket {
    rx: watch::Receiver<Option<FlightOutcome>>,
}

impl FollowerTicket {
    /// Wait for the owner's outcome.
    pub async fn wait(mut self) -> FlightOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(CacheError::Cancelled)),
            // Sender gone without a value; cannot happen while `OwnerTicket::drop` resolves.
            Err(_) => Err(CacheError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tiercache_core::KeyCodec;

    fn key(k: &str) -> CacheKey {
        KeyCodec::default().encode(k).unwrap()
    }

    fn owner<'a>(ticket: Ticket<'a>) -> OwnerTicket<'a> {
        match ticket {
            Ticket::Owner(t) => t,
            Ticket::Follower(_) => panic!("expected owner ticket"),
        }
    }

    fn follower(ticket: Ticket<'_>) -> FollowerTicket {
        match ticket {
            Ticket::Follower(t) => t,
            Ticket::Owner(_) => panic!("expected follower ticket"),
        }
    }

    #[tokio::test]
    async fn test_first_caller_owns_the_flight() {
        let registry = SingleFlightRegistry::new();
        let k = key("a");

        let owner = owner(registry.acquire(&k));
        let follower = follower(registry.acquire(&k));
        assert_eq!(registry.in_flight(), 1);

        let value: LocalValue = Arc::new(42u32);
        owner.release(Ok(Arc::clone(&value)));

        let got = follower.wait().await.unwrap();
        assert!(Arc::ptr_eq(&got, &value));
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_release_starts_fresh_flight() {
        let registry = SingleFlightRegistry::new();
        let k = key("b");

        owner(registry.acquire(&k)).release(Ok(Arc::new(1u8)));
        // The next caller after release becomes a new owner.
        let second = owner(registry.acquire(&k));
        second.release(Ok(Arc::new(2u8)));
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let registry = SingleFlightRegistry::new();
        let _a = owner(registry.acquire(&key("x")));
        let _b = owner(registry.acquire(&key("y")));
        assert_eq!(registry.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_shared() {
        let registry = SingleFlightRegistry::new();
        let k = key("c");

        let owner = owner(registry.acquire(&k));
        let f1 = follower(registry.acquire(&k));
        let f2 = follower(registry.acquire(&k));

        owner.release(Err(CacheError::factory("backend said no")));

        for f in [f1, f2] {
            let err = f.wait().await.unwrap_err();
            assert!(err.is_factory());
            assert_eq!(err.to_string(), "Factory failed: backend said no");
        }
    }

    #[tokio::test]
    async fn test_dropped_owner_cancels_followers() {
        let registry = SingleFlightRegistry::new();
        let k = key("d");

        let owner = owner(registry.acquire(&k));
        let follower = follower(registry.acquire(&k));
        drop(owner);

        assert!(follower.wait().await.unwrap_err().is_cancelled());
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_follower_joining_late_sees_result() {
        let registry = Arc::new(SingleFlightRegistry::new());
        let k = key("e");
        let resolved = Arc::new(AtomicUsize::new(0));

        let owner = owner(registry.acquire(&k));
        let mut waiters = Vec::new();
        for _ in 0..16 {
            let f = follower(registry.acquire(&k));
            let resolved = Arc::clone(&resolved);
            waiters.push(tokio::spawn(async move {
                let v = f.wait().await.unwrap();
                assert_eq!(v.downcast_ref::<String>().map(String::as_str), Some("done"));
                resolved.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::task::yield_now().await;
        owner.release(Ok(Arc::new("done".to_string())));

        for w in waiters {
            w.await.unwrap();
        }
        assert_eq!(resolved.load(Ordering::SeqCst), 16);
    }
}
