//! Circuit breaker in front of the shared tier.
//!
//! Every Tier-2 call goes through [`ResilienceGuard::call`], which bounds it
//! with a timeout, counts the outcome, and converts any failure into a
//! `StoreError` the orchestrator treats as "Tier-2 unavailable".
//!
//! ## States
//!
//! ```text
//!        more than N consecutive failures
//!  Healthy ─────────────────────────► Degraded ──┐
//!     ▲                                  │       │ probe fails:
//!     │   cooldown elapsed, probe ok     │       │ restart cooldown
//!     └──────────────────────────────────┘◄──────┘
//! ```
//!
//! While Degraded, calls are skipped without touching the backend. Once the
//! cooldown has elapsed the next call is let through as a probe; other calls
//! keep being skipped until the probe finishes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tiercache_core::StoreError;
use tokio::time::Instant;

use crate::metrics;

/// Health of the shared tier as seen by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthMode {
    Healthy,
    Degraded,
}

impl HealthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
        }
    }
}

/// Thresholds for the guard.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Consecutive failures tolerated; one more switches the guard to Degraded.
    pub failure_threshold: u32,
    /// Maximum gap between two failures for them to count as consecutive.
    pub failure_window: Duration,
    /// How long to skip calls before probing the backend again.
    pub cooldown: Duration,
    /// Upper bound on a single backend call.
    pub operation_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(30),
            cooldown: Duration::from_secs(30),
            operation_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
struct ResilienceState {
    mode: HealthMode,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    degraded_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Point-in-time view of the guard, for stats and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResilienceSnapshot {
    pub mode: HealthMode,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub skipped_calls: u64,
}

enum Admission {
    Pass,
    Probe,
    Skip,
}

/// Tracks the health of one backend and short-circuits calls to it.
pub struct ResilienceGuard {
    backend: &'static str,
    config: ResilienceConfig,
    state: Mutex<ResilienceState>,
    total_failures: AtomicU64,
    skipped_calls: AtomicU64,
}

impl ResilienceGuard {
    pub fn new(backend: &'static str, config: ResilienceConfig) -> Self {
        metrics::set_tier2_degraded(backend, false);
        Self {
            backend,
            config,
            state: Mutex::new(ResilienceState {
                mode: HealthMode::Healthy,
                consecutive_failures: 0,
                last_failure: None,
                degraded_at: None,
                probe_in_flight: false,
            }),
            total_failures: AtomicU64::new(0),
            skipped_calls: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> HealthMode {
        self.state.lock().mode
    }

    pub fn snapshot(&self) -> ResilienceSnapshot {
        let state = self.state.lock();
        ResilienceSnapshot {
            mode: state.mode,
            consecutive_failures: state.consecutive_failures,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            skipped_calls: self.skipped_calls.load(Ordering::Relaxed),
        }
    }

    /// Run one backend call through the guard.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` without running `f` while Degraded,
    /// `StoreError::Timeout` if the call exceeds the operation timeout, or the
    /// backend's own error.
    pub async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let probe = match self.admit() {
            Admission::Skip => {
                self.skipped_calls.fetch_add(1, Ordering::Relaxed);
                metrics::record_tier2_skipped(op);
                tracing::trace!(backend = self.backend, op, "tier-2 call skipped (degraded)");
                return Err(StoreError::Unavailable);
            }
            Admission::Probe => {
                tracing::info!(backend = self.backend, op, "probing degraded tier-2 backend");
                Some(ProbeReset { guard: self })
            }
            Admission::Pass => None,
        };

        let timeout = self.config.operation_timeout;
        let result = match tokio::time::timeout(timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };

        let is_probe = probe.is_some();
        if let Some(probe) = probe {
            probe.disarm();
        }

        match &result {
            Ok(_) => self.record_success(is_probe),
            Err(e) => self.record_failure(op, e, is_probe),
        }
        result
    }

    fn admit(&self) -> Admission {
        let mut state = self.state.lock();
        match state.mode {
            HealthMode::Healthy => Admission::Pass,
            HealthMode::Degraded => {
                if state.probe_in_flight {
                    return Admission::Skip;
                }
                let cooled_down = state
                    .degraded_at
                    .is_none_or(|at| at.elapsed() >= self.config.cooldown);
                if cooled_down {
                    state.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Skip
                }
            }
        }
    }

    fn record_success(&self, probe: bool) {
        let mut state = self.state.lock();
        match state.mode {
            HealthMode::Healthy => state.consecutive_failures = 0,
            HealthMode::Degraded if probe => {
                state.mode = HealthMode::Healthy;
                state.consecutive_failures = 0;
                state.last_failure = None;
                state.degraded_at = None;
                state.probe_in_flight = false;
                drop(state);
                metrics::set_tier2_degraded(self.backend, false);
                tracing::info!(backend = self.backend, "tier-2 backend recovered, leaving degraded mode");
            }
            // A call admitted before the switch to Degraded finished late.
            HealthMode::Degraded => {}
        }
    }

    fn record_failure(&self, op: &'static str, error: &StoreError, probe: bool) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        metrics::record_tier2_failure(op);
        tracing::warn!(backend = self.backend, op, error = %error, "tier-2 call failed");

        let now = Instant::now();
        let mut state = self.state.lock();

        if probe {
            state.probe_in_flight = false;
            state.degraded_at = Some(now);
            state.last_failure = Some(now);
            tracing::warn!(
                backend = self.backend,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "tier-2 probe failed, staying degraded"
            );
            return;
        }

        if state.mode == HealthMode::Degraded {
            state.last_failure = Some(now);
            return;
        }

        let within_window = state
            .last_failure
            .is_some_and(|last| now.duration_since(last) <= self.config.failure_window);
        state.consecutive_failures = if within_window {
            state.consecutive_failures.saturating_add(1)
        } else {
            1
        };
        state.last_failure = Some(now);

        if state.consecutive_failures > self.config.failure_threshold {
            state.mode = HealthMode::Degraded;
            state.degraded_at = Some(now);
            let failures = state.consecutive_failures;
            drop(state);
            metrics::set_tier2_degraded(self.backend, true);
            tracing::warn!(
                backend = self.backend,
                failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "tier-2 backend degraded, serving from tier-1 only"
            );
        }
    }
}

/// Restarts the cooldown if a probe is dropped before it completes.
struct ProbeReset<'a> {
    guard: &'a ResilienceGuard,
}

impl ProbeReset<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for ProbeReset<'_> {
    fn drop(&mut self) {
        let mut state = self.guard.state.lock();
        state.probe_in_flight = false;
        state.degraded_at = Some(Instant::now());
    }
}
