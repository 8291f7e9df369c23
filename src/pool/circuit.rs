//! Circuit breaker guarding one pool's backend
//!
//! Three observable states:
//! - Closed: normal operation, acquires are allowed
//! - Open: the backend is failing, acquires are rejected without waiting
//! - HalfOpen: cooldown has elapsed, a bounded number of trial calls probe
//!   whether the backend recovered
//!
//! Only Closed and Open are stored; HalfOpen is derived from how long the
//! circuit has been open, so no background timer is needed; the transition
//! happens lazily on the next availability check.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::BreakerSettings;

/// Observable circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - acquires are allowed
    Closed,

    /// Backend is failing - acquires are rejected
    Open,

    /// Testing recovery - limited trial calls allowed
    HalfOpen,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// Persisted state; HalfOpen is never stored
#[derive(Debug, Clone, Copy)]
enum Persisted {
    Closed,
    Open { opened_at: Instant },
}

struct BreakerInner {
    state: Persisted,

    /// Failure timestamps within the sliding window
    recent_failures: Vec<Instant>,

    /// Trial calls admitted since the cooldown elapsed
    half_open_probes: u32,

    /// Last state transition time
    last_transition: Instant,

    total_successes: u64,
    total_failures: u64,

    /// Number of times the circuit has opened
    open_count: u64,
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub total_successes: u64,
    pub total_failures: u64,
    pub open_count: u64,
    pub time_in_state: Duration,
}

/// Per-service failure gate. One instance guards one pool's backend.
pub struct CircuitBreaker {
    service: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            service: service.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: Persisted::Closed,
                recent_failures: Vec::new(),
                half_open_probes: 0,
                last_transition: Instant::now(),
                total_successes: 0,
                total_failures: 0,
                open_count: 0,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Whether a new connection attempt is allowed right now.
    ///
    /// Closed always admits. Open rejects until the cooldown has elapsed;
    /// after that the circuit is half-open and admits up to
    /// `half_open_max_probes` trial calls until one of them reports a result.
    pub fn is_available(&self) -> bool {
        if !self.settings.enabled {
            return true;
        }

        let mut inner = self.lock();
        match inner.state {
            Persisted::Closed => true,
            Persisted::Open { opened_at } => {
                if opened_at.elapsed() < self.settings.cooldown() {
                    return false;
                }
                if inner.half_open_probes >= self.settings.half_open_max_probes {
                    debug!(service = %self.service, "half-open probe limit reached");
                    return false;
                }
                inner.half_open_probes += 1;
                true
            }
        }
    }

    /// Record a successful call. Closes the circuit when half-open; clears
    /// the failure window when already closed.
    pub fn record_success(&self) {
        if !self.settings.enabled {
            return;
        }

        let mut inner = self.lock();
        inner.total_successes += 1;

        match inner.state {
            Persisted::Closed => {
                inner.recent_failures.clear();
            }
            Persisted::Open { opened_at } => {
                if opened_at.elapsed() >= self.settings.cooldown() {
                    info!(service = %self.service, "probe succeeded, circuit closed");
                    Self::transition(&mut inner, Persisted::Closed);
                } else {
                    // A straggler from before the circuit opened; ignore it
                    debug!(service = %self.service, "success recorded while open");
                }
            }
        }
    }

    /// Record a failed call. Opens the circuit when the windowed failure
    /// count reaches the threshold, or immediately when a half-open trial
    /// fails.
    pub fn record_failure(&self) {
        if !self.settings.enabled {
            return;
        }

        let now = Instant::now();
        let mut inner = self.lock();
        inner.total_failures += 1;

        match inner.state {
            Persisted::Closed => {
                inner.recent_failures.push(now);
                let window = self.settings.failure_window();
                inner
                    .recent_failures
                    .retain(|t| now.duration_since(*t) < window);

                if inner.recent_failures.len() >= self.settings.failure_threshold as usize {
                    warn!(
                        service = %self.service,
                        failures = inner.recent_failures.len(),
                        window_secs = self.settings.failure_window_secs,
                        "failure threshold reached, circuit opened"
                    );
                    inner.open_count += 1;
                    Self::transition(&mut inner, Persisted::Open { opened_at: now });
                }
            }
            Persisted::Open { opened_at } => {
                if opened_at.elapsed() >= self.settings.cooldown() {
                    // A half-open trial failed: back to open with a fresh cooldown
                    warn!(service = %self.service, "probe failed, circuit reopened");
                    inner.open_count += 1;
                    Self::transition(&mut inner, Persisted::Open { opened_at: now });
                } else {
                    debug!(service = %self.service, "failure recorded while open");
                }
            }
        }
    }

    /// Current observable state (HalfOpen is derived, never stored)
    pub fn state(&self) -> CircuitState {
        if !self.settings.enabled {
            return CircuitState::Closed;
        }

        let inner = self.lock();
        match inner.state {
            Persisted::Closed => CircuitState::Closed,
            Persisted::Open { opened_at } => {
                if opened_at.elapsed() >= self.settings.cooldown() {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
        }
    }

    /// Manually force the circuit closed, e.g. from an operator endpoint
    pub fn reset(&self) {
        let mut inner = self.lock();
        info!(service = %self.service, "circuit manually reset to closed");
        Self::transition(&mut inner, Persisted::Closed);
    }

    pub fn stats(&self) -> CircuitStats {
        let state = self.state();
        let inner = self.lock();
        CircuitStats {
            state,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            open_count: inner.open_count,
            time_in_state: inner.last_transition.elapsed(),
        }
    }

    fn transition(inner: &mut BreakerInner, state: Persisted) {
        inner.state = state;
        inner.recent_failures.clear();
        inner.half_open_probes = 0;
        inner.last_transition = Instant::now();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
