//! Per-dependency circuit breaker and process-wide registry (§4.5).
//!
//! One breaker per named dependency (`model-client`, `knowledge-store`,
//! ...). Thread-safe; shared across stages and supervised runs through
//! [`CircuitRegistry`] so a single breaker is consulted process-wide
//! for a given dependency name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The three states a circuit can be in (§3 `CircuitState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// Tuning parameters for one circuit.
#[derive(Debug, Clone, Copy)]
pub struct CircuitParams {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_probe_count: u32,
}

impl Default for CircuitParams {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_probe_count: 1,
        }
    }
}

struct Inner {
    state: CircuitStateKind,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// Set once a half-open probe has been handed out, so only one probe
    /// is in flight at a time per §4.5.
    probe_in_flight: bool,
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    params: CircuitParams,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

/// Outcome of a pre-flight `allow` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may proceed; this state is not counted as a probe.
    Allowed,
    /// The call may proceed and is this half-open window's probe.
    AllowedAsProbe,
    /// The circuit is open; reject immediately (no attempt counted).
    Rejected,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, params: CircuitParams) -> Self {
        Self {
            name: name.into(),
            params,
            inner: Mutex::new(Inner {
                state: CircuitStateKind::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> CircuitStateKind {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .state
    }

    /// Pre-flight check (§4.3 step 1, §4.5 transitions).
    ///
    /// `open -> half-open` happens here, lazily, once `cooldown` has
    /// elapsed since opening; exactly one probe is admitted per
    /// half-open window (§8 invariant 5).
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match inner.state {
            CircuitStateKind::Closed => Admission::Allowed,
            CircuitStateKind::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::AllowedAsProbe
                }
            }
            CircuitStateKind::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.params.cooldown)
                    .unwrap_or(false);
                if elapsed {
                    inner.state = CircuitStateKind::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.probe_in_flight = true;
                    tracing::debug!(circuit = %self.name, "circuit half-opened");
                    Admission::AllowedAsProbe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Release a probe slot admitted by [`admit`](Self::admit) without
    /// having actually made the call — used when a sibling dependency's
    /// pre-flight check rejects the stage before this probe is spent, so
    /// the half-open window isn't consumed for a call that never
    /// happened (§4.3 step 1).
    pub fn cancel_probe(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.probe_in_flight = false;
    }

    /// Record a successful call (§4.3 step 3, §4.5).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitStateKind::Closed => {}
            CircuitStateKind::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.params.half_open_probe_count {
                    inner.state = CircuitStateKind::Closed;
                    inner.consecutive_successes = 0;
                    tracing::debug!(circuit = %self.name, "circuit closed");
                }
            }
            CircuitStateKind::Open => {
                // A stray success after cooldown race; treat conservatively.
                inner.probe_in_flight = false;
            }
        }
    }

    /// Record a failed call (§4.3 step 4, §4.5).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.consecutive_successes = 0;
        match inner.state {
            CircuitStateKind::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.params.failure_threshold {
                    inner.state = CircuitStateKind::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::debug!(circuit = %self.name, "circuit opened");
                }
            }
            CircuitStateKind::HalfOpen => {
                inner.probe_in_flight = false;
                inner.state = CircuitStateKind::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = self.params.failure_threshold.max(1);
                tracing::debug!(circuit = %self.name, "circuit re-opened after failed probe");
            }
            CircuitStateKind::Open => {
                inner.probe_in_flight = false;
            }
        }
    }
}

/// Process-wide registry of circuit breakers, one per dependency name
/// (§3 ownership, §4.5).
#[derive(Clone, Default)]
pub struct CircuitRegistry {
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl std::fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let breakers = self.breakers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("CircuitRegistry")
            .field("dependencies", &breakers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CircuitRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the breaker for `name`, using `params` only on
    /// first creation.
    pub fn get_or_create(&self, name: &str, params: CircuitParams) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, params)))
            .clone()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(threshold: u32, cooldown_ms: u64, probes: u32) -> CircuitParams {
        CircuitParams {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
            half_open_probe_count: probes,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("model-client", params(3, 1_000, 1));
        for _ in 0..3 {
            assert_eq!(breaker.admit(), Admission::Allowed);
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitStateKind::Open);
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[test]
    fn half_opens_after_cooldown_and_admits_one_probe() {
        let breaker = CircuitBreaker::new("model-client", params(1, 10, 1));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitStateKind::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.admit(), Admission::AllowedAsProbe);
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[test]
    fn closes_after_enough_successful_probes() {
        let breaker = CircuitBreaker::new("model-client", params(1, 1, 2));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.admit(), Admission::AllowedAsProbe);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitStateKind::HalfOpen);
        assert_eq!(breaker.admit(), Admission::AllowedAsProbe);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitStateKind::Closed);
    }

    #[test]
    fn failed_probe_reopens_circuit() {
        let breaker = CircuitBreaker::new("model-client", params(1, 1, 1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.admit(), Admission::AllowedAsProbe);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitStateKind::Open);
    }

    #[test]
    fn cancel_probe_frees_the_slot_for_a_later_admit() {
        let breaker = CircuitBreaker::new("model-client", params(1, 1, 1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.admit(), Admission::AllowedAsProbe);
        assert_eq!(breaker.admit(), Admission::Rejected);
        breaker.cancel_probe();
        assert_eq!(breaker.admit(), Admission::AllowedAsProbe);
    }

    #[test]
    fn registry_shares_one_breaker_per_name() {
        let registry = CircuitRegistry::new();
        let a = registry.get_or_create("knowledge-store", CircuitParams::default());
        let b = registry.get_or_create("knowledge-store", CircuitParams::default());
        a.record_failure();
        assert_eq!(b.state(), CircuitStateKind::Closed);
        assert_eq!(a.state(), CircuitStateKind::Closed);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
