//! Retry backoff policy (§4.3, §6, §8).
//!
//! Provides the exponential-backoff-with-jitter delay calculation shared
//! by the [`crate::supervisor::Supervisor`]'s attempt loop. The policy
//! itself carries no behavior beyond computing delays — the supervisor
//! owns the attempt loop, since retrying is inseparable from circuit
//! bookkeeping and timeout handling in this design (§4.3).

use rand::RngExt;
use serde::{Deserialize, Serialize};

/// Backoff configuration for retry delays between stage attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay in milliseconds before the first retry.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_factor: f64,
    /// Maximum delay in milliseconds (cap).
    pub max_delay_ms: u64,
    /// Uniform jitter fraction applied to each delay, in `[0.0, 1.0]`.
    ///
    /// The realized delay is drawn uniformly from
    /// `[delay * (1 - jitter_fraction), delay * (1 + jitter_fraction)]`.
    /// A fraction of `0.0` disables jitter entirely.
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter_fraction: 0.5,
        }
    }
}

/// A retry policy: an attempt budget plus a backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the initial attempt.
    /// `retry_budget + 1` per §6's `retry.max_attempts`.
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Build a policy from a retry budget (number of retries *after* the
    /// first attempt) and a backoff configuration. `retry_budget = 0`
    /// yields `max_attempts = 1` (§8 boundary behavior).
    #[must_use]
    pub fn from_budget(retry_budget: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_attempts: retry_budget.saturating_add(1),
            backoff,
        }
    }
}

/// Calculate the delay for a given retry attempt.
///
/// Formula: `initial_delay_ms * backoff_factor^(attempt - 1)`, capped at
/// `max_delay_ms`, with uniform jitter applied per [`BackoffConfig::jitter_fraction`].
///
/// `attempt` is 1-based: the delay *before* retry attempt 1 (the second
/// overall attempt) uses `attempt = 1`. Delays computed this way are
/// monotonically non-decreasing in the un-jittered base value across
/// successive attempts, per §8 invariant 6.
#[must_use]
pub fn delay_for_attempt(attempt: u32, config: &BackoffConfig) -> std::time::Duration {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    let base = (config.initial_delay_ms as f64)
        * config
            .backoff_factor
            .powi(i32::saturating_sub(attempt as i32, 1));
    #[allow(clippy::cast_precision_loss)]
    let capped = base.min(config.max_delay_ms as f64);

    let jitter = config.jitter_fraction.clamp(0.0, 1.0);
    let final_ms = if jitter > 0.0 {
        let low = 1.0 - jitter;
        let high = 1.0 + jitter;
        capped * rand::rng().random_range(low..high)
    } else {
        capped
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    std::time::Duration::from_millis(final_ms.max(0.0) as u64)
}
