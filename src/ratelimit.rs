//! Optional shared token-bucket rate limiter (§5, §6 `ratelimit.*`).
//!
//! Used by the supervisor, when configured, to throttle calls to a
//! shared external resource (e.g. a model API) across concurrent runs.
//! Waiting for a token is a cancellation-aware suspension point.

use std::sync::Mutex;
use std::time::Instant;

use crate::error::{ArtemisError, ArtemisResult};
use crate::stage::CancellationToken;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A shared token bucket. Cheap to clone — internally `Arc`-backed.
#[derive(Clone)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: std::sync::Arc<Mutex<Bucket>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            bucket: std::sync::Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Acquire one token, waiting (in short polling increments) until one
    /// is available or `cancel` trips.
    ///
    /// # Errors
    ///
    /// Returns [`ArtemisError::Cancelled`] if cancellation is observed
    /// while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> ArtemisResult<()> {
        loop {
            {
                let mut bucket = self.bucket.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
            }
            if cancel.is_cancelled() {
                return Err(ArtemisError::cancelled());
            }
            tokio::select! {
                () = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
                () = cancel.cancelled() => return Err(ArtemisError::cancelled()),
            }
        }
    }

    /// Non-blocking check: is at least one token available right now.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
