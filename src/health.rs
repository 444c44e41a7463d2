//! Stage health monitoring (§3 `HealthSample`, §4.3 heartbeat watcher).
//!
//! The supervisor starts a [`HeartbeatWatcher`] per attempt; it races the
//! stage's future against a timer and reports a [`HealthSample`] either
//! way. [`HealthMonitor`] aggregates consecutive samples per stage into
//! a coarser [`HealthStatus`] and emits `health_*` events on transitions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::events::{Event, EventBus, EventType};

/// Coarse health classification for a stage (§3 `HealthSample`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

/// One heartbeat observation.
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub reason: Option<String>,
}

/// Races a stage invocation against a timeout, cooperating with
/// cancellation (§4.3, §5).
///
/// `Ok(output)` if the stage finished first; `Err(TimedOut)` if the
/// timer fired first (the caller is responsible for cancelling the
/// stage's future in that case).
pub struct HeartbeatWatcher {
    timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl HeartbeatWatcher {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Race `future` against the configured timeout.
    pub async fn watch<F, T>(&self, future: F) -> Result<T, TimedOut>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.timeout, future)
            .await
            .map_err(|_| TimedOut)
    }
}

/// Aggregates per-stage heartbeat samples into a health status and
/// fires `health_*` events on transitions (§4.6 taxonomy).
pub struct HealthMonitor {
    event_bus: std::sync::Arc<EventBus>,
    /// Consecutive-failure counters per stage, used to escalate
    /// Degraded -> Unhealthy -> Critical.
    streaks: Mutex<HashMap<String, (u32, HealthStatus)>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(event_bus: std::sync::Arc<EventBus>) -> Self {
        Self {
            event_bus,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful attempt for `stage`: resets the streak and
    /// emits `health_recovered` if the stage was previously unwell.
    pub fn record_success(&self, stage: &str) {
        let mut streaks = self.streaks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((_, previous)) = streaks.remove(stage) {
            if previous != HealthStatus::Healthy {
                self.event_bus.publish(
                    &Event::new(EventType::HealthRecovered)
                        .with_stage(stage)
                        .with_payload("previous_status", format!("{previous:?}")),
                );
            }
        }
    }

    /// Record a failed/timed-out attempt for `stage`, escalating the
    /// health status and emitting the matching `health_*` event.
    pub fn record_failure(&self, stage: &str, reason: &str) {
        let mut streaks = self.streaks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = streaks.entry(stage.to_string()).or_insert((0, HealthStatus::Healthy));
        entry.0 += 1;
        let status = match entry.0 {
            1 => HealthStatus::Degraded,
            2 => HealthStatus::Unhealthy,
            _ => HealthStatus::Critical,
        };
        entry.1 = status;
        drop(streaks);

        let event_type = match status {
            HealthStatus::Degraded => EventType::HealthDegraded,
            HealthStatus::Unhealthy => EventType::HealthUnhealthy,
            HealthStatus::Critical => EventType::HealthCritical,
            HealthStatus::Healthy => return,
        };
        self.event_bus.publish(
            &Event::new(event_type)
                .with_stage(stage)
                .with_payload("reason", reason),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn watcher_returns_output_when_future_finishes_first() {
        let watcher = HeartbeatWatcher::new(Duration::from_millis(200));
        let result = watcher.watch(async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn watcher_times_out_when_future_is_slow() {
        let watcher = HeartbeatWatcher::new(Duration::from_millis(10));
        let result = watcher
            .watch(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                42
            })
            .await;
        assert_eq!(result, Err(TimedOut));
    }

    #[test]
    fn escalates_then_recovers() {
        let bus = Arc::new(EventBus::default());
        let monitor = HealthMonitor::new(bus);
        monitor.record_failure("dev", "timeout");
        monitor.record_failure("dev", "timeout");
        monitor.record_failure("dev", "timeout");
        {
            let streaks = monitor.streaks.lock().unwrap();
            assert_eq!(streaks.get("dev").unwrap().1, HealthStatus::Critical);
        }
        monitor.record_success("dev");
        assert!(!monitor.streaks.lock().unwrap().contains_key("dev"));
    }
}
