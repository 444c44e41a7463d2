//! Synchronous event bus (§4.6).
//!
//! Observers subscribe with a [`std::sync::Weak`] reference so attaching
//! never prolongs the substrate's lifetime (§3 ownership). `publish`
//! delivers to every live observer in subscription order and prunes dead
//! weak refs opportunistically; an observer that panics is caught and
//! logged so it never blocks delivery to the rest (§8 invariant 7).

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

/// The closed event taxonomy (§4.6). Extend only by amending this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    PipelineStarted,
    PipelinePaused,
    PipelineResumed,
    PipelineCompleted,
    PipelineFailed,
    PipelineCancelled,
    StageStarted,
    StageRetrying,
    StageCompleted,
    StageFailed,
    StageSkipped,
    ValidationStarted,
    ValidationPassed,
    ValidationFailed,
    ValidationMaxRetries,
    HealthDegraded,
    HealthUnhealthy,
    HealthCritical,
    HealthRecovered,
    CircuitOpened,
    CircuitHalfOpened,
    CircuitClosed,
}

impl EventType {
    /// The `snake_case` name used in logs and payload keys, matching §4.6.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline_started",
            Self::PipelinePaused => "pipeline_paused",
            Self::PipelineResumed => "pipeline_resumed",
            Self::PipelineCompleted => "pipeline_completed",
            Self::PipelineFailed => "pipeline_failed",
            Self::PipelineCancelled => "pipeline_cancelled",
            Self::StageStarted => "stage_started",
            Self::StageRetrying => "stage_retrying",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::StageSkipped => "stage_skipped",
            Self::ValidationStarted => "validation_started",
            Self::ValidationPassed => "validation_passed",
            Self::ValidationFailed => "validation_failed",
            Self::ValidationMaxRetries => "validation_max_retries",
            Self::HealthDegraded => "health_degraded",
            Self::HealthUnhealthy => "health_unhealthy",
            Self::HealthCritical => "health_critical",
            Self::HealthRecovered => "health_recovered",
            Self::CircuitOpened => "circuit_opened",
            Self::CircuitHalfOpened => "circuit_half_opened",
            Self::CircuitClosed => "circuit_closed",
        }
    }
}

/// A single fire-and-forget event (§3 `Event`).
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub card_id: Option<String>,
    pub stage: Option<String>,
    pub payload: IndexMap<String, Value>,
}

impl Event {
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            card_id: None,
            stage: None,
            payload: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_card_id(mut self, card_id: impl Into<String>) -> Self {
        self.card_id = Some(card_id.into());
        self
    }

    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Subscriber to the event bus. Notified synchronously; must be re-entrant
/// (`publish` holds no lock while invoking observers, per §5).
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Synchronous, weak-referenced observer broadcast (§4.6).
pub struct EventBus {
    observers: RwLock<Vec<Weak<dyn Observer>>>,
    drop_slow_observers: bool,
    failure_streaks: RwLock<IndexMap<usize, u32>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .observers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        f.debug_struct("EventBus")
            .field("observer_count", &count)
            .field("drop_slow_observers", &self.drop_slow_observers)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(false)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(drop_slow_observers: bool) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            drop_slow_observers,
            failure_streaks: RwLock::new(IndexMap::new()),
        }
    }

    /// Subscribe an observer. The bus stores only a weak reference —
    /// the caller must keep the `Arc` alive for as long as it wants
    /// events delivered.
    pub fn subscribe(&self, observer: &Arc<dyn Observer>) {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        observers.push(Arc::downgrade(observer));
    }

    /// Remove a previously subscribed observer by pointer identity.
    pub fn unsubscribe(&self, observer: &Arc<dyn Observer>) {
        let target = Arc::as_ptr(observer);
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        observers.retain(|weak| match weak.upgrade() {
            Some(live) => !std::ptr::eq(Arc::as_ptr(&live), target),
            None => false,
        });
    }

    /// Deliver `event` to every live observer in subscription order.
    ///
    /// Dead weak refs are pruned opportunistically. An observer that
    /// panics is caught (logged via `tracing::warn!`) and does not
    /// block delivery to the rest. When `drop_slow_observers` is set,
    /// an observer that panics three times in a row is unsubscribed.
    pub fn publish(&self, event: &Event) {
        let snapshot: Vec<Weak<dyn Observer>> = self
            .observers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        let mut dead_indices = Vec::new();
        for (index, weak) in snapshot.iter().enumerate() {
            let Some(observer) = weak.upgrade() else {
                dead_indices.push(index);
                continue;
            };
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event)));
            if let Err(panic) = result {
                tracing::warn!(
                    event = event.event_type.as_str(),
                    "observer panicked while handling event: {panic:?}"
                );
                self.record_observer_panic(index);
            } else {
                self.clear_observer_panic(index);
            }
        }

        if !dead_indices.is_empty() {
            let mut observers = self
                .observers
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut i = 0;
            observers.retain(|_| {
                let keep = !dead_indices.contains(&i);
                i += 1;
                keep
            });
        }
    }

    fn record_observer_panic(&self, index: usize) {
        if !self.drop_slow_observers {
            return;
        }
        let mut streaks = self
            .failure_streaks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let streak = streaks.entry(index).or_insert(0);
        *streak += 1;
        if *streak >= 3 {
            drop(streaks);
            let mut observers = self
                .observers
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(slot) = observers.get_mut(index) {
                *slot = Weak::new();
            }
        }
    }

    fn clear_observer_panic(&self, index: usize) {
        let mut streaks = self
            .failure_streaks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        streaks.shift_remove(&index);
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Test/diagnostic observer that collects every event it receives.
#[derive(Default)]
pub struct CollectingObserver {
    events: std::sync::Mutex<Vec<Event>>,
}

impl CollectingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Observer for CollectingObserver {
    fn on_event(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
    }
}
