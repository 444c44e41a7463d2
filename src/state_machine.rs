//! Pipeline-level state machine (§4.4).
//!
//! Authoritative: no other component tracks pipeline state independently.
//! Transitions outside the allowed set raise [`ArtemisError::Internal`]
//! without changing state (§8 invariant 4). Every successful transition
//! is appended to a bounded history buffer and notified to subscribed
//! observers.

use std::collections::VecDeque;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::error::{ArtemisError, ArtemisResult};

/// One of the seven pipeline-level states (§3 `PipelineState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    Paused,
    Recovering,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A single recorded transition, for diagnostics and testing.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: PipelineState,
    pub to: PipelineState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

const HISTORY_CAPACITY: usize = 256;

fn allowed(from: PipelineState, to: PipelineState) -> bool {
    use PipelineState::{Cancelled, Completed, Failed, Idle, Paused, Recovering, Running};
    matches!(
        (from, to),
        (Idle, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, Recovering)
            | (Recovering, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Paused, Cancelled)
            | (Recovering, Cancelled)
    )
}

/// Observer notified `(from, to, reason)` on every successful transition.
pub trait StateObserver: Send + Sync {
    fn on_transition(&self, from: PipelineState, to: PipelineState, reason: &str);
}

/// The authoritative pipeline state machine for one run (§4.4).
pub struct StateMachine {
    state: RwLock<PipelineState>,
    history: RwLock<VecDeque<TransitionRecord>>,
    observers: RwLock<Vec<std::sync::Arc<dyn StateObserver>>>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.current())
            .finish()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PipelineState::Idle),
            history: RwLock::new(VecDeque::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: std::sync::Arc<dyn StateObserver>) {
        self.observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(observer);
    }

    #[must_use]
    pub fn current(&self) -> PipelineState {
        *self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.history
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Attempt a transition. Returns [`ArtemisError::Internal`] — without
    /// changing state — if `to` is not reachable from the current state
    /// (§8 invariant 4).
    ///
    /// # Errors
    ///
    /// Returns [`ArtemisError::Internal`] for a disallowed transition.
    pub fn transition(&self, to: PipelineState, reason: impl Into<String>) -> ArtemisResult<()> {
        let reason = reason.into();
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let from = *state;
        if !allowed(from, to) {
            return Err(ArtemisError::internal(format!(
                "illegal pipeline state transition {from:?} -> {to:?}"
            )));
        }
        *state = to;
        drop(state);

        tracing::debug!(?from, ?to, %reason, "pipeline state transition");

        {
            let mut history = self
                .history
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(TransitionRecord {
                from,
                to,
                reason: reason.clone(),
                at: Utc::now(),
            });
        }

        for observer in self
            .observers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
        {
            observer.on_transition(from, to, &reason);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_succeed() {
        let machine = StateMachine::new();
        machine.transition(PipelineState::Running, "start").unwrap();
        machine.transition(PipelineState::Paused, "pause").unwrap();
        machine.transition(PipelineState::Running, "resume").unwrap();
        machine
            .transition(PipelineState::Completed, "done")
            .unwrap();
        assert_eq!(machine.current(), PipelineState::Completed);
    }

    #[test]
    fn illegal_transition_raises_without_mutating_state() {
        let machine = StateMachine::new();
        let err = machine
            .transition(PipelineState::Completed, "skip ahead")
            .unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(machine.current(), PipelineState::Idle);
    }

    #[test]
    fn terminal_states_cannot_transition_further() {
        let machine = StateMachine::new();
        machine.transition(PipelineState::Running, "start").unwrap();
        machine
            .transition(PipelineState::Cancelled, "cancel")
            .unwrap();
        assert!(
            machine
                .transition(PipelineState::Running, "retry")
                .is_err()
        );
    }

    #[test]
    fn history_is_bounded() {
        let machine = StateMachine::new();
        machine.transition(PipelineState::Running, "start").unwrap();
        for _ in 0..(HISTORY_CAPACITY + 10) {
            machine.transition(PipelineState::Paused, "p").unwrap();
            machine.transition(PipelineState::Running, "r").unwrap();
        }
        assert_eq!(machine.history().len(), HISTORY_CAPACITY);
    }

    #[test]
    fn observers_are_notified() {
        struct Recorder(std::sync::Mutex<Vec<(PipelineState, PipelineState)>>);
        impl StateObserver for Recorder {
            fn on_transition(&self, from: PipelineState, to: PipelineState, _reason: &str) {
                self.0.lock().unwrap().push((from, to));
            }
        }
        let machine = StateMachine::new();
        let recorder = std::sync::Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        machine.subscribe(recorder.clone());
        machine.transition(PipelineState::Running, "start").unwrap();
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            &[(PipelineState::Idle, PipelineState::Running)]
        );
    }
}
