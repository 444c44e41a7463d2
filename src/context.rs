//! Shared run context handed between stages (§3 `PipelineContext`).
//!
//! The orchestrator exclusively owns a [`PipelineContext`] for the
//! duration of a run (§3 ownership) and mutates it only between stages
//! (§5 shared-resource policy). Stages never see the mutable type —
//! they receive a [`ContextView`], a read-only borrow exposing the
//! card and every stage output recorded so far.

use std::sync::RwLock;

use indexmap::IndexMap;
use serde_json::Value;

use crate::card::Card;

/// Mutable-only-at-stage-boundaries context for one pipeline run.
///
/// Two namespaces are kept distinct per §3: `stage-name -> stage-output`
/// (populated by the orchestrator after each successful stage) and an
/// arbitrary user-key map (for cross-stage signaling that doesn't fit
/// the stage-output model, e.g. a router-computed complexity score).
pub struct PipelineContext {
    card: Card,
    stage_outputs: RwLock<IndexMap<String, Value>>,
    user_values: RwLock<IndexMap<String, Value>>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("card_id", &self.card.id())
            .field(
                "stage_outputs",
                &self
                    .stage_outputs
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .keys()
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PipelineContext {
    #[must_use]
    pub fn new(card: Card) -> Self {
        Self {
            card,
            stage_outputs: RwLock::new(IndexMap::new()),
            user_values: RwLock::new(IndexMap::new()),
        }
    }

    /// Reconstruct a context from a checkpoint's recorded stage outputs,
    /// used when resuming (§4.1 step 3).
    #[must_use]
    pub fn with_stage_outputs(card: Card, stage_outputs: IndexMap<String, Value>) -> Self {
        Self {
            card,
            stage_outputs: RwLock::new(stage_outputs),
            user_values: RwLock::new(IndexMap::new()),
        }
    }

    #[must_use]
    pub fn card(&self) -> &Card {
        &self.card
    }

    /// Merge a stage's output into the context. Orchestrator-only,
    /// called between stages, never while a stage is executing (§5).
    pub(crate) fn record_stage_output(&self, stage: &str, output: Value) {
        self.stage_outputs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(stage.to_string(), output);
    }

    pub(crate) fn set_user_value(&self, key: &str, value: Value) {
        self.user_values
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    #[must_use]
    pub fn stage_output(&self, stage: &str) -> Option<Value> {
        self.stage_outputs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(stage)
            .cloned()
    }

    #[must_use]
    pub fn has_stage_output(&self, stage: &str) -> bool {
        self.stage_outputs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(stage)
    }

    #[must_use]
    pub fn user_value(&self, key: &str) -> Option<Value> {
        self.user_values
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Snapshot of every recorded stage output, in insertion order —
    /// used by the checkpoint store.
    #[must_use]
    pub fn stage_outputs_snapshot(&self) -> IndexMap<String, Value> {
        self.stage_outputs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// A read-only view of this context, as handed to a [`crate::stage::Stage`].
    #[must_use]
    pub fn view(&self) -> ContextView<'_> {
        ContextView { context: self }
    }
}

/// Read-only view of a [`PipelineContext`] (§4.8: stages "must not
/// mutate the context directly").
pub struct ContextView<'a> {
    context: &'a PipelineContext,
}

impl ContextView<'_> {
    #[must_use]
    pub fn card(&self) -> &Card {
        self.context.card()
    }

    #[must_use]
    pub fn stage_output(&self, stage: &str) -> Option<Value> {
        self.context.stage_output(stage)
    }

    #[must_use]
    pub fn has_stage_output(&self, stage: &str) -> bool {
        self.context.has_stage_output(stage)
    }

    #[must_use]
    pub fn user_value(&self, key: &str) -> Option<Value> {
        self.context.user_value(key)
    }
}
