//! The task descriptor driven through a pipeline run (§3).
//!
//! A [`Card`] is the substrate's only required input. It is opaque to
//! the orchestrator beyond the fields the router reads to build a plan
//! (story points, labels) — everything else is forwarded to stages
//! untouched.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{ArtemisError, ArtemisResult};

/// Caller-supplied task descriptor.
///
/// Immutable once created — the substrate never mutates a card. Stages
/// read it through [`crate::context::ContextView::card`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Card {
    id: String,
    title: String,
    description: String,
    priority: Priority,
    story_points: Option<f64>,
    labels: Vec<String>,
    metadata: IndexMap<String, Value>,
}

/// Caller-assigned priority, used by complexity heuristics in the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Card {
    /// Build a card, rejecting an empty id per the §3 invariant.
    ///
    /// # Errors
    ///
    /// Returns [`ArtemisError::InvalidInput`] if `id` is empty.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> ArtemisResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ArtemisError::invalid_input("card id must not be empty"));
        }
        Ok(Self {
            id,
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            story_points: None,
            labels: Vec::new(),
            metadata: IndexMap::new(),
        })
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_story_points(mut self, points: f64) -> Self {
        self.story_points = Some(points);
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn story_points(&self) -> Option<f64> {
        self.story_points
    }

    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    #[must_use]
    pub fn metadata(&self) -> &IndexMap<String, Value> {
        &self.metadata
    }
}
