//! Stage registry: maps stage name to implementation (§4.8, §6).
//!
//! Registered once at startup by the host. An unknown stage referenced
//! by a plan is a fatal configuration error (§6), caught by
//! [`crate::router::validate_plan`] before the orchestrator runs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::stage::Stage;

/// Maps stage names to their implementations.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("registered", &self.stages.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage under its own [`Stage::name`].
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name().to_string(), stage);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.stages.keys().map(String::as_str).collect()
    }
}
