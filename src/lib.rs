//! Artemis — an execution substrate for autonomous software-engineering
//! pipelines.
//!
//! A host feeds a [`Card`] to an [`Orchestrator`], which resolves a stage
//! plan via a [`Router`], runs each [`Stage`] under a [`Supervisor`]
//! (retries, timeouts, circuit breakers, rate limiting), persists
//! progress to a [`CheckpointStore`] after every stage, and reports
//! progress through an [`EventBus`]. The substrate owns sequencing,
//! reliability policy, and state — it has no opinion on what a stage
//! actually does.

#![warn(clippy::pedantic)]
#![allow(clippy::result_large_err)]

pub mod card;
pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod router;
pub mod stage;
pub mod state_machine;
pub mod supervisor;
pub mod worker_pool;

pub use card::{Card, Priority};
pub use checkpoint::{Checkpoint, CheckpointStore, FilesystemCheckpointStore, MemoryCheckpointStore};
pub use circuit::{CircuitBreaker, CircuitParams, CircuitRegistry};
pub use config::Config;
pub use context::{ContextView, PipelineContext};
pub use error::{ArtemisError, ArtemisResult};
pub use events::{Event, EventBus, EventType, Observer};
pub use orchestrator::{run_pipeline, FinalResult, Orchestrator, OrchestratorConfig};
pub use registry::StageRegistry;
pub use router::{
    AdaptiveRouter, ComplexityBasedRouter, ManualRouter, ResourceBasedRouter, Router,
    StagePlanEntry,
};
pub use stage::{CancellationToken, Stage, StageResult, StageStatus};
pub use state_machine::{PipelineState, StateMachine};
pub use supervisor::Supervisor;
