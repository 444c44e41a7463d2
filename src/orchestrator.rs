//! Top-level pipeline driver (§4.1).
//!
//! The orchestrator is the substrate's single entry point: it resolves
//! a plan from the [`crate::router::Router`], loads any existing
//! checkpoint, then walks the plan one stage at a time, invoking each
//! through the [`Supervisor`] and updating the [`crate::state_machine::StateMachine`],
//! [`crate::events::EventBus`], and [`crate::checkpoint::CheckpointStore`]
//! along the way (§4.1 algorithm).

use std::sync::Arc;

use crate::card::Card;
use crate::checkpoint::{Checkpoint, CheckpointStore, CompletedStage};
use crate::circuit::CircuitRegistry;
use crate::config::Config;
use crate::context::PipelineContext;
use crate::error::{ArtemisError, ArtemisResult};
use crate::events::{Event, EventBus, EventType};
use crate::registry::StageRegistry;
use crate::router::{validate_plan, Router};
use crate::stage::{CancellationToken, StageResult, StageStatus};
use crate::state_machine::{PipelineState, StateMachine};
use crate::supervisor::Supervisor;

/// Bundles everything the orchestrator needs: registry, router,
/// supervisor, checkpoint store, event bus, and config. Mirrors the
/// donor engine's config-struct pattern, generalized from one
/// hard-coded registry + emitter into a pluggable set of substrate
/// collaborators (§4.1).
pub struct OrchestratorConfig {
    pub registry: StageRegistry,
    pub router: Box<dyn Router>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub event_bus: Arc<EventBus>,
    pub config: Config,
}

impl OrchestratorConfig {
    #[must_use]
    pub fn new(
        registry: StageRegistry,
        router: Box<dyn Router>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            registry,
            router,
            checkpoint_store,
            event_bus: Arc::new(EventBus::default()),
            config: Config::default(),
        }
    }

    #[must_use]
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
}

/// What the caller gets back from [`Orchestrator::run`] (§4.1 contract).
#[derive(Debug)]
pub struct FinalResult {
    /// Identifies this particular invocation of [`Orchestrator::run`],
    /// distinct from `card_id` (the same card may be run, fail, and be
    /// resumed across several run ids) (§4.1 step 1).
    pub run_id: String,
    pub card_id: String,
    pub state: PipelineState,
    pub stage_results: Vec<StageResult>,
    pub error: Option<ArtemisError>,
}

impl FinalResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Completed
    }
}

/// Library-level entry point: build an [`Orchestrator`] from `config`
/// and run `card` to completion in one call (§6 "a single library-level
/// call: `run_pipeline(card, config) -> FinalResult`"). Equivalent to
/// `Orchestrator::new(config).run(card)`; callers that run more than one
/// card against the same collaborators should build the `Orchestrator`
/// once and call [`Orchestrator::run`] directly instead of re-wiring it
/// per card.
///
/// # Errors
///
/// See [`Orchestrator::run`].
pub async fn run_pipeline(card: Card, config: OrchestratorConfig) -> ArtemisResult<FinalResult> {
    Orchestrator::new(config).run(card).await
}

/// The top-level driver (§4.1).
pub struct Orchestrator {
    registry: StageRegistry,
    router: Box<dyn Router>,
    supervisor: Supervisor,
    checkpoint_store: Arc<dyn CheckpointStore>,
    event_bus: Arc<EventBus>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        let supervisor = Supervisor::new(CircuitRegistry::new(), config.event_bus.clone(), config.config.clone());
        Self {
            registry: config.registry,
            router: config.router,
            supervisor,
            checkpoint_store: config.checkpoint_store,
            event_bus: config.event_bus,
        }
    }

    /// Run `card` through the pipeline to completion (§4.1 algorithm).
    pub async fn run(&self, card: Card) -> ArtemisResult<FinalResult> {
        self.run_with_cancel(card, &CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), honoring cooperative cancellation (§5).
    pub async fn run_with_cancel(
        &self,
        card: Card,
        cancel: &CancellationToken,
    ) -> ArtemisResult<FinalResult> {
        let card_id = card.id().to_string();
        let run_id = uuid::Uuid::now_v7().to_string();
        let _span = tracing::info_span!("pipeline_run", run_id = %run_id, card_id = %card_id).entered();

        let machine = StateMachine::new();
        machine.transition(PipelineState::Running, "pipeline started")?;
        self.event_bus
            .publish(&Event::new(EventType::PipelineStarted).with_card_id(card_id.as_str()));

        let plan = self.router.plan(&card)?;
        validate_plan(&plan, &self.registry)?;

        let existing = self.checkpoint_store.load(&card_id).await?;
        let (mut checkpoint, mut stage_results, context, resume_from) =
            self.resume_state(&card, &plan, existing);

        if resume_from >= plan.len() {
            // Every stage already recorded as completed (§8 idempotence).
            machine.transition(PipelineState::Completed, "checkpoint already complete")?;
            self.event_bus.publish(
                &Event::new(EventType::PipelineCompleted).with_card_id(card_id.as_str()),
            );
            return Ok(FinalResult {
                run_id,
                card_id,
                state: PipelineState::Completed,
                stage_results,
                error: None,
            });
        }

        for entry in &plan[resume_from..] {
            if cancel.is_cancelled() {
                return self
                    .finish_cancelled(&machine, &mut checkpoint, stage_results, &card_id, &run_id)
                    .await;
            }

            let Some(stage) = self.registry.get(&entry.name) else {
                return Err(ArtemisError::configuration(format!(
                    "plan references unregistered stage '{}'",
                    entry.name
                )));
            };

            self.event_bus.publish(
                &Event::new(EventType::StageStarted)
                    .with_card_id(card_id.as_str())
                    .with_stage(entry.name.as_str()),
            );

            // Router-computed flags (e.g. advanced-mode toggles) travel
            // to the stage through the context's user-value namespace,
            // never as a direct plan-entry reference (§4.2: the router
            // decides, stages only read what they're told).
            for (key, value) in &entry.extra {
                context.set_user_value(key, value.clone());
            }

            let result = self
                .supervisor
                .invoke_with_cancel(&stage, &context.view(), entry, &card_id, cancel)
                .await;

            if result.error.as_ref().is_some_and(|e| e.code() == "CANCELLED") {
                return self
                    .finish_cancelled(&machine, &mut checkpoint, stage_results, &card_id, &run_id)
                    .await;
            }

            if result.is_success() {
                if let Some(output) = result.output.clone() {
                    context.record_stage_output(&entry.name, output);
                }
                checkpoint.record_stage(CompletedStage::from_result(&result));
                self.checkpoint_store.save(&checkpoint).await?;
                self.event_bus.publish(
                    &Event::new(EventType::StageCompleted)
                        .with_card_id(card_id.as_str())
                        .with_stage(entry.name.as_str())
                        .with_payload("attempts", result.attempts),
                );
                stage_results.push(result);
            } else {
                let error = result.error.clone();
                self.event_bus.publish(
                    &Event::new(EventType::StageFailed)
                        .with_card_id(card_id.as_str())
                        .with_stage(entry.name.as_str())
                        .with_payload("reason", error.as_ref().map(ToString::to_string).unwrap_or_default()),
                );

                if entry.mandatory {
                    checkpoint.record_stage(CompletedStage::from_result(&result));
                    checkpoint.set_state(PipelineState::Failed);
                    self.checkpoint_store.save(&checkpoint).await?;
                    stage_results.push(result);
                    machine.transition(PipelineState::Failed, "mandatory stage failed")?;
                    self.event_bus.publish(
                        &Event::new(EventType::PipelineFailed)
                            .with_card_id(card_id.as_str())
                            .with_payload(
                                "reason",
                                error.as_ref().map(ToString::to_string).unwrap_or_default(),
                            ),
                    );
                    return Ok(FinalResult {
                        run_id,
                        card_id,
                        state: PipelineState::Failed,
                        stage_results,
                        error,
                    });
                }

                // Non-mandatory stage: reported but non-fatal (§4.1).
                self.event_bus.publish(
                    &Event::new(EventType::StageSkipped)
                        .with_card_id(card_id.as_str())
                        .with_stage(entry.name.as_str()),
                );
                checkpoint.record_stage(CompletedStage::from_result(&result));
                self.checkpoint_store.save(&checkpoint).await?;
                stage_results.push(result);
            }
        }

        machine.transition(PipelineState::Completed, "plan exhausted")?;
        checkpoint.set_state(PipelineState::Completed);
        self.checkpoint_store.save(&checkpoint).await?;
        self.event_bus
            .publish(&Event::new(EventType::PipelineCompleted).with_card_id(card_id.as_str()));

        Ok(FinalResult {
            run_id,
            card_id,
            state: PipelineState::Completed,
            stage_results,
            error: None,
        })
    }

    async fn finish_cancelled(
        &self,
        machine: &StateMachine,
        checkpoint: &mut Checkpoint,
        stage_results: Vec<StageResult>,
        card_id: &str,
        run_id: &str,
    ) -> ArtemisResult<FinalResult> {
        machine.transition(PipelineState::Cancelled, "cancellation requested")?;
        checkpoint.set_state(PipelineState::Cancelled);
        self.checkpoint_store.save(checkpoint).await?;
        self.event_bus
            .publish(&Event::new(EventType::PipelineCancelled).with_card_id(card_id));
        Ok(FinalResult {
            run_id: run_id.to_string(),
            card_id: card_id.to_string(),
            state: PipelineState::Cancelled,
            stage_results,
            error: Some(ArtemisError::cancelled()),
        })
    }

    /// Build the starting checkpoint/context/stage-results and the
    /// resume index from an optional existing checkpoint (§4.1 step 3,
    /// "resumes only the prefix of stages whose names and parameters
    /// match the checkpoint; a mismatch invalidates the remaining
    /// checkpoint").
    fn resume_state(
        &self,
        card: &Card,
        plan: &[crate::router::StagePlanEntry],
        existing: Option<Checkpoint>,
    ) -> (Checkpoint, Vec<StageResult>, PipelineContext, usize) {
        let Some(existing) = existing else {
            return (
                Checkpoint::new(card.id(), plan),
                Vec::new(),
                PipelineContext::new(card.clone()),
                0,
            );
        };

        let matching_prefix = existing
            .completed_stages
            .iter()
            .enumerate()
            .take_while(|(i, stage)| {
                matches!(stage.status, StageStatus::Succeeded | StageStatus::Skipped)
                    && existing.plan_matches_prefix(plan, i + 1)
            })
            .count();

        if matching_prefix == 0 {
            tracing::debug!(card_id = card.id(), "checkpoint plan mismatch, starting fresh");
            return (
                Checkpoint::new(card.id(), plan),
                Vec::new(),
                PipelineContext::new(card.clone()),
                0,
            );
        }

        let mut checkpoint = Checkpoint::new(card.id(), plan);
        let mut outputs = indexmap::IndexMap::new();
        let mut stage_results = Vec::new();
        for completed in &existing.completed_stages[..matching_prefix] {
            if let Some(output) = &completed.output {
                outputs.insert(completed.name.clone(), output.clone());
            }
            checkpoint.record_stage(completed.clone());
            stage_results.push(StageResult {
                stage: completed.name.clone(),
                status: completed.status,
                duration: std::time::Duration::from_millis(completed.duration_ms),
                attempts: completed.attempts,
                output: completed.output.clone(),
                error: None,
            });
        }

        let context = PipelineContext::with_stage_outputs(card.clone(), outputs);
        (checkpoint, stage_results, context, matching_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::context::ContextView;
    use crate::events::{CollectingObserver, Observer};
    use crate::router::ManualRouter;
    use crate::stage::Stage;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct EchoStage(&'static str);

    #[async_trait]
    impl Stage for EchoStage {
        fn name(&self) -> &str {
            self.0
        }
        async fn execute(&self, _c: &ContextView<'_>, _cancel: &CancellationToken) -> ArtemisResult<Value> {
            Ok(json!({"stage": self.0}))
        }
    }

    struct AlwaysFatal(&'static str);

    #[async_trait]
    impl Stage for AlwaysFatal {
        fn name(&self) -> &str {
            self.0
        }
        async fn execute(&self, _c: &ContextView<'_>, _cancel: &CancellationToken) -> ArtemisResult<Value> {
            Err(ArtemisError::stage_fatal("rejected"))
        }
    }

    fn registry_with(stages: Vec<Arc<dyn Stage>>) -> StageRegistry {
        let mut registry = StageRegistry::new();
        for stage in stages {
            registry.register(stage);
        }
        registry
    }

    fn plan_for(names: &[&str]) -> Vec<crate::router::StagePlanEntry> {
        names
            .iter()
            .map(|n| crate::router::StagePlanEntry::new(*n, Duration::from_secs(5)))
            .collect()
    }

    #[tokio::test]
    async fn full_success_plan_completes_and_checkpoints_every_stage() {
        let names = ["parse", "plan", "dev", "test"];
        let registry = registry_with(
            names
                .iter()
                .map(|n| Arc::new(EchoStage(n)) as Arc<dyn Stage>)
                .collect(),
        );
        let plan = plan_for(&names);
        let store = Arc::new(MemoryCheckpointStore::new());
        let event_bus = Arc::new(EventBus::default());
        let observer: Arc<dyn Observer> = Arc::new(CollectingObserver::new());
        event_bus.subscribe(&observer);

        let orchestrator = Orchestrator::new(
            OrchestratorConfig::new(registry, Box::new(ManualRouter::new(plan)), store.clone())
                .with_event_bus(event_bus),
        );

        let card = Card::new("C1", "t").unwrap();
        let result = orchestrator.run(card).await.unwrap();

        assert_eq!(result.state, PipelineState::Completed);
        assert_eq!(result.stage_results.len(), 4);
        assert!(result.stage_results.iter().all(StageResult::is_success));

        let checkpoint = store.load("C1").await.unwrap().unwrap();
        assert_eq!(checkpoint.completed_stages.len(), 4);
        assert_eq!(checkpoint.pipeline_state, PipelineState::Completed);
    }

    #[tokio::test]
    async fn mandatory_stage_fatal_failure_stops_the_run() {
        let registry = registry_with(vec![
            Arc::new(EchoStage("parse")),
            Arc::new(AlwaysFatal("dev")),
            Arc::new(EchoStage("test")),
        ]);
        let plan = plan_for(&["parse", "dev", "test"]);
        let store = Arc::new(MemoryCheckpointStore::new());
        let orchestrator = Orchestrator::new(OrchestratorConfig::new(
            registry,
            Box::new(ManualRouter::new(plan)),
            store.clone(),
        ));

        let card = Card::new("C1", "t").unwrap();
        let result = orchestrator.run(card).await.unwrap();

        assert_eq!(result.state, PipelineState::Failed);
        assert_eq!(result.stage_results.len(), 2);
        assert!(!result.stage_results[1].is_success());

        let checkpoint = store.load("C1").await.unwrap().unwrap();
        assert_eq!(checkpoint.completed_stages.len(), 2);
        assert_eq!(checkpoint.pipeline_state, PipelineState::Failed);
    }

    #[tokio::test]
    async fn resume_skips_completed_prefix() {
        let plan_names = ["parse", "plan", "dev", "test"];
        let plan = plan_for(&plan_names);
        let store = Arc::new(MemoryCheckpointStore::new());

        // First run: dev is fatal.
        let registry = registry_with(vec![
            Arc::new(EchoStage("parse")),
            Arc::new(EchoStage("plan")),
            Arc::new(AlwaysFatal("dev")),
            Arc::new(EchoStage("test")),
        ]);
        let orchestrator = Orchestrator::new(OrchestratorConfig::new(
            registry,
            Box::new(ManualRouter::new(plan.clone())),
            store.clone(),
        ));
        let card = Card::new("C1", "t").unwrap();
        let first = orchestrator.run(card).await.unwrap();
        assert_eq!(first.state, PipelineState::Failed);

        // Second run: dev now succeeds.
        let registry = registry_with(
            plan_names
                .iter()
                .map(|n| Arc::new(EchoStage(n)) as Arc<dyn Stage>)
                .collect(),
        );
        let orchestrator = Orchestrator::new(OrchestratorConfig::new(
            registry,
            Box::new(ManualRouter::new(plan)),
            store.clone(),
        ));
        let card = Card::new("C1", "t").unwrap();
        let second = orchestrator.run(card).await.unwrap();

        assert_eq!(second.state, PipelineState::Completed);
        // parse + plan were skipped (already completed), so only
        // dev (retried) and test ran this time -> 2 new results,
        // but the checkpoint records all 4.
        let checkpoint = store.load("C1").await.unwrap().unwrap();
        assert_eq!(checkpoint.completed_stages.len(), 4);
    }

    #[tokio::test]
    async fn rerunning_a_fully_completed_checkpoint_is_a_no_op() {
        let names = ["parse", "test"];
        let registry = registry_with(
            names
                .iter()
                .map(|n| Arc::new(EchoStage(n)) as Arc<dyn Stage>)
                .collect(),
        );
        let plan = plan_for(&names);
        let store = Arc::new(MemoryCheckpointStore::new());
        let orchestrator = Orchestrator::new(OrchestratorConfig::new(
            registry,
            Box::new(ManualRouter::new(plan.clone())),
            store.clone(),
        ));
        let card = Card::new("C1", "t").unwrap();
        orchestrator.run(card).await.unwrap();

        let card_again = Card::new("C1", "t").unwrap();
        let second = orchestrator.run(card_again).await.unwrap();
        assert_eq!(second.state, PipelineState::Completed);
        assert_eq!(second.stage_results.len(), 2);
    }
}
