//! Supervisor: wraps one stage invocation with reliability policy (§4.3).
//!
//! Execution policy, in order and short-circuiting: circuit pre-flight,
//! then an attempt loop (heartbeat-timeout-bounded calls, exponential
//! backoff with jitter between retries), then circuit bookkeeping on
//! the outcome. The supervisor never emits the terminal
//! `stage_completed`/`stage_failed` events — those belong to the
//! orchestrator, which wraps every supervised call (§4.1). It does emit
//! `stage_retrying` for each attempt that will be retried (§4.3
//! observability).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::circuit::{Admission, CircuitRegistry};
use crate::config::Config;
use crate::context::ContextView;
use crate::error::{ArtemisError, ErrorContext};
use crate::events::{Event, EventBus, EventType};
use crate::health::{HealthMonitor, HeartbeatWatcher};
use crate::ratelimit::RateLimiter;
use crate::retry::{delay_for_attempt, RetryPolicy};
use crate::router::StagePlanEntry;
use crate::stage::{CancellationToken, Stage, StageResult};

/// Maximum number of pre-flight rejections to wait out for a single
/// invocation before giving up, independent of the stage's own retry
/// budget — bounds the dependency-unavailable wait loop (§4.3 step 1,
/// scenario 4).
const MAX_DEPENDENCY_WAITS: u32 = 20;

/// Wraps every stage invocation with health monitoring, retries,
/// timeouts, and circuit breakers (§4.3).
pub struct Supervisor {
    circuits: CircuitRegistry,
    health: Arc<HealthMonitor>,
    event_bus: Arc<EventBus>,
    rate_limiter: Option<Arc<RateLimiter>>,
    config: Config,
}

impl Supervisor {
    #[must_use]
    pub fn new(circuits: CircuitRegistry, event_bus: Arc<EventBus>, config: Config) -> Self {
        let rate_limiter = config
            .ratelimit_enabled
            .then(|| Arc::new(RateLimiter::new(config.ratelimit_capacity, config.ratelimit_refill_per_sec)));
        Self {
            circuits,
            health: Arc::new(HealthMonitor::new(event_bus.clone())),
            event_bus,
            rate_limiter,
            config,
        }
    }

    /// Forward overall cancellation into a per-attempt token, so a
    /// timeout can cancel just this attempt without cancelling the
    /// whole run's token (§5 two-phase cancellation).
    fn linked_attempt_token(cancel: &CancellationToken) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let attempt_token = CancellationToken::new();
        let forwarded = attempt_token.clone();
        let overall = cancel.clone();
        let handle = tokio::spawn(async move {
            overall.cancelled().await;
            forwarded.cancel();
        });
        (attempt_token, handle)
    }

    /// Run `stage` under the supervision policy (§4.3).
    pub async fn invoke(
        &self,
        stage: &Arc<dyn Stage>,
        context: &ContextView<'_>,
        plan: &StagePlanEntry,
        card_id: &str,
    ) -> StageResult {
        self.invoke_with_cancel(stage, context, plan, card_id, &CancellationToken::new())
            .await
    }

    /// Like [`invoke`](Self::invoke), but honors an externally-owned
    /// cancellation token (the orchestrator's run-level token).
    pub async fn invoke_with_cancel(
        &self,
        stage: &Arc<dyn Stage>,
        context: &ContextView<'_>,
        plan: &StagePlanEntry,
        card_id: &str,
        cancel: &CancellationToken,
    ) -> StageResult {
        let overall_start = Instant::now();
        let policy = RetryPolicy::from_budget(plan.retry_budget, self.config.default_backoff());
        let max_attempts = policy.max_attempts;
        let backoff = policy.backoff;
        let dependencies = stage.required_dependencies();
        let breakers: Vec<_> = dependencies
            .iter()
            .map(|dep| self.circuits.get_or_create(dep, self.config.circuit_params(dep)))
            .collect();

        let mut attempt: u32 = 0;
        let mut dependency_waits: u32 = 0;
        let mut last_error;

        loop {
            if cancel.is_cancelled() {
                last_error = ArtemisError::cancelled().with_context(
                    ErrorContext::new().with_card_id(card_id).with_stage(stage.name()),
                );
                break;
            }

            // Step 1: pre-flight circuit check. A dependency later in the
            // list rejecting must not strand a probe already admitted for
            // an earlier one — that probe slot is released so the next
            // iteration's `admit()` can hand it out again (§4.3 step 1).
            let mut rejected = None;
            let mut probes = Vec::new();
            for (dep, breaker) in dependencies.iter().zip(breakers.iter()) {
                match breaker.admit() {
                    Admission::Rejected => {
                        rejected = Some(dep.clone());
                        break;
                    }
                    Admission::AllowedAsProbe => probes.push(breaker.clone()),
                    Admission::Allowed => {}
                }
            }
            if let Some(dep) = rejected {
                for probe in &probes {
                    probe.cancel_probe();
                }
                dependency_waits += 1;
                let err = ArtemisError::dependency_unavailable(dep).with_context(
                    ErrorContext::new()
                        .with_card_id(card_id)
                        .with_stage(stage.name())
                        .with_attempt(attempt),
                );
                if dependency_waits > MAX_DEPENDENCY_WAITS || max_attempts == 1 {
                    last_error = err;
                    break;
                }
                self.event_bus.publish(
                    &Event::new(EventType::StageRetrying)
                        .with_card_id(card_id)
                        .with_stage(stage.name())
                        .with_payload("attempt", attempt)
                        .with_payload("reason", "dependency_unavailable"),
                );
                let delay = delay_for_attempt(dependency_waits, &backoff);
                if Self::sleep_cancellable(delay, cancel).await.is_err() {
                    last_error = ArtemisError::cancelled().with_context(
                        ErrorContext::new().with_card_id(card_id).with_stage(stage.name()),
                    );
                    break;
                }
                continue;
            }

            // Step 2: rate limit (if configured).
            if let Some(limiter) = &self.rate_limiter {
                if let Err(err) = limiter.acquire(cancel).await {
                    last_error = err;
                    break;
                }
            }

            attempt += 1;
            let (attempt_token, forwarder) = Self::linked_attempt_token(cancel);
            let watcher = HeartbeatWatcher::new(plan.timeout);
            let attempt_start = Instant::now();
            let outcome = watcher
                .watch(stage.execute(context, &attempt_token))
                .await;
            forwarder.abort();

            match outcome {
                Ok(Ok(output)) => {
                    for breaker in &breakers {
                        breaker.record_success();
                    }
                    self.health.record_success(stage.name());
                    tracing::debug!(
                        card_id, stage = stage.name(), attempt, duration_ms = attempt_start.elapsed().as_millis() as u64,
                        "stage attempt succeeded"
                    );
                    return StageResult::succeeded(stage.name(), overall_start.elapsed(), attempt, output);
                }
                Ok(Err(err)) => {
                    for breaker in &breakers {
                        breaker.record_failure();
                    }
                    self.health.record_failure(stage.name(), &err.to_string());
                    let err = err.with_context(
                        ErrorContext::new()
                            .with_card_id(card_id)
                            .with_stage(stage.name())
                            .with_attempt(attempt),
                    );
                    if !err.is_retryable() || attempt >= max_attempts {
                        last_error = err;
                        break;
                    }
                    self.emit_retrying(card_id, stage.name(), attempt, max_attempts);
                    let delay = delay_for_attempt(attempt, &backoff);
                    if Self::sleep_cancellable(delay, cancel).await.is_err() {
                        last_error = ArtemisError::cancelled().with_context(
                            ErrorContext::new().with_card_id(card_id).with_stage(stage.name()).with_attempt(attempt),
                        );
                        break;
                    }
                    last_error = err;
                }
                Err(_timed_out) => {
                    for breaker in &breakers {
                        breaker.record_failure();
                    }
                    self.health.record_failure(stage.name(), "timeout");
                    let err = ArtemisError::timeout(format!(
                        "stage '{}' exceeded timeout of {:?}",
                        stage.name(),
                        plan.timeout
                    ))
                    .with_context(
                        ErrorContext::new()
                            .with_card_id(card_id)
                            .with_stage(stage.name())
                            .with_attempt(attempt),
                    );
                    if attempt >= max_attempts {
                        last_error = err;
                        break;
                    }
                    self.emit_retrying(card_id, stage.name(), attempt, max_attempts);
                    let delay = delay_for_attempt(attempt, &backoff);
                    if Self::sleep_cancellable(delay, cancel).await.is_err() {
                        last_error = ArtemisError::cancelled().with_context(
                            ErrorContext::new().with_card_id(card_id).with_stage(stage.name()).with_attempt(attempt),
                        );
                        break;
                    }
                    last_error = err;
                }
            }
        }

        StageResult::failed(stage.name(), overall_start.elapsed(), attempt, last_error)
    }

    fn emit_retrying(&self, card_id: &str, stage: &str, attempt: u32, max_attempts: u32) {
        self.event_bus.publish(
            &Event::new(EventType::StageRetrying)
                .with_card_id(card_id)
                .with_stage(stage)
                .with_payload("attempt", attempt)
                .with_payload("max_attempts", max_attempts),
        );
    }

    /// Sleep for `delay`, returning early with `Err(())` if `cancel`
    /// trips first (§8 boundary: cancelled during backoff sleep is not
    /// retried).
    async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> Result<(), ()> {
        if delay.is_zero() {
            return if cancel.is_cancelled() { Err(()) } else { Ok(()) };
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = cancel.cancelled() => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::Card;
    use crate::context::PipelineContext;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyStage {
        name: &'static str,
        fail_times: u32,
        calls: AtomicU32,
        terminal: bool,
    }

    #[async_trait]
    impl Stage for FlakyStage {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _context: &ContextView<'_>, _cancel: &CancellationToken) -> crate::error::ArtemisResult<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                return Err(if self.terminal {
                    ArtemisError::stage_fatal("nope")
                } else {
                    ArtemisError::transient("blip")
                });
            }
            Ok(json!({"call": call}))
        }
    }

    fn supervisor(config: Config) -> Supervisor {
        Supervisor::new(CircuitRegistry::new(), Arc::new(EventBus::default()), config)
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures_within_budget() {
        let stage: Arc<dyn Stage> = Arc::new(FlakyStage {
            name: "dev",
            fail_times: 2,
            calls: AtomicU32::new(0),
            terminal: false,
        });
        let mut config = Config::default();
        config.retry_initial_delay_ms = 1;
        config.retry_jitter_fraction = 0.0;
        let supervisor = supervisor(config);
        let context = PipelineContext::new(Card::new("C1", "t").unwrap());
        let plan = StagePlanEntry::new("dev", Duration::from_secs(1)).with_retry_budget(3);
        let result = supervisor
            .invoke(&stage, &context.view(), &plan, "C1")
            .await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn terminal_error_stops_without_retry() {
        let stage: Arc<dyn Stage> = Arc::new(FlakyStage {
            name: "dev",
            fail_times: 1,
            calls: AtomicU32::new(0),
            terminal: true,
        });
        let supervisor = supervisor(Config::default());
        let context = PipelineContext::new(Card::new("C1", "t").unwrap());
        let plan = StagePlanEntry::new("dev", Duration::from_secs(1)).with_retry_budget(5);
        let result = supervisor
            .invoke(&stage, &context.view(), &plan, "C1")
            .await;
        assert!(!result.is_success());
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn zero_retry_budget_is_exactly_one_attempt() {
        let stage: Arc<dyn Stage> = Arc::new(FlakyStage {
            name: "dev",
            fail_times: 5,
            calls: AtomicU32::new(0),
            terminal: false,
        });
        let supervisor = supervisor(Config::default());
        let context = PipelineContext::new(Card::new("C1", "t").unwrap());
        let plan = StagePlanEntry::new("dev", Duration::from_secs(1));
        let result = supervisor
            .invoke(&stage, &context.view(), &plan, "C1")
            .await;
        assert_eq!(result.attempts, 1);
        assert!(!result.is_success());
    }

    struct SlowStage;

    #[async_trait]
    impl Stage for SlowStage {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _context: &ContextView<'_>, cancel: &CancellationToken) -> crate::error::ArtemisResult<Value> {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(5)) => Ok(Value::Null),
                () = cancel.cancelled() => Err(ArtemisError::cancelled()),
            }
        }
    }

    #[tokio::test]
    async fn timeout_produces_timeout_failure() {
        let stage: Arc<dyn Stage> = Arc::new(SlowStage);
        let supervisor = supervisor(Config::default());
        let context = PipelineContext::new(Card::new("C1", "t").unwrap());
        let plan = StagePlanEntry::new("slow", Duration::from_millis(20));
        let result = supervisor
            .invoke(&stage, &context.view(), &plan, "C1")
            .await;
        assert!(!result.is_success());
        assert_eq!(result.error.unwrap().code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn dependency_unavailable_rejected_with_zero_budget() {
        struct NeedsDependency;
        #[async_trait]
        impl Stage for NeedsDependency {
            fn name(&self) -> &str {
                "dev"
            }
            async fn execute(&self, _c: &ContextView<'_>, _cancel: &CancellationToken) -> crate::error::ArtemisResult<Value> {
                Ok(Value::Null)
            }
            fn required_dependencies(&self) -> Vec<String> {
                vec!["model-client".to_string()]
            }
        }
        let stage: Arc<dyn Stage> = Arc::new(NeedsDependency);
        let circuits = CircuitRegistry::new();
        let breaker = circuits.get_or_create(
            "model-client",
            crate::circuit::CircuitParams {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
                half_open_probe_count: 1,
            },
        );
        breaker.record_failure();
        let supervisor = Supervisor::new(circuits, Arc::new(EventBus::default()), Config::default());
        let context = PipelineContext::new(Card::new("C1", "t").unwrap());
        let plan = StagePlanEntry::new("dev", Duration::from_secs(1));
        let result = supervisor
            .invoke(&stage, &context.view(), &plan, "C1")
            .await;
        assert_eq!(result.attempts, 0);
        assert_eq!(result.error.unwrap().code(), "DEPENDENCY_UNAVAILABLE");
    }

    #[tokio::test]
    async fn a_rejected_sibling_dependency_releases_an_already_admitted_probe() {
        struct NeedsTwoDependencies;
        #[async_trait]
        impl Stage for NeedsTwoDependencies {
            fn name(&self) -> &str {
                "dev"
            }
            async fn execute(&self, _c: &ContextView<'_>, _cancel: &CancellationToken) -> crate::error::ArtemisResult<Value> {
                Ok(Value::Null)
            }
            fn required_dependencies(&self) -> Vec<String> {
                vec!["model-client".to_string(), "knowledge-store".to_string()]
            }
        }

        let circuits = CircuitRegistry::new();
        let probe_params = crate::circuit::CircuitParams {
            failure_threshold: 1,
            cooldown: Duration::from_millis(5),
            half_open_probe_count: 1,
        };
        let model_client = circuits.get_or_create("model-client", probe_params);
        model_client.record_failure();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let knowledge_store = circuits.get_or_create(
            "knowledge-store",
            crate::circuit::CircuitParams {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
                half_open_probe_count: 1,
            },
        );
        knowledge_store.record_failure();

        let stage: Arc<dyn Stage> = Arc::new(NeedsTwoDependencies);
        let supervisor = Supervisor::new(circuits, Arc::new(EventBus::default()), Config::default());
        let context = PipelineContext::new(Card::new("C1", "t").unwrap());
        let plan = StagePlanEntry::new("dev", Duration::from_secs(1));
        let result = supervisor
            .invoke(&stage, &context.view(), &plan, "C1")
            .await;

        assert_eq!(result.attempts, 0);
        assert_eq!(result.error.unwrap().code(), "DEPENDENCY_UNAVAILABLE");
        // The probe admitted for `model-client` before `knowledge-store`
        // rejected must have been released, not stranded.
        assert_eq!(model_client.admit(), Admission::AllowedAsProbe);
    }
}
