//! The external Stage capability (§4.8) and supervised invocation result.
//!
//! Stages are the substrate's only extension point: concrete pipeline
//! steps (parse, plan, dev, review, ...) implement [`Stage`] and are
//! registered by name in a [`crate::registry::StageRegistry`]. The
//! substrate never introspects a stage's output payload — it is opaque
//! `serde_json::Value` data, carried for checkpointing only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::context::ContextView;
use crate::error::{ArtemisError, ArtemisResult};

/// Cooperative, two-phase cancellation handle (§5, §9 glossary).
///
/// Cloning shares the same underlying flag. The orchestrator/supervisor
/// call [`cancel`](Self::cancel); a stage observes it at its next
/// suspension point via [`is_cancelled`](Self::is_cancelled) or awaits
/// [`cancelled`](Self::cancelled).
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolve once [`cancel`](Self::cancel) has been called. Resolves
    /// immediately if it already has been.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // Re-check after registering to avoid missing a cancel that
        // raced between the initial check and `notified()`.
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Disposition of a supervised stage invocation (§3 `StageResult`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
    Retried,
}

/// Outcome of one supervised stage invocation, stored in the context
/// and checkpoint (§3 `StageResult`).
///
/// The §3 invariant "status consistent with error (failed <-> error
/// present)" is enforced by the constructors below rather than by
/// field visibility tricks, matching this crate's existing style.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub duration: Duration,
    pub attempts: u32,
    pub output: Option<Value>,
    pub error: Option<ArtemisError>,
}

impl StageResult {
    #[must_use]
    pub fn succeeded(stage: impl Into<String>, duration: Duration, attempts: u32, output: Value) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Succeeded,
            duration,
            attempts,
            output: Some(output),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(
        stage: impl Into<String>,
        duration: Duration,
        attempts: u32,
        error: ArtemisError,
    ) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Failed,
            duration,
            attempts,
            output: None,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn skipped(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Skipped,
            duration: Duration::ZERO,
            attempts: 0,
            output: None,
            error: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, StageStatus::Succeeded | StageStatus::Skipped)
    }
}

/// A single step in a pipeline plan: the external contract between the
/// substrate and concrete stage implementations (§4.8).
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable identifier matching the router's vocabulary.
    fn name(&self) -> &str;

    /// Run the stage. May block (suspend); must honor `cancel` at its
    /// next suspension point; must not mutate `context` directly —
    /// the return value is merged into the context by the orchestrator.
    async fn execute(&self, context: &ContextView<'_>, cancel: &CancellationToken) -> ArtemisResult<Value>;

    /// Named dependencies the supervisor should pre-flight-check circuits
    /// for before invoking this stage (§4.3 step 1).
    fn required_dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_is_observed_immediately_if_already_tripped() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("cancelled() should resolve immediately");
    }

    #[tokio::test]
    async fn cancellation_wakes_pending_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should finish")
            .expect("task should not panic");
    }

    #[test]
    fn stage_result_constructors_keep_status_and_error_consistent() {
        let ok = StageResult::succeeded("parse", Duration::from_millis(5), 1, Value::Null);
        assert!(ok.error.is_none());
        let err = StageResult::failed(
            "dev",
            Duration::from_millis(5),
            3,
            ArtemisError::stage_fatal("bad artifact"),
        );
        assert!(err.error.is_some());
        assert_eq!(err.status, StageStatus::Failed);
    }
}
