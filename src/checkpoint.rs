//! Checkpoint persistence (§3 `Checkpoint`, §4.7, §6 filesystem layout).
//!
//! A [`Checkpoint`] is a value object — [`CheckpointStore::load`] hands
//! back an owned copy, never a live reference into the store. The
//! substrate ships two backends: [`FilesystemCheckpointStore`] (atomic
//! write-tmp-then-rename JSON per card) and [`MemoryCheckpointStore`]
//! (for tests). Both reject oversized payloads explicitly rather than
//! truncating (§4.7).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{ArtemisError, ArtemisResult};
use crate::router::StagePlanEntry;
use crate::stage::{StageResult, StageStatus};
use crate::state_machine::PipelineState;

/// A completed stage's persisted outcome (§3 `Checkpoint`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompletedStage {
    pub name: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub attempts: u32,
    pub output: Option<Value>,
}

impl CompletedStage {
    #[must_use]
    pub fn from_result(result: &StageResult) -> Self {
        Self {
            name: result.stage.clone(),
            status: result.status,
            #[allow(clippy::cast_possible_truncation)]
            duration_ms: result.duration.as_millis() as u64,
            attempts: result.attempts,
            output: result.output.clone(),
        }
    }
}

/// A plan entry, reduced to the fields whose equality determines
/// whether a checkpoint is still valid to resume from (§4.1 tie-break).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlanSnapshotEntry {
    pub name: String,
    pub max_workers: usize,
    pub retry_budget: u32,
    pub timeout_ms: u64,
    pub mandatory: bool,
}

impl From<&StagePlanEntry> for PlanSnapshotEntry {
    fn from(entry: &StagePlanEntry) -> Self {
        Self {
            name: entry.name.clone(),
            max_workers: entry.max_workers,
            retry_budget: entry.retry_budget,
            #[allow(clippy::cast_possible_truncation)]
            timeout_ms: entry.timeout.as_millis() as u64,
            mandatory: entry.mandatory,
        }
    }
}

/// Persisted snapshot of one card's run progress (§3 `Checkpoint`).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    pub card_id: String,
    /// Monotonically increasing per card (§3 invariant).
    pub checkpoint_id: u64,
    pub pipeline_state: PipelineState,
    pub plan: Vec<PlanSnapshotEntry>,
    pub completed_stages: Vec<CompletedStage>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(card_id: impl Into<String>, plan: &[StagePlanEntry]) -> Self {
        let now = Utc::now();
        Self {
            card_id: card_id.into(),
            checkpoint_id: 0,
            pipeline_state: PipelineState::Running,
            plan: plan.iter().map(PlanSnapshotEntry::from).collect(),
            completed_stages: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Append (or replace) the record for a completed stage and bump
    /// `checkpoint_id`/`updated_at`. The completed-stage list stays a
    /// prefix of `plan` by construction — callers append in plan order.
    pub fn record_stage(&mut self, stage: CompletedStage) {
        self.completed_stages.push(stage);
        self.checkpoint_id += 1;
        self.updated_at = Utc::now();
    }

    pub fn set_state(&mut self, state: PipelineState) {
        self.pipeline_state = state;
        self.updated_at = Utc::now();
    }

    /// Whether `plan` names and parameters match this checkpoint's plan
    /// up to (and including) `prefix_len` entries — the §4.1 resume
    /// tie-break.
    #[must_use]
    pub fn plan_matches_prefix(&self, plan: &[StagePlanEntry], prefix_len: usize) -> bool {
        if self.plan.len() < prefix_len || plan.len() < prefix_len {
            return false;
        }
        self.plan[..prefix_len]
            .iter()
            .zip(plan[..prefix_len].iter().map(PlanSnapshotEntry::from))
            .all(|(recorded, current)| *recorded == current)
    }
}

/// Pluggable persistence backend for checkpoints (§4.7).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint`, replacing any prior checkpoint for the same
    /// card id.
    ///
    /// # Errors
    ///
    /// Returns [`ArtemisError::InvalidInput`] if the serialized payload
    /// exceeds the store's configured size threshold; the prior
    /// checkpoint (if any) must remain unchanged in that case.
    async fn save(&self, checkpoint: &Checkpoint) -> ArtemisResult<()>;

    /// Load the checkpoint for `card_id`, if one exists.
    async fn load(&self, card_id: &str) -> ArtemisResult<Option<Checkpoint>>;

    /// Delete the checkpoint for `card_id`, if one exists. Not an error
    /// if none exists.
    async fn delete(&self, card_id: &str) -> ArtemisResult<()>;
}

/// In-memory checkpoint store, for tests (§4.7).
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    max_bytes: Option<usize>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            checkpoints: Mutex::new(HashMap::new()),
            max_bytes: Some(max_bytes),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> ArtemisResult<()> {
        if let Some(max_bytes) = self.max_bytes {
            let size = serde_json::to_vec(checkpoint)?.len();
            if size > max_bytes {
                return Err(ArtemisError::invalid_input(format!(
                    "checkpoint for card {} is {size} bytes, exceeds max_bytes {max_bytes}",
                    checkpoint.card_id
                )));
            }
        }
        self.checkpoints
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(checkpoint.card_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, card_id: &str) -> ArtemisResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(card_id)
            .cloned())
    }

    async fn delete(&self, card_id: &str) -> ArtemisResult<()> {
        self.checkpoints
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(card_id);
        Ok(())
    }
}

/// Filesystem checkpoint backend: one JSON document per card, written
/// atomically via write-tmp-then-rename (§6 persisted state layout).
///
/// ```text
/// <dir>/
///   <card-id>/
///     checkpoint.json
///     checkpoint.json.tmp   (present only during writes)
/// ```
pub struct FilesystemCheckpointStore {
    dir: PathBuf,
    max_bytes: usize,
    /// Serializes writes per card id, per §5 shared-resource policy.
    write_locks: Mutex<HashMap<String, std::sync::Arc<tokio::sync::Mutex<()>>>>,
}

impl FilesystemCheckpointStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn card_dir(&self, card_id: &str) -> PathBuf {
        self.dir.join(card_id)
    }

    fn checkpoint_path(&self, card_id: &str) -> PathBuf {
        self.card_dir(card_id).join("checkpoint.json")
    }

    fn tmp_path(&self, card_id: &str) -> PathBuf {
        self.card_dir(card_id).join("checkpoint.json.tmp")
    }

    fn lock_for(&self, card_id: &str) -> std::sync::Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(card_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl CheckpointStore for FilesystemCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> ArtemisResult<()> {
        let json = serde_json::to_vec_pretty(checkpoint)?;
        if json.len() > self.max_bytes {
            return Err(ArtemisError::invalid_input(format!(
                "checkpoint for card {} is {} bytes, exceeds max_bytes {}",
                checkpoint.card_id,
                json.len(),
                self.max_bytes
            )));
        }

        let lock = self.lock_for(&checkpoint.card_id);
        let _guard = lock.lock().await;

        let dir = self.card_dir(&checkpoint.card_id);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = self.tmp_path(&checkpoint.card_id);
        let target = self.checkpoint_path(&checkpoint.card_id);
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &target).await?;
        tracing::debug!(card_id = %checkpoint.card_id, path = %target.display(), "checkpoint saved");
        Ok(())
    }

    async fn load(&self, card_id: &str) -> ArtemisResult<Option<Checkpoint>> {
        let path = self.checkpoint_path(card_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, card_id: &str) -> ArtemisResult<()> {
        let dir = self.card_dir(card_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
