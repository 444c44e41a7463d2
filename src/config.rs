//! Configuration surface (§6).
//!
//! A plain struct populated by defaults and optionally overlaid by
//! `ARTEMIS_`-prefixed environment variables — no file-format or CLI
//! flag parsing, both of which are out of scope (§1). Dotted keys
//! become `ARTEMIS_SCREAMING_SNAKE`, e.g. `retry.max_attempts` ->
//! `ARTEMIS_RETRY_MAX_ATTEMPTS`. Malformed env values are a
//! [`crate::error::ArtemisError::Configuration`], never a panic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::{CheckpointStore, FilesystemCheckpointStore, MemoryCheckpointStore};
use crate::circuit::CircuitParams;
use crate::error::{ArtemisError, ArtemisResult};
use crate::retry::BackoffConfig;

/// Filesystem-vs-memory choice for the checkpoint backend (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointBackend {
    Filesystem,
    Memory,
}

/// All substrate configuration (§6 table), with the defaults this crate
/// ships.
#[derive(Debug, Clone)]
pub struct Config {
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_backoff_factor: f64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_fraction: f64,
    pub stage_default_timeout_ms: u64,
    pub circuits: HashMap<String, CircuitParams>,
    pub checkpoint_backend: CheckpointBackend,
    pub checkpoint_dir: String,
    pub checkpoint_max_bytes: usize,
    pub ratelimit_enabled: bool,
    pub ratelimit_capacity: f64,
    pub ratelimit_refill_per_sec: f64,
    pub events_drop_slow_observers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_max_attempts: 1,
            retry_initial_delay_ms: 200,
            retry_backoff_factor: 2.0,
            retry_max_delay_ms: 60_000,
            retry_jitter_fraction: 0.5,
            stage_default_timeout_ms: 30_000,
            circuits: HashMap::new(),
            checkpoint_backend: CheckpointBackend::Memory,
            checkpoint_dir: "./checkpoints".to_string(),
            checkpoint_max_bytes: 1 << 20,
            ratelimit_enabled: false,
            ratelimit_capacity: 10.0,
            ratelimit_refill_per_sec: 1.0,
            events_drop_slow_observers: false,
        }
    }
}

impl Config {
    #[must_use]
    pub fn default_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: self.retry_initial_delay_ms,
            backoff_factor: self.retry_backoff_factor,
            max_delay_ms: self.retry_max_delay_ms,
            jitter_fraction: self.retry_jitter_fraction,
        }
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_default_timeout_ms)
    }

    #[must_use]
    pub fn circuit_params(&self, dependency: &str) -> CircuitParams {
        self.circuits.get(dependency).copied().unwrap_or_default()
    }

    /// Register per-dependency circuit parameters programmatically —
    /// `circuit.<name>.*` keys aren't read from the environment since
    /// dependency names aren't known ahead of time (§6).
    #[must_use]
    pub fn with_circuit(mut self, dependency: impl Into<String>, params: CircuitParams) -> Self {
        self.circuits.insert(dependency.into(), params);
        self
    }

    /// Build the checkpoint store `checkpoint_backend`, `checkpoint_dir`,
    /// and `checkpoint_max_bytes` describe (§6). A host that wants a
    /// different backend (e.g. one backed by a database) constructs its
    /// own `Arc<dyn CheckpointStore>` instead of calling this.
    #[must_use]
    pub fn build_checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        match self.checkpoint_backend {
            CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::with_max_bytes(self.checkpoint_max_bytes)),
            CheckpointBackend::Filesystem => Arc::new(FilesystemCheckpointStore::new(
                self.checkpoint_dir.clone(),
                self.checkpoint_max_bytes,
            )),
        }
    }

    /// Start from defaults and overlay `ARTEMIS_*` environment
    /// variables. Per-dependency circuit keys (`circuit.<name>.*`) are
    /// not read from the environment — they're set programmatically,
    /// since dependency names aren't known ahead of time.
    ///
    /// # Errors
    ///
    /// Returns [`ArtemisError::Configuration`] if a recognized variable
    /// is set but fails to parse as its expected type.
    pub fn from_env() -> ArtemisResult<Self> {
        let mut config = Self::default();
        config.overlay_env()?;
        Ok(config)
    }

    fn overlay_env(&mut self) -> ArtemisResult<()> {
        set_from_env("ARTEMIS_RETRY_MAX_ATTEMPTS", &mut self.retry_max_attempts)?;
        set_from_env("ARTEMIS_RETRY_INITIAL_DELAY_MS", &mut self.retry_initial_delay_ms)?;
        set_from_env("ARTEMIS_RETRY_BACKOFF_FACTOR", &mut self.retry_backoff_factor)?;
        set_from_env("ARTEMIS_RETRY_MAX_DELAY_MS", &mut self.retry_max_delay_ms)?;
        set_from_env("ARTEMIS_RETRY_JITTER_FRACTION", &mut self.retry_jitter_fraction)?;
        set_from_env("ARTEMIS_STAGE_DEFAULT_TIMEOUT_MS", &mut self.stage_default_timeout_ms)?;
        set_from_env("ARTEMIS_CHECKPOINT_DIR", &mut self.checkpoint_dir)?;
        set_from_env("ARTEMIS_CHECKPOINT_MAX_BYTES", &mut self.checkpoint_max_bytes)?;
        set_from_env("ARTEMIS_RATELIMIT_ENABLED", &mut self.ratelimit_enabled)?;
        set_from_env("ARTEMIS_RATELIMIT_CAPACITY", &mut self.ratelimit_capacity)?;
        set_from_env(
            "ARTEMIS_RATELIMIT_REFILL_PER_SEC",
            &mut self.ratelimit_refill_per_sec,
        )?;
        set_from_env(
            "ARTEMIS_EVENTS_DROP_SLOW_OBSERVERS",
            &mut self.events_drop_slow_observers,
        )?;

        if let Ok(raw) = std::env::var("ARTEMIS_CHECKPOINT_BACKEND") {
            self.checkpoint_backend = match raw.as_str() {
                "filesystem" => CheckpointBackend::Filesystem,
                "memory" => CheckpointBackend::Memory,
                other => {
                    return Err(ArtemisError::configuration(format!(
                        "ARTEMIS_CHECKPOINT_BACKEND must be 'filesystem' or 'memory', got '{other}'"
                    )));
                }
            };
        }

        Ok(())
    }
}

/// Parse `env::var(key)` into `*field` if set, leaving `*field`
/// untouched if unset.
fn set_from_env<T: std::str::FromStr>(key: &str, field: &mut T) -> ArtemisResult<()> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => {
                *field = value;
                Ok(())
            }
            Err(_) => Err(ArtemisError::configuration(format!(
                "{key} is set to '{raw}', which is not a valid value"
            ))),
        },
        Err(std::env::VarError::NotPresent) => Ok(()),
        Err(std::env::VarError::NotUnicode(_)) => Err(ArtemisError::configuration(format!(
            "{key} is not valid unicode"
        ))),
    }
}
