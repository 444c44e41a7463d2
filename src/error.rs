//! Error taxonomy for the pipeline substrate.
//!
//! [`ArtemisError`] classifies every failure the substrate recognizes
//! into the kinds from the error handling design: retryable transient
//! failures, non-retryable caller mistakes, and internal invariant
//! violations. Every variant carries an [`ErrorContext`] bag so the
//! orchestrator and supervisor can log and checkpoint failures without
//! losing the card/stage/attempt that produced them.

use serde::ser::SerializeMap;

/// Structured context attached to every [`ArtemisError`].
///
/// Fields are filled in as the error crosses component boundaries —
/// a stage raises with `card_id`/`stage` already known; the supervisor
/// adds `attempt`; a circuit rejection adds `dependency`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub card_id: Option<String>,
    pub stage: Option<String>,
    pub attempt: Option<u32>,
    pub dependency: Option<String>,
    /// Causal chain of wrapped error messages, outermost first.
    pub cause_chain: Vec<String>,
}

impl ErrorContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_card_id(mut self, card_id: impl Into<String>) -> Self {
        self.card_id = Some(card_id.into());
        self
    }

    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause_chain.push(cause.into());
        self
    }
}

impl serde::Serialize for ErrorContext {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ref card_id) = self.card_id {
            map.serialize_entry("card_id", card_id)?;
        }
        if let Some(ref stage) = self.stage {
            map.serialize_entry("stage", stage)?;
        }
        if let Some(attempt) = self.attempt {
            map.serialize_entry("attempt", &attempt)?;
        }
        if let Some(ref dependency) = self.dependency {
            map.serialize_entry("dependency", dependency)?;
        }
        if !self.cause_chain.is_empty() {
            map.serialize_entry("cause_chain", &self.cause_chain)?;
        }
        map.end()
    }
}

/// Errors recognized and propagated by the pipeline substrate (§7).
///
/// Organized by the taxonomy's retry semantics: non-retryable caller/config
/// mistakes, retryable transient conditions, cancellation, dependency
/// unavailability, stage-declared fatal failures, and internal bugs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ArtemisError {
    /// Caller-supplied data is malformed (empty card id, unknown stage,
    /// checkpoint schema mismatch). Non-retryable.
    #[error("invalid input: {message}")]
    InvalidInput {
        message: String,
        context: ErrorContext,
    },

    /// Missing or invalid configuration. Non-retryable.
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    /// A failure declared retryable by the failing stage (network blips,
    /// rate limits). Retried per policy.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        context: ErrorContext,
    },

    /// The stage exceeded its timeout. Retryable unless the stage opts out.
    #[error("stage timed out: {message}")]
    Timeout {
        message: String,
        context: ErrorContext,
    },

    /// Cooperative cancellation was observed. Not retried.
    #[error("cancelled")]
    Cancelled { context: ErrorContext },

    /// A required circuit is open. Not retried until the circuit allows.
    #[error("dependency unavailable: {}", context.dependency.as_deref().unwrap_or("unknown"))]
    DependencyUnavailable { context: ErrorContext },

    /// The stage declares the failure unrecoverable. Not retried; fatal
    /// for the run unless the stage is marked non-mandatory.
    #[error("stage fatal: {message}")]
    StageFatal {
        message: String,
        context: ErrorContext,
    },

    /// A substrate invariant was violated. Not retried; surfaces with
    /// full context.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        context: ErrorContext,
    },

    /// An I/O error occurred (checkpoint read/write, etc.).
    #[error("io error: {message}")]
    Io { message: String },

    /// A JSON serialization/deserialization error occurred.
    #[error("json error: {message}")]
    Json { message: String },
}

impl ArtemisError {
    /// Whether this error should be retried by the supervisor.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Whether this error is terminal for the run unconditionally
    /// (as opposed to terminal-for-the-stage-but-non-fatal-for-the-run).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. }
                | Self::Configuration { .. }
                | Self::StageFatal { .. }
                | Self::Internal { .. }
        )
    }

    /// A unique, stable error code string for this variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Configuration { .. } => "CONFIGURATION",
            Self::Transient { .. } => "TRANSIENT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled { .. } => "CANCELLED",
            Self::DependencyUnavailable { .. } => "DEPENDENCY_UNAVAILABLE",
            Self::StageFatal { .. } => "STAGE_FATAL",
            Self::Internal { .. } => "INTERNAL",
            Self::Io { .. } => "IO_ERROR",
            Self::Json { .. } => "JSON_ERROR",
        }
    }

    /// Borrow the structured context bag, if this variant carries one.
    #[must_use]
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::InvalidInput { context, .. }
            | Self::Configuration { context, .. }
            | Self::Transient { context, .. }
            | Self::Timeout { context, .. }
            | Self::Cancelled { context }
            | Self::DependencyUnavailable { context }
            | Self::StageFatal { context, .. }
            | Self::Internal { context, .. } => Some(context),
            Self::Io { .. } | Self::Json { .. } => None,
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::Cancelled {
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn dependency_unavailable(dependency: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            context: ErrorContext::new().with_dependency(dependency),
        }
    }

    #[must_use]
    pub fn stage_fatal(message: impl Into<String>) -> Self {
        Self::StageFatal {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Attach or replace the structured context bag on variants that
    /// carry one. No-op on the `Io`/`Json` wrapper variants.
    #[must_use]
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        match &mut self {
            Self::InvalidInput { context: c, .. }
            | Self::Configuration { context: c, .. }
            | Self::Transient { context: c, .. }
            | Self::Timeout { context: c, .. }
            | Self::Cancelled { context: c }
            | Self::DependencyUnavailable { context: c }
            | Self::StageFatal { context: c, .. }
            | Self::Internal { context: c, .. } => *c = context,
            Self::Io { .. } | Self::Json { .. } => {}
        }
        self
    }
}

impl From<std::io::Error> for ArtemisError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ArtemisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl serde::Serialize for ArtemisError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("code", self.code())?;
        map.serialize_entry("message", &self.to_string())?;
        if let Some(context) = self.context() {
            map.serialize_entry("context", context)?;
        }
        map.end()
    }
}

/// A `Result` type alias using [`ArtemisError`].
pub type ArtemisResult<T> = std::result::Result<T, ArtemisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ArtemisError::transient("blip").is_retryable());
        assert!(ArtemisError::timeout("slow").is_retryable());
        assert!(!ArtemisError::invalid_input("bad").is_retryable());
        assert!(!ArtemisError::cancelled().is_retryable());
        assert!(!ArtemisError::dependency_unavailable("model-client").is_retryable());
        assert!(!ArtemisError::stage_fatal("nope").is_retryable());
    }

    #[test]
    fn terminal_kinds() {
        assert!(ArtemisError::invalid_input("bad").is_terminal());
        assert!(ArtemisError::configuration("missing").is_terminal());
        assert!(ArtemisError::stage_fatal("nope").is_terminal());
        assert!(ArtemisError::internal("bug").is_terminal());
        assert!(!ArtemisError::transient("blip").is_terminal());
        assert!(!ArtemisError::cancelled().is_terminal());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ArtemisError::transient("x").code(), "TRANSIENT");
        assert_eq!(ArtemisError::stage_fatal("x").code(), "STAGE_FATAL");
        assert_eq!(
            ArtemisError::dependency_unavailable("model-client").code(),
            "DEPENDENCY_UNAVAILABLE"
        );
    }

    #[test]
    fn context_builder_chains() {
        let context = ErrorContext::new()
            .with_card_id("C1")
            .with_stage("dev")
            .with_attempt(2)
            .with_cause("upstream timeout");
        let err = ArtemisError::transient("network blip").with_context(context);
        let context = err.context().expect("transient carries context");
        assert_eq!(context.card_id.as_deref(), Some("C1"));
        assert_eq!(context.stage.as_deref(), Some("dev"));
        assert_eq!(context.attempt, Some(2));
        assert_eq!(context.cause_chain, vec!["upstream timeout".to_string()]);
    }

    #[test]
    fn serializes_to_code_message_context() {
        let err = ArtemisError::invalid_input("empty card id")
            .with_context(ErrorContext::new().with_card_id(""));
        let json = serde_json::to_value(&err).expect("serializable");
        assert_eq!(json["code"], "INVALID_INPUT");
        assert!(json["message"].as_str().unwrap().contains("empty card id"));
    }

    #[test]
    fn io_and_json_wrappers_have_no_context() {
        let io_err: ArtemisError = std::io::Error::other("disk full").into();
        assert_eq!(io_err.code(), "IO_ERROR");
        assert!(io_err.context().is_none());
    }
}
