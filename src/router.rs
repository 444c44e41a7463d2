//! Router and stage-selection strategies (§4.2).
//!
//! The router decides which stages run, their order, and per-stage
//! parameters. Selection strategies form a closed set — adding one adds
//! a case, it does not open the trait to arbitrary implementations from
//! outside this crate's design (§9 "the router is closed to
//! modification").

use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;

use crate::card::{Card, Priority};
use crate::error::{ArtemisError, ArtemisResult};
use crate::registry::StageRegistry;

/// Per-stage parameters emitted by the router (§4.2).
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlanEntry {
    pub name: String,
    pub max_workers: usize,
    pub retry_budget: u32,
    pub timeout: Duration,
    pub mandatory: bool,
    pub extra: IndexMap<String, Value>,
}

impl StagePlanEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            max_workers: 1,
            retry_budget: 0,
            timeout,
            mandatory: true,
            extra: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    #[must_use]
    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Rough complexity bucket derived from a card (§4.2 complexity-based
/// strategy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Complexity {
    Trivial,
    Moderate,
    Complex,
}

const RISKY_KEYWORDS: [&str; 5] = ["migrate", "rewrite", "distributed", "concurrency", "security"];

/// Count of risk keywords from `card`'s description, shared by
/// [`estimate_complexity`] and [`score_advanced_modes`].
fn risk_keyword_hits(card: &Card) -> usize {
    let description = card.description().to_ascii_lowercase();
    RISKY_KEYWORDS.iter().filter(|kw| description.contains(*kw)).count()
}

/// Estimate complexity from story points, priority, and a small keyword
/// heuristic over the description — no model call in this crate (the
/// spec allows an "optional model call"; that collaborator is external
/// and out of scope here).
#[must_use]
pub fn estimate_complexity(card: &Card) -> Complexity {
    let points = card.story_points().unwrap_or(1.0);
    let keyword_hits = risk_keyword_hits(card);

    let score = points
        + match card.priority() {
            Priority::Low => 0.0,
            Priority::Medium => 1.0,
            Priority::High => 2.0,
            Priority::Critical => 3.0,
        }
        + keyword_hits as f64 * 2.0;

    if score <= 2.0 {
        Complexity::Trivial
    } else if score < 6.0 {
        Complexity::Moderate
    } else {
        Complexity::Complex
    }
}

/// Score the "advanced modes" §4.2 describes (parallel competing
/// workers, a fast-preview pass, probabilistic uncertainty
/// quantification) from complexity, identified risk keywords, and an
/// uncertainty estimate, and return the per-stage flags that enable
/// them. The router decides; stages only read what they're told — see
/// §4.2 "an implementer must not make the mode decisions inside
/// stages."
#[must_use]
pub fn score_advanced_modes(card: &Card, complexity: Complexity) -> IndexMap<String, Value> {
    let risk_hits = risk_keyword_hits(card);
    let uncertainty_estimate = match complexity {
        Complexity::Trivial => 0.1,
        Complexity::Moderate => 0.35,
        Complexity::Complex => 0.35 + risk_hits as f64 * 0.15,
    };

    let mut flags = IndexMap::new();
    flags.insert("parallel_workers".to_string(), Value::Bool(complexity != Complexity::Trivial));
    flags.insert("fast_preview".to_string(), Value::Bool(complexity == Complexity::Trivial));
    flags.insert(
        "uncertainty_quantification".to_string(),
        Value::Bool(uncertainty_estimate >= 0.5),
    );
    flags.insert(
        "uncertainty_estimate".to_string(),
        serde_json::json!(uncertainty_estimate),
    );
    flags
}

/// Declared CPU/memory/wall-clock budget a resource-based strategy
/// enforces (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct ResourceBudget {
    pub max_total_timeout: Duration,
    pub max_parallel_workers: usize,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            max_total_timeout: Duration::from_secs(3600),
            max_parallel_workers: 8,
        }
    }
}

/// `plan(card) -> [StagePlanEntry]` (§4.2 contract).
pub trait Router: Send + Sync {
    /// Produce an ordered plan for `card`.
    ///
    /// # Errors
    ///
    /// Returns [`ArtemisError::Configuration`] if the plan would
    /// reference an unregistered stage or contain a duplicate name —
    /// the router refuses to emit such plans (§4.2 cycle detection).
    fn plan(&self, card: &Card) -> ArtemisResult<Vec<StagePlanEntry>>;
}

/// Validate a plan has no duplicate stage names and every stage is
/// registered (§4.2).
///
/// # Errors
///
/// Returns [`ArtemisError::Configuration`] on the first violation found.
pub fn validate_plan(plan: &[StagePlanEntry], registry: &StageRegistry) -> ArtemisResult<()> {
    let mut seen = std::collections::HashSet::new();
    for entry in plan {
        if !seen.insert(entry.name.as_str()) {
            return Err(ArtemisError::configuration(format!(
                "duplicate stage '{}' in plan",
                entry.name
            )));
        }
        if !registry.contains(&entry.name) {
            return Err(ArtemisError::configuration(format!(
                "plan references unregistered stage '{}'",
                entry.name
            )));
        }
    }
    Ok(())
}

/// Complexity-based selection: maps a [`Complexity`] bucket to a stage
/// subset and parameter scaling (§4.2).
pub struct ComplexityBasedRouter {
    default_timeout: Duration,
    default_retry_budget: u32,
}

impl ComplexityBasedRouter {
    /// `default_retry_budget` seeds every entry's retry budget (typically
    /// `Config::retry_max_attempts`, §6); complexity scaling below still
    /// overrides it per stage where a bucket calls for more attempts.
    #[must_use]
    pub fn new(default_timeout: Duration, default_retry_budget: u32) -> Self {
        Self {
            default_timeout,
            default_retry_budget,
        }
    }

    fn entries_for(&self, card: &Card, complexity: Complexity) -> Vec<StagePlanEntry> {
        let base = |name: &str| {
            StagePlanEntry::new(name, self.default_timeout).with_retry_budget(self.default_retry_budget)
        };
        let with_mode_flags = |entry: StagePlanEntry| {
            score_advanced_modes(card, complexity)
                .into_iter()
                .fold(entry, |e, (k, v)| e.with_extra(k, v))
        };
        match complexity {
            Complexity::Trivial => vec![
                base("parse"),
                with_mode_flags(base("dev").with_retry_budget(1)),
                base("test"),
            ],
            Complexity::Moderate => vec![
                base("parse"),
                base("plan"),
                with_mode_flags(base("dev").with_retry_budget(2).with_max_workers(2)),
                base("review"),
                base("test"),
            ],
            Complexity::Complex => vec![
                base("parse"),
                base("plan"),
                base("architecture"),
                with_mode_flags(base("dev").with_retry_budget(3).with_max_workers(4)),
                base("review").with_retry_budget(1),
                base("validation"),
                base("integration"),
                base("test"),
            ],
        }
    }
}

impl Router for ComplexityBasedRouter {
    fn plan(&self, card: &Card) -> ArtemisResult<Vec<StagePlanEntry>> {
        Ok(self.entries_for(card, estimate_complexity(card)))
    }
}

/// Resource-based selection: drops stages whose accumulated timeout or
/// worker count would exceed `budget` (§4.2).
pub struct ResourceBasedRouter {
    inner: Box<dyn Router>,
    budget: ResourceBudget,
}

impl ResourceBasedRouter {
    #[must_use]
    pub fn new(inner: Box<dyn Router>, budget: ResourceBudget) -> Self {
        Self { inner, budget }
    }
}

impl Router for ResourceBasedRouter {
    fn plan(&self, card: &Card) -> ArtemisResult<Vec<StagePlanEntry>> {
        let mut plan = self.inner.plan(card)?;
        let mut total = Duration::ZERO;
        plan.retain_mut(|entry| {
            if entry.max_workers > self.budget.max_parallel_workers {
                entry.max_workers = self.budget.max_parallel_workers;
            }
            let within_budget = total + entry.timeout <= self.budget.max_total_timeout;
            if within_budget {
                total += entry.timeout;
            }
            within_budget || entry.mandatory
        });
        Ok(plan)
    }
}

/// Manual selection: honors an explicit stage list from the caller,
/// ignoring any heuristic (§4.2).
pub struct ManualRouter {
    plan: Vec<StagePlanEntry>,
}

impl ManualRouter {
    #[must_use]
    pub fn new(plan: Vec<StagePlanEntry>) -> Self {
        Self { plan }
    }
}

impl Router for ManualRouter {
    fn plan(&self, _card: &Card) -> ArtemisResult<Vec<StagePlanEntry>> {
        Ok(self.plan.clone())
    }
}

/// Adaptive selection: complexity-based by default, resource-based
/// drops applied, manual overrides take precedence when present (§4.2).
pub struct AdaptiveRouter {
    complexity: ComplexityBasedRouter,
    resource_budget: Option<ResourceBudget>,
    manual_override: Option<Vec<StagePlanEntry>>,
}

impl AdaptiveRouter {
    #[must_use]
    pub fn new(default_timeout: Duration, default_retry_budget: u32) -> Self {
        Self {
            complexity: ComplexityBasedRouter::new(default_timeout, default_retry_budget),
            resource_budget: None,
            manual_override: None,
        }
    }

    #[must_use]
    pub fn with_resource_budget(mut self, budget: ResourceBudget) -> Self {
        self.resource_budget = Some(budget);
        self
    }

    #[must_use]
    pub fn with_manual_override(mut self, plan: Vec<StagePlanEntry>) -> Self {
        self.manual_override = Some(plan);
        self
    }
}

impl Router for AdaptiveRouter {
    fn plan(&self, card: &Card) -> ArtemisResult<Vec<StagePlanEntry>> {
        if let Some(plan) = &self.manual_override {
            return Ok(plan.clone());
        }
        let mut plan = self.complexity.plan(card)?;
        if let Some(budget) = self.resource_budget {
            let mut total = Duration::ZERO;
            plan.retain_mut(|entry| {
                if entry.max_workers > budget.max_parallel_workers {
                    entry.max_workers = budget.max_parallel_workers;
                }
                let within_budget = total + entry.timeout <= budget.max_total_timeout;
                if within_budget {
                    total += entry.timeout;
                }
                within_budget || entry.mandatory
            });
        }
        Ok(plan)
    }
}
