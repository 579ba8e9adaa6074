//! Resume position from a partially completed entity.
//!
//! [`ResumeResolver`] decides which step a user re-entering a flow lands on.
//! When the entity carries the explicit completion marker written by
//! [`ProjectingAdapter::mark_completion`](crate::ProjectingAdapter::mark_completion),
//! the marker is authoritative. Otherwise the resolver falls back to an
//! ordered presence checklist, which cannot tell "chose nothing" from
//! "never got there".

use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::{Entity, FieldStore, Result, StepGraph, StepKey, StepwiseError};

/// A predicate over a loaded entity.
pub type EntityPredicate = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

/// One checklist entry: if satisfied, the user may skip ahead to `target`.
struct ResumeRule<S> {
    target: S,
    satisfied: EntityPredicate,
    /// Unsatisfied required rules end the walk; optional ones are skipped.
    required: bool,
}

/// What a resume decision was based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeBasis {
    /// The entity's explicit list of completed steps.
    CompletionMarker,
    /// Presence of step-shaped data on the entity.
    Presence,
}

/// The outcome of resolving a resume position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeDecision<S> {
    /// The step to land on.
    pub step: S,
    /// What the decision was based on.
    pub basis: ResumeBasis,
}

/// Computes the landing step for a resumed session.
///
/// # Example
///
/// ```
/// use stepwise::{Entity, EntityId, FieldStore, ResumeResolver, StepGraph, StepKey};
/// use serde_json::json;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// enum Step { Basics, Amenities, Photos }
/// impl StepKey for Step {
///     fn name(&self) -> &'static str {
///         match self { Step::Basics => "basics", Step::Amenities => "amenities", Step::Photos => "photos" }
///     }
/// }
///
/// let graph = StepGraph::builder("p")
///     .fixed(Step::Basics, Step::Amenities)
///     .fixed(Step::Amenities, Step::Photos)
///     .terminal(Step::Photos)
///     .build()?;
/// let resolver = ResumeResolver::new()
///     .when_present(&["name", "address"], Step::Amenities)
///     .when_present(&["amenities"], Step::Photos);
///
/// let data = json!({"name": "Fir", "address": "1 Fir Ln"});
/// let entity = Entity::new(EntityId::new("e"), data.as_object().cloned().unwrap_or_default());
/// let decision = resolver.resolve(&entity, &graph, &FieldStore::new())?;
/// assert_eq!(decision.step, Step::Amenities);
/// # Ok::<(), stepwise::StepwiseError>(())
/// ```
pub struct ResumeResolver<S: StepKey> {
    rules: Vec<ResumeRule<S>>,
    marker_key: Option<String>,
}

impl<S: StepKey> ResumeResolver<S> {
    /// Creates a resolver with an empty checklist.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            marker_key: None,
        }
    }

    /// Adds a required rule: all of `keys` present → skip to `target`.
    pub fn when_present(self, keys: &[&str], target: S) -> Self {
        let keys: Vec<String> = keys.iter().map(|k| (*k).to_string()).collect();
        self.when(target, move |entity: &Entity| {
            keys.iter().all(|k| entity.is_present(k))
        })
    }

    /// Adds a required rule with an arbitrary predicate.
    pub fn when<F>(mut self, target: S, satisfied: F) -> Self
    where
        F: Fn(&Entity) -> bool + Send + Sync + 'static,
    {
        self.rules.push(ResumeRule {
            target,
            satisfied: Arc::new(satisfied),
            required: true,
        });
        self
    }

    /// Adds a rule for a branch-conditional step: skipped when unsatisfied.
    pub fn when_applicable<F>(mut self, target: S, satisfied: F) -> Self
    where
        F: Fn(&Entity) -> bool + Send + Sync + 'static,
    {
        self.rules.push(ResumeRule {
            target,
            satisfied: Arc::new(satisfied),
            required: false,
        });
        self
    }

    /// Prefers the explicit completion marker stored under `key`.
    pub fn with_completion_marker(mut self, key: impl Into<String>) -> Self {
        self.marker_key = Some(key.into());
        self
    }

    /// Returns the configured completion marker key.
    pub fn marker_key(&self) -> Option<&str> {
        self.marker_key.as_deref()
    }

    /// Resolves the landing step for `entity`.
    ///
    /// `fields` must already be seeded from the entity; the marker walk
    /// routes branches with it.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Configuration`] if a rule targets a step the
    /// graph does not contain, or routing fails.
    pub fn resolve(
        &self,
        entity: &Entity,
        graph: &StepGraph<S>,
        fields: &FieldStore,
    ) -> Result<ResumeDecision<S>> {
        if let Some(completed) = self
            .marker_key
            .as_deref()
            .and_then(|key| entity.completed_steps(key))
        {
            let mut current = graph.first_step();
            while completed.iter().any(|name| name == current.name()) {
                match graph.next_step_of(current, fields)? {
                    Some(next) => current = next,
                    None => break,
                }
            }
            debug!(step = current.name(), "resumed from completion marker");
            return Ok(ResumeDecision {
                step: current,
                basis: ResumeBasis::CompletionMarker,
            });
        }

        let mut landing = graph.first_step();
        for rule in &self.rules {
            if !graph.has_step(rule.target) {
                return Err(StepwiseError::Configuration(format!(
                    "resume rule targets unknown step `{}`",
                    rule.target.name()
                )));
            }
            if (rule.satisfied)(entity) {
                landing = rule.target;
            } else if rule.required {
                break;
            }
        }
        debug!(step = landing.name(), "resumed from field presence");
        Ok(ResumeDecision {
            step: landing,
            basis: ResumeBasis::Presence,
        })
    }
}

impl<S: StepKey> Default for ResumeResolver<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StepKey> fmt::Debug for ResumeResolver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let targets: Vec<&str> = self.rules.iter().map(|r| r.target.name()).collect();
        f.debug_struct("ResumeResolver")
            .field("rules", &targets)
            .field("marker_key", &self.marker_key)
            .finish()
    }
}
