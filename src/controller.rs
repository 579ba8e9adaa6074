//! Wizard session orchestration.
//!
//! [`WizardController`] owns one [`WizardSession`] at a time and drives it
//! through its [`StepGraph`]: advancing (persisting the step first when it
//! has an adapter), retreating along the traversed path, resuming from a
//! loaded entity, staging attachments, and routing exit attempts through
//! the [`NavigationGuard`].
//!
//! # Concurrency
//!
//! The controller is a cheap `Clone` handle. Session state lives behind a
//! single mutex that is never held across an `.await`. At most one
//! [`advance`](WizardController::advance) runs at a time; a second call
//! while one is in flight returns [`AdvanceOutcome::Ignored`]. Tearing a
//! session down bumps a generation counter, and an advance that completes
//! for an older generation is dropped as [`AdvanceOutcome::Discarded`].

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::ErrorKind;
use crate::guard::{ConfirmPrompt, NavigationGuard, NavigationOutcome, Router, UnloadDecision};
use crate::persistence::PersistRequest;
use crate::resume::{ResumeDecision, ResumeResolver};
use crate::{
    AttachmentId, AttachmentStager, Entity, EntityId, FieldStore, FileUploader, FlowProgress,
    MemoryUploader, PickedFile, Result, StagedAttachment, StepGraph, StepKey, StepwiseConfig,
    StepwiseError, WizardEvent,
};

/// The state of one pass through a flow.
///
/// Created on flow entry; torn down on discard, confirmed exit, or
/// successful final submission.
#[derive(Debug, Clone, PartialEq)]
pub struct WizardSession<S: StepKey> {
    /// The flow identifier.
    pub flow_id: String,
    /// The active step.
    pub current_step: S,
    /// Backend entity id, once a persisting step created it.
    pub entity_id: Option<EntityId>,
    /// Draft values for the whole session.
    pub fields: FieldStore,
    /// True if fields changed since the last successful persist.
    ///
    /// For display only. Leaving the flow is decided by the
    /// [`NavigationGuard`], which stays armed from the first edit until the
    /// flow is completed or the exit is confirmed.
    pub dirty: bool,
    /// Steps completed in this session.
    pub completed_steps: BTreeSet<S>,
    /// Steps actually traversed before the active one, oldest first.
    pub history: Vec<S>,
    /// Set by the advance that created the entity; makes the next resume
    /// request a no-op.
    pub fresh_entity: bool,
    /// The most recent recoverable failure, cleared on success.
    pub last_error: Option<StepFailure<S>>,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

impl<S: StepKey> WizardSession<S> {
    fn new(flow_id: &str, first_step: S, fields: FieldStore) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            current_step: first_step,
            entity_id: None,
            fields,
            dirty: false,
            completed_steps: BTreeSet::new(),
            history: Vec::new(),
            fresh_entity: false,
            last_error: None,
            started_at: Utc::now(),
        }
    }
}

/// A recoverable failure recorded on the session for inline display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure<S> {
    /// The step that could not be completed.
    pub step: S,
    /// Failure classification.
    pub kind: ErrorKind,
    /// The offending field, for validation failures.
    pub field: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl<S: StepKey> StepFailure<S> {
    fn from_error(step: S, error: &StepwiseError) -> Self {
        let field = match error {
            StepwiseError::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };
        Self {
            step,
            kind: error.kind(),
            field,
            message: error.to_string(),
        }
    }
}

/// Result of [`WizardController::advance`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome<S> {
    /// Another advance was already in flight; nothing happened.
    Ignored,
    /// The session moved to the next step.
    Advanced {
        /// The completed step.
        from: S,
        /// The new active step.
        to: S,
    },
    /// A recoverable failure kept the session on its step.
    Rejected(StepFailure<S>),
    /// The terminal step was submitted; the session is torn down.
    Completed {
        /// The submitted entity, if the terminal step persists.
        entity: Option<Entity>,
    },
    /// The session was torn down while the request was in flight; the
    /// result was dropped.
    Discarded,
}

/// Result of [`WizardController::jump_to_resumed_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome<S> {
    /// The session was positioned from the entity.
    Resumed(ResumeDecision<S>),
    /// The entity was created by this session's last advance; the request
    /// was ignored and the bypass consumed.
    Bypassed,
}

/// How one draft field is seeded from, and merged back from, the entity.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    /// Draft field key.
    pub field: String,
    /// Entity data key.
    pub entity_key: String,
    /// Seed value when the entity lacks the key or holds null. Every mapped
    /// field is seeded on resume, so this is `null` unless set.
    pub default: JsonValue,
}

impl FieldMapping {
    /// Maps `field` to the entity key of the same name.
    pub fn new(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::renamed(field.clone(), field)
    }

    /// Maps `field` to `entity_key`.
    pub fn renamed(field: impl Into<String>, entity_key: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            entity_key: entity_key.into(),
            default: JsonValue::Null,
        }
    }

    /// Seeds `default` when the entity has no value.
    pub fn or_default(mut self, default: JsonValue) -> Self {
        self.default = default;
        self
    }

    fn read(&self, entity: &Entity) -> Option<JsonValue> {
        entity.get(&self.entity_key).filter(|v| !v.is_null()).cloned()
    }
}

/// Clears the in-flight flag when an advance ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Re-arms the guard if a terminal submission is dropped before it settles.
struct Submission<'a>(&'a NavigationGuard);

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        self.0.abandon_submission();
    }
}

struct Inner<S: StepKey> {
    graph: Arc<StepGraph<S>>,
    stager: Arc<AttachmentStager>,
    resolver: ResumeResolver<S>,
    mappings: Vec<FieldMapping>,
    selection_sets: Vec<String>,
    guard: NavigationGuard,
    session: Mutex<Option<WizardSession<S>>>,
    in_flight: AtomicBool,
    generation: AtomicU64,
    event_tx: broadcast::Sender<WizardEvent>,
}

/// Drives sessions through one flow.
///
/// # Example
///
/// ```
/// use stepwise::{AdvanceOutcome, StepGraph, StepKey, WizardController};
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// enum Step { Intro, Done }
/// impl StepKey for Step {
///     fn name(&self) -> &'static str {
///         match self { Step::Intro => "intro", Step::Done => "done" }
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> stepwise::Result<()> {
/// let graph = StepGraph::builder("demo")
///     .fixed(Step::Intro, Step::Done)
///     .terminal(Step::Done)
///     .build()?;
/// let controller = WizardController::builder(graph).build();
///
/// let outcome = controller.advance().await?;
/// assert_eq!(outcome, AdvanceOutcome::Advanced { from: Step::Intro, to: Step::Done });
/// # Ok(())
/// # }
/// ```
pub struct WizardController<S: StepKey> {
    inner: Arc<Inner<S>>,
}

impl<S: StepKey> Clone for WizardController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StepKey> std::fmt::Debug for WizardController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WizardController")
            .field("flow_id", &self.inner.graph.flow_id())
            .field("in_flight", &self.is_in_flight())
            .field("guard", &self.inner.guard.state())
            .finish_non_exhaustive()
    }
}

impl<S: StepKey> WizardController<S> {
    /// Starts configuring a controller for `graph`.
    pub fn builder(graph: StepGraph<S>) -> ControllerBuilder<S> {
        ControllerBuilder::new(graph)
    }

    /// Returns a receiver that will receive all events broadcast by this
    /// controller.
    ///
    /// Events are sent to all active receivers. If a receiver falls behind,
    /// it will miss events (lagged).
    pub fn subscribe(&self) -> broadcast::Receiver<WizardEvent> {
        self.inner.event_tx.subscribe()
    }

    fn emit(&self, event: WizardEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn flow_id(&self) -> String {
        self.inner.graph.flow_id().to_string()
    }

    fn lock(&self) -> MutexGuard<'_, Option<WizardSession<S>>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut WizardSession<S>) -> R) -> Result<R> {
        self.lock().as_mut().map(f).ok_or(StepwiseError::SessionClosed)
    }

    /// Runs `f` only if the session still belongs to `generation`.
    fn with_generation<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut WizardSession<S>) -> R,
    ) -> Option<R> {
        let mut session = self.lock();
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        session.as_mut().map(f)
    }

    fn fresh_fields(&self) -> FieldStore {
        let mut fields = FieldStore::new();
        for key in &self.inner.selection_sets {
            fields.declare_selection_set(key.clone());
        }
        fields
    }

    /// Begins a fresh session, replacing any existing one.
    pub fn start(&self) {
        self.inner.stager.clear();
        self.inner.guard.reset();
        let session = WizardSession::new(
            self.inner.graph.flow_id(),
            self.inner.graph.first_step(),
            self.fresh_fields(),
        );
        let mut current = self.lock();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *current = Some(session);
        drop(current);
        debug!(flow = %self.inner.graph.flow_id(), "session started");
    }

    fn teardown(&self) -> Option<WizardSession<S>> {
        let session = {
            let mut current = self.lock();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            current.take()
        };
        self.inner.stager.clear();
        session
    }

    /// Discards the session without submitting.
    ///
    /// Any advance still in flight will be dropped when it returns.
    pub fn discard(&self) {
        if self.teardown().is_some() {
            self.inner.guard.reset();
            info!(flow = %self.inner.graph.flow_id(), "session discarded");
            self.emit(WizardEvent::SessionDiscarded {
                flow_id: self.flow_id(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------

    /// Sets a draft field.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::SessionClosed`] if no session is active.
    pub fn update_field(&self, key: impl Into<String>, value: JsonValue) -> Result<()> {
        self.update_with(key, move |_| value)
    }

    /// Sets a draft field from its value at the moment of mutation.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::SessionClosed`] if no session is active.
    pub fn update_with<F>(&self, key: impl Into<String>, f: F) -> Result<()>
    where
        F: FnOnce(Option<&JsonValue>) -> JsonValue,
    {
        self.with_session(|s| {
            s.fields.update_with(key, f);
            s.dirty = true;
        })?;
        self.inner.guard.on_field_mutation();
        Ok(())
    }

    /// Returns a snapshot of the draft fields.
    pub fn fields(&self) -> Result<FieldStore> {
        self.with_session(|s| s.fields.clone())
    }

    /// Returns a snapshot of the whole session, if one is active.
    pub fn session(&self) -> Option<WizardSession<S>> {
        self.lock().clone()
    }

    /// Returns true if a session is active.
    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Returns the active step.
    pub fn current_step(&self) -> Result<S> {
        self.with_session(|s| s.current_step)
    }

    /// Returns the entity id, once assigned.
    pub fn entity_id(&self) -> Result<Option<EntityId>> {
        self.with_session(|s| s.entity_id.clone())
    }

    /// Returns the steps completed so far.
    pub fn completed_steps(&self) -> Result<Vec<S>> {
        self.with_session(|s| s.completed_steps.iter().copied().collect())
    }

    /// Returns the traversed path before the active step.
    pub fn history(&self) -> Result<Vec<S>> {
        self.with_session(|s| s.history.clone())
    }

    /// Returns the last recoverable failure.
    pub fn last_error(&self) -> Result<Option<StepFailure<S>>> {
        self.with_session(|s| s.last_error.clone())
    }

    /// Returns true if the session has edits not yet persisted.
    ///
    /// See [`WizardSession::dirty`]; the guard does not consult this.
    pub fn is_dirty(&self) -> bool {
        self.lock().as_ref().is_some_and(|s| s.dirty)
    }

    /// Returns true while an advance is in flight.
    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the session's progress through the flow.
    pub fn progress(&self) -> Result<FlowProgress> {
        self.with_session(|s| {
            FlowProgress::compute(&self.inner.graph, &s.history, s.current_step, &s.fields)
        })
    }

    /// Returns the flow's step graph.
    pub fn graph(&self) -> &StepGraph<S> {
        &self.inner.graph
    }

    /// Returns the navigation guard.
    pub fn guard(&self) -> &NavigationGuard {
        &self.inner.guard
    }

    /// Returns the attachment stager.
    pub fn stager(&self) -> &AttachmentStager {
        &self.inner.stager
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    /// Stages a picked file and appends its reference to `field`.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::UnsupportedMedia`] if the stager rejects the
    /// file, in which case `field` is untouched.
    pub fn stage_attachment(
        &self,
        field: impl Into<String>,
        file: PickedFile,
    ) -> Result<StagedAttachment> {
        let field = field.into();
        if !self.is_active() {
            return Err(StepwiseError::SessionClosed);
        }
        let staged = self.inner.stager.stage(file)?;
        self.with_session(|s| {
            s.fields
                .add_to_selection(field.clone(), staged.id.to_field_value());
            s.dirty = true;
        })?;
        self.inner.guard.on_field_mutation();
        self.emit(WizardEvent::AttachmentStaged {
            flow_id: self.flow_id(),
            field,
            attachment_id: staged.id.to_string(),
        });
        Ok(staged)
    }

    /// Removes an attachment from `field` and drops it.
    ///
    /// Both the staging token and, once committed, the uploaded URL are
    /// removed, so this also works after the owning step was persisted.
    pub fn remove_attachment(&self, field: impl Into<String>, id: AttachmentId) -> Result<()> {
        let field = field.into();
        let token = id.to_field_value();
        let committed = self
            .inner
            .stager
            .get(id)
            .and_then(|staged| staged.committed_url().map(JsonValue::from));
        self.with_session(|s| {
            s.fields.remove_from_selection(field.clone(), &token);
            if let Some(url) = &committed {
                s.fields.remove_from_selection(field, url);
            }
            s.dirty = true;
        })?;
        self.inner.stager.discard(id);
        self.inner.guard.on_field_mutation();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Navigation within the flow
    // ------------------------------------------------------------------

    /// Completes the active step and moves to the next one.
    ///
    /// Persists the step first when it has an adapter. Recoverable
    /// failures keep the session on its step and come back as
    /// [`AdvanceOutcome::Rejected`].
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::SessionClosed`] if no session is active and
    /// [`StepwiseError::Configuration`] for broken routing.
    pub async fn advance(&self) -> Result<AdvanceOutcome<S>> {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("advance already in flight");
            return Ok(AdvanceOutcome::Ignored);
        }
        let _flight = InFlight(&self.inner.in_flight);

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let (step, snapshot, entity_id, completed) = self.with_session(|s| {
            (
                s.current_step,
                s.fields.clone(),
                s.entity_id.clone(),
                s.completed_steps
                    .iter()
                    .map(|step| step.name())
                    .collect::<Vec<_>>(),
            )
        })?;

        let span = info_span!("advance", flow = %self.inner.graph.flow_id(), step = step.name());
        self.advance_from(step, snapshot, entity_id, completed, generation)
            .instrument(span)
            .await
    }

    async fn advance_from(
        &self,
        step: S,
        snapshot: FieldStore,
        entity_id: Option<EntityId>,
        completed: Vec<&'static str>,
        generation: u64,
    ) -> Result<AdvanceOutcome<S>> {
        let graph = &self.inner.graph;
        let terminal = graph.is_terminal(step);
        let _submission = terminal.then(|| {
            self.inner.guard.begin_submission();
            Submission(&self.inner.guard)
        });

        let persisted = match graph.adapter_for(step) {
            Some(adapter) => {
                let request = PersistRequest {
                    flow_id: graph.flow_id(),
                    step: step.name(),
                    fields: &snapshot,
                    entity_id: entity_id.as_ref(),
                    completed_steps: &completed,
                    stager: &self.inner.stager,
                };
                Some(adapter.persist(request).await)
            }
            None => None,
        };

        if self.inner.generation.load(Ordering::SeqCst) != generation {
            info!("session closed while persisting, dropping result");
            return Ok(AdvanceOutcome::Discarded);
        }

        let entity = match persisted {
            Some(Err(error)) => return self.reject(step, terminal, error),
            Some(Ok(entity)) => Some(entity),
            None => None,
        };

        if terminal {
            return Ok(self.complete(entity, entity_id));
        }

        let next = self.with_generation(generation, |s| -> Result<S> {
            s.fresh_entity = false;
            if let Some(entity) = &entity {
                let merged = s
                    .fields
                    .merge_from_server(self.merge_values(entity), &snapshot);
                debug!(merged, "merged entity fields");
                if s.entity_id.is_none() {
                    s.entity_id = Some(entity.id.clone());
                    s.fresh_entity = true;
                }
                s.dirty = s.fields.revision() != snapshot.revision();
            }
            s.completed_steps.insert(step);
            s.last_error = None;

            let next = graph.next_step_of(step, &s.fields)?.ok_or_else(|| {
                StepwiseError::Configuration(format!("step `{}` has no successor", step.name()))
            })?;
            s.history.push(step);
            s.current_step = next;
            Ok(next)
        });
        let next = match next {
            Some(next) => next?,
            None => {
                info!("session replaced while persisting, dropping result");
                return Ok(AdvanceOutcome::Discarded);
            }
        };

        info!(to = next.name(), "advanced");
        self.emit(WizardEvent::StepAdvanced {
            flow_id: self.flow_id(),
            from: step.name().to_string(),
            to: next.name().to_string(),
        });
        Ok(AdvanceOutcome::Advanced {
            from: step,
            to: next,
        })
    }

    fn reject(&self, step: S, terminal: bool, error: StepwiseError) -> Result<AdvanceOutcome<S>> {
        if terminal {
            self.inner.guard.submission_failed();
        }
        if !error.is_recoverable() {
            return Err(error);
        }

        warn!(error = %error, "step rejected");
        let failure = StepFailure::from_error(step, &error);
        self.with_session(|s| s.last_error = Some(failure.clone()))?;
        self.emit(WizardEvent::StepRejected {
            flow_id: self.flow_id(),
            step: step.name().to_string(),
            error: failure.message.clone(),
        });
        Ok(AdvanceOutcome::Rejected(failure))
    }

    fn complete(&self, entity: Option<Entity>, entity_id: Option<EntityId>) -> AdvanceOutcome<S> {
        let entity_id = entity.as_ref().map(|e| e.id.clone()).or(entity_id);
        self.teardown();
        self.inner.guard.complete();
        info!(entity = ?entity_id, "flow completed");
        self.emit(WizardEvent::FlowCompleted {
            flow_id: self.flow_id(),
            entity_id: entity_id.map(|id| id.to_string()).unwrap_or_default(),
        });
        AdvanceOutcome::Completed { entity }
    }

    /// Moves back along the traversed path. Never calls the backend and
    /// never clears fields.
    ///
    /// Returns the new active step, or `None` at the first step or while
    /// an advance is in flight.
    pub fn retreat(&self) -> Result<Option<S>> {
        if self.is_in_flight() {
            debug!("retreat ignored while advancing");
            return Ok(None);
        }
        let moved = self.with_session(|s| {
            s.fresh_entity = false;
            s.history.pop().map(|previous| {
                let from = s.current_step;
                s.current_step = previous;
                (from, previous)
            })
        })?;

        Ok(moved.map(|(from, to)| {
            info!(from = from.name(), to = to.name(), "retreated");
            self.emit(WizardEvent::StepRetreated {
                flow_id: self.flow_id(),
                from: from.name().to_string(),
                to: to.name().to_string(),
            });
            to
        }))
    }

    /// Positions the session from a previously persisted entity.
    ///
    /// Seeds the fields from the entity, resolves the landing step, and
    /// rebuilds the traversed path to it. If the entity was created by this
    /// session's last advance, the request is ignored once.
    ///
    /// An advance still in flight when the session is repositioned comes
    /// back as [`AdvanceOutcome::Discarded`].
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::SessionClosed`] if no session is active and
    /// [`StepwiseError::Configuration`] for broken resume rules.
    pub fn jump_to_resumed_step(&self, entity: &Entity) -> Result<ResumeOutcome<S>> {
        let graph = &self.inner.graph;
        let outcome = self.with_session(|s| -> Result<ResumeOutcome<S>> {
            if s.fresh_entity {
                s.fresh_entity = false;
                return Ok(ResumeOutcome::Bypassed);
            }

            let mut fields = s.fields.clone();
            fields.reseed(self.seed_values(entity));
            let decision = self.inner.resolver.resolve(entity, graph, &fields)?;
            let mut path = graph
                .path_to(decision.step, &fields)
                .unwrap_or_else(|| vec![graph.first_step(), decision.step]);
            path.dedup();
            path.pop();

            if self.inner.in_flight.load(Ordering::SeqCst) {
                debug!("resume supersedes the advance in flight");
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            s.fields = fields;
            s.completed_steps = path.iter().copied().collect();
            s.history = path;
            s.current_step = decision.step;
            s.entity_id = Some(entity.id.clone());
            s.dirty = false;
            s.last_error = None;
            Ok(ResumeOutcome::Resumed(decision))
        })??;

        match outcome {
            ResumeOutcome::Bypassed => {
                debug!(entity = %entity.id, "resume bypassed for fresh entity");
                self.emit(WizardEvent::ResumeBypassed {
                    flow_id: self.flow_id(),
                    entity_id: entity.id.to_string(),
                });
            }
            ResumeOutcome::Resumed(decision) => {
                info!(entity = %entity.id, step = decision.step.name(), "resumed");
                self.emit(WizardEvent::Resumed {
                    flow_id: self.flow_id(),
                    entity_id: entity.id.to_string(),
                    step: decision.step.name().to_string(),
                });
            }
        }
        Ok(outcome)
    }

    fn seed_values(&self, entity: &Entity) -> Vec<(String, JsonValue)> {
        self.inner
            .mappings
            .iter()
            .map(|m| {
                let value = m.read(entity).unwrap_or_else(|| m.default.clone());
                (m.field.clone(), value)
            })
            .collect()
    }

    fn merge_values(&self, entity: &Entity) -> Vec<(String, JsonValue)> {
        self.inner
            .mappings
            .iter()
            .filter_map(|m| m.read(entity).map(|value| (m.field.clone(), value)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Leaving the flow
    // ------------------------------------------------------------------

    /// Navigates out of the flow through the guard.
    ///
    /// A confirmed exit tears the session down.
    ///
    /// # Errors
    ///
    /// Propagates router failures.
    pub async fn navigate(
        &self,
        router: &dyn Router,
        prompt: &dyn ConfirmPrompt,
        target: &str,
    ) -> Result<NavigationOutcome> {
        let outcome = self.inner.guard.navigate(router, prompt, target).await?;
        match outcome {
            NavigationOutcome::Cancelled => {
                self.emit(WizardEvent::NavigationBlocked {
                    flow_id: self.flow_id(),
                    target: target.to_string(),
                });
            }
            NavigationOutcome::Confirmed => {
                self.teardown();
                info!(target, "left flow with unsaved changes");
                self.emit(WizardEvent::NavigationConfirmed {
                    flow_id: self.flow_id(),
                    target: target.to_string(),
                });
            }
            NavigationOutcome::Proceeded => {}
        }
        Ok(outcome)
    }

    /// Answers the host's native unload hook.
    pub fn before_unload(&self) -> UnloadDecision {
        self.inner.guard.before_unload()
    }
}

/// Builder for [`WizardController`].
pub struct ControllerBuilder<S: StepKey> {
    graph: StepGraph<S>,
    config: StepwiseConfig,
    uploader: Option<Arc<dyn FileUploader>>,
    resolver: ResumeResolver<S>,
    mappings: Vec<FieldMapping>,
    selection_sets: Vec<String>,
}

impl<S: StepKey> ControllerBuilder<S> {
    fn new(graph: StepGraph<S>) -> Self {
        Self {
            graph,
            config: StepwiseConfig::default(),
            uploader: None,
            resolver: ResumeResolver::new(),
            mappings: Vec::new(),
            selection_sets: Vec::new(),
        }
    }

    /// Uses `config` for attachments, events, and the guard.
    pub fn config(mut self, config: StepwiseConfig) -> Self {
        self.config = config;
        self
    }

    /// Uploads attachments through `uploader` (default: in-memory).
    pub fn uploader(mut self, uploader: Arc<dyn FileUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Resolves resume positions with `resolver`.
    pub fn resume_with(mut self, resolver: ResumeResolver<S>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Adds a field mapping.
    pub fn map_field(mut self, mapping: FieldMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Adds field mappings.
    pub fn map_fields(mut self, mappings: impl IntoIterator<Item = FieldMapping>) -> Self {
        self.mappings.extend(mappings);
        self
    }

    /// Declares `key` as a selection set in every session's fields.
    pub fn selection_set(mut self, key: impl Into<String>) -> Self {
        self.selection_sets.push(key.into());
        self
    }

    /// Builds the controller and starts its first session.
    pub fn build(self) -> WizardController<S> {
        let uploader = self
            .uploader
            .unwrap_or_else(|| Arc::new(MemoryUploader::default()) as Arc<dyn FileUploader>);
        let resolver = if self.resolver.marker_key().is_none() {
            self.resolver
                .with_completion_marker(self.config.completion_marker_key.clone())
        } else {
            self.resolver
        };
        let (event_tx, _) = broadcast::channel(self.config.event_channel_capacity.max(1));

        let controller = WizardController {
            inner: Arc::new(Inner {
                graph: Arc::new(self.graph),
                stager: Arc::new(AttachmentStager::new(self.config.attachments, uploader)),
                resolver,
                mappings: self.mappings,
                selection_sets: self.selection_sets,
                guard: NavigationGuard::new(self.config.confirm_message),
                session: Mutex::new(None),
                in_flight: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                event_tx,
            }),
        };
        controller.start();
        controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardState;
    use crate::persistence::EntityBackend;
    use crate::{MemoryEntityBackend, PersistenceAdapter, ProjectingAdapter};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// An adapter whose request never settles.
    #[derive(Debug)]
    struct StalledAdapter;

    #[async_trait]
    impl PersistenceAdapter for StalledAdapter {
        async fn persist(&self, _request: PersistRequest<'_>) -> Result<Entity> {
            std::future::pending::<Result<Entity>>().await
        }
    }

    fn entity(id: &str, data: JsonValue) -> Entity {
        Entity::new(EntityId::new(id), data.as_object().cloned().unwrap())
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum T {
        A,
        B,
        C,
        D,
    }

    impl StepKey for T {
        fn name(&self) -> &'static str {
            match self {
                T::A => "a",
                T::B => "b",
                T::C => "c",
                T::D => "d",
            }
        }
    }

    fn controller(backend: &Arc<MemoryEntityBackend>) -> WizardController<T> {
        let graph = StepGraph::builder("abcd")
            .fixed(T::A, T::B)
            .branch(T::B, [T::C, T::D], |f: &FieldStore| {
                if f.flag("x") {
                    T::C
                } else {
                    T::D
                }
            })
            .fixed(T::C, T::D)
            .terminal(T::D)
            .persist(
                T::A,
                ProjectingAdapter::new("things", backend.clone())
                    .require("name")
                    .copy("name")
                    .mark_completion("wizard_completed_steps"),
            )
            .persist(
                T::B,
                ProjectingAdapter::new("things", backend.clone())
                    .copy("x")
                    .mark_completion("wizard_completed_steps"),
            )
            .persist(
                T::D,
                ProjectingAdapter::new("things", backend.clone())
                    .with_static("status", json!("PUBLISHED")),
            )
            .build()
            .unwrap();
        WizardController::builder(graph)
            .map_field(FieldMapping::new("name"))
            .map_field(FieldMapping::new("x").or_default(json!(false)))
            .build()
    }

    #[tokio::test]
    async fn test_first_persist_creates_entity() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();

        let outcome = c.advance().await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Advanced { from: T::A, to: T::B });
        assert!(c.entity_id().unwrap().is_some());
        assert_eq!(backend.create_count(), 1);
        assert!(!c.is_dirty());
        assert_eq!(c.completed_steps().unwrap(), vec![T::A]);
    }

    #[tokio::test]
    async fn test_validation_failure_stays_on_step() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);

        let outcome = c.advance().await.unwrap();
        match outcome {
            AdvanceOutcome::Rejected(failure) => {
                assert_eq!(failure.step, T::A);
                assert_eq!(failure.kind, ErrorKind::Validation);
                assert_eq!(failure.field.as_deref(), Some("name"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(c.current_step().unwrap(), T::A);
        assert!(c.last_error().unwrap().is_some());

        c.update_field("name", json!("Widget")).unwrap();
        c.advance().await.unwrap();
        assert!(c.last_error().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_network_failure_is_retryable() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();
        backend.fail_next(1);

        assert!(matches!(
            c.advance().await.unwrap(),
            AdvanceOutcome::Rejected(StepFailure {
                kind: ErrorKind::Network,
                ..
            })
        ));
        assert_eq!(c.current_step().unwrap(), T::A);
        assert!(matches!(
            c.advance().await.unwrap(),
            AdvanceOutcome::Advanced { .. }
        ));
    }

    #[tokio::test]
    async fn test_second_advance_in_flight_is_ignored() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();

        let (first, second) = tokio::join!(c.advance(), c.advance());
        assert!(matches!(first.unwrap(), AdvanceOutcome::Advanced { .. }));
        assert_eq!(second.unwrap(), AdvanceOutcome::Ignored);
        assert_eq!(backend.create_count(), 1);
        assert!(!c.is_in_flight());
    }

    #[tokio::test]
    async fn test_edit_during_flight_survives_merge() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();

        let edit = async {
            c.update_field("name", json!("Widget Pro")).unwrap();
        };
        let (outcome, ()) = tokio::join!(c.advance(), edit);
        assert!(matches!(outcome.unwrap(), AdvanceOutcome::Advanced { .. }));
        assert_eq!(c.fields().unwrap().get("name"), Some(&json!("Widget Pro")));
        assert!(c.is_dirty());
    }

    #[tokio::test]
    async fn test_discard_during_flight_drops_result() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();

        let discard = async {
            c.discard();
        };
        let (outcome, ()) = tokio::join!(c.advance(), discard);
        assert_eq!(outcome.unwrap(), AdvanceOutcome::Discarded);
        assert!(!c.is_active());
        assert!(matches!(c.current_step(), Err(StepwiseError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_branch_skip_and_retreat() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();
        c.update_field("x", json!(false)).unwrap();

        c.advance().await.unwrap();
        let outcome = c.advance().await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Advanced { from: T::B, to: T::D });
        assert_eq!(c.retreat().unwrap(), Some(T::B));
        assert_eq!(c.retreat().unwrap(), Some(T::A));
        assert_eq!(c.retreat().unwrap(), None);
        assert_eq!(c.fields().unwrap().get("name"), Some(&json!("Widget")));
    }

    #[tokio::test]
    async fn test_terminal_success_completes_and_unguards() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        let mut events = c.subscribe();
        c.update_field("name", json!("Widget")).unwrap();
        c.advance().await.unwrap();
        c.advance().await.unwrap();

        match c.advance().await.unwrap() {
            AdvanceOutcome::Completed { entity } => {
                assert_eq!(entity.unwrap().get("status"), Some(&json!("PUBLISHED")));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(!c.is_active());
        assert_eq!(
            c.guard().state(),
            GuardState::Unguarded(crate::guard::UnguardReason::Completed)
        );

        let mut saw_completion = false;
        while let Ok(event) = events.try_recv() {
            saw_completion |= matches!(event, WizardEvent::FlowCompleted { .. });
        }
        assert!(saw_completion);
    }

    #[tokio::test]
    async fn test_failed_terminal_submission_rearms_guard() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();
        c.advance().await.unwrap();
        c.advance().await.unwrap();

        backend.fail_next(1);
        assert!(matches!(
            c.advance().await.unwrap(),
            AdvanceOutcome::Rejected(_)
        ));
        assert!(c.guard().is_guarded());
        assert_eq!(c.current_step().unwrap(), T::D);
    }

    #[tokio::test]
    async fn test_resume_bypassed_once_after_create() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();
        c.advance().await.unwrap();

        let id = c.entity_id().unwrap().unwrap();
        let entity = backend.fetch("things", &id).await.unwrap().unwrap();
        assert_eq!(
            c.jump_to_resumed_step(&entity).unwrap(),
            ResumeOutcome::Bypassed
        );
        assert_eq!(c.current_step().unwrap(), T::B);

        // The bypass covers a single transition.
        assert!(matches!(
            c.jump_to_resumed_step(&entity).unwrap(),
            ResumeOutcome::Resumed(_)
        ));
        assert_eq!(c.current_step().unwrap(), T::B);
    }

    #[tokio::test]
    async fn test_resume_seeds_fields_and_history() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        let data = json!({
            "name": "Gadget",
            "x": null,
            "wizard_completed_steps": ["a", "b"]
        });
        let entity = Entity::new(
            EntityId::new("t-7"),
            data.as_object().cloned().unwrap(),
        );

        let outcome = c.jump_to_resumed_step(&entity).unwrap();
        assert!(matches!(outcome, ResumeOutcome::Resumed(d) if d.step == T::D));
        assert_eq!(c.history().unwrap(), vec![T::A, T::B]);
        assert_eq!(c.entity_id().unwrap(), Some(EntityId::new("t-7")));
        let fields = c.fields().unwrap();
        assert_eq!(fields.get("name"), Some(&json!("Gadget")));
        assert_eq!(fields.get("x"), Some(&json!(false)));
        assert_eq!(c.retreat().unwrap(), Some(T::B));
    }

    #[tokio::test]
    async fn test_progress_reflects_route() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        let progress = c.progress().unwrap();
        assert_eq!(progress.current().unwrap().name, "a");
        assert_eq!(progress.skipped_steps(), vec!["c"]);
    }

    #[test]
    fn test_update_after_discard_is_rejected() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.discard();
        assert!(matches!(
            c.update_field("name", json!("late")),
            Err(StepwiseError::SessionClosed)
        ));
        c.start();
        assert!(c.update_field("name", json!("fresh")).is_ok());
        assert!(c.guard().is_guarded());
    }

    #[tokio::test]
    async fn test_resume_during_flight_discards_advance() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();
        let saved = entity(
            "t-9",
            json!({"name": "Gadget", "wizard_completed_steps": ["a", "b"]}),
        );

        let resume = async { c.jump_to_resumed_step(&saved).unwrap() };
        let (outcome, resumed) = tokio::join!(c.advance(), resume);

        assert!(matches!(resumed, ResumeOutcome::Resumed(d) if d.step == T::D));
        assert_eq!(outcome.unwrap(), AdvanceOutcome::Discarded);
        assert_eq!(c.current_step().unwrap(), T::D);
        assert_eq!(c.history().unwrap(), vec![T::A, T::B]);
        assert_eq!(c.entity_id().unwrap(), Some(EntityId::new("t-9")));
        assert_eq!(c.fields().unwrap().get("name"), Some(&json!("Gadget")));
        assert!(!c.is_in_flight());
    }

    #[tokio::test]
    async fn test_restart_during_flight_discards_advance() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();

        let restart = async { c.start() };
        let (outcome, ()) = tokio::join!(c.advance(), restart);

        assert_eq!(outcome.unwrap(), AdvanceOutcome::Discarded);
        assert_eq!(c.current_step().unwrap(), T::A);
        assert!(c.history().unwrap().is_empty());
        assert_eq!(c.entity_id().unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_submission_rearms_guard() {
        let graph = StepGraph::builder("stalled")
            .fixed(T::A, T::B)
            .terminal(T::B)
            .persist(T::B, StalledAdapter)
            .build()
            .unwrap();
        let c = WizardController::builder(graph).build();
        c.update_field("name", json!("Widget")).unwrap();
        c.advance().await.unwrap();
        assert_eq!(c.current_step().unwrap(), T::B);

        let timed_out = tokio::time::timeout(Duration::from_millis(20), c.advance()).await;
        assert!(timed_out.is_err());

        assert!(c.is_active());
        assert!(!c.is_in_flight());
        assert_eq!(c.guard().state(), GuardState::Guarded);
        assert!(matches!(c.before_unload(), UnloadDecision::Prompt { .. }));
    }

    #[tokio::test]
    async fn test_resume_seeds_every_mapped_field() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.jump_to_resumed_step(&entity("t-3", json!({"x": true}))).unwrap();

        let fields = c.fields().unwrap();
        assert_eq!(fields.get("name"), Some(&JsonValue::Null));
        assert_eq!(fields.get("x"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_remove_committed_attachment_after_retreat() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let graph = StepGraph::builder("files")
            .fixed(T::A, T::B)
            .terminal(T::B)
            .persist(
                T::A,
                ProjectingAdapter::new("things", backend.clone()).attachments("files"),
            )
            .build()
            .unwrap();
        let c = WizardController::builder(graph)
            .map_field(FieldMapping::new("files").or_default(json!([])))
            .selection_set("files")
            .build();

        let staged = c
            .stage_attachment("files", PickedFile::new("plan.png", "image/png", vec![1, 2]))
            .unwrap();
        c.advance().await.unwrap();
        let url = staged.committed_url().unwrap().to_string();
        assert_eq!(c.fields().unwrap().list("files"), &[json!(url)]);

        assert_eq!(c.retreat().unwrap(), Some(T::A));
        c.remove_attachment("files", staged.id).unwrap();
        assert!(c.fields().unwrap().list("files").is_empty());
        assert!(c.stager().get(staged.id).is_none());
    }

    #[tokio::test]
    async fn test_guard_stays_armed_after_persist() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(&backend);
        c.update_field("name", json!("Widget")).unwrap();
        c.advance().await.unwrap();

        assert!(!c.is_dirty());
        assert!(c.guard().is_guarded());
        assert!(matches!(c.before_unload(), UnloadDecision::Prompt { .. }));
    }
}
