//! Navigation guard for unsaved work.
//!
//! [`NavigationGuard`] is a two-state machine: `Guarded` while the session
//! holds edits the user has not confirmed leaving, `Unguarded` otherwise.
//! In-app navigation ([`NavigationGuard::navigate`]) and the host's unload
//! hook ([`NavigationGuard::before_unload`]) read the same state.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::Result;

/// Why the guard is currently not intercepting navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnguardReason {
    /// No edits since the session started.
    Clean,
    /// The user confirmed leaving.
    Confirmed,
    /// The terminal step is being submitted.
    Submitting,
    /// The flow was submitted successfully.
    Completed,
}

/// Guard state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Navigation away must be confirmed.
    Guarded,
    /// Navigation passes through.
    Unguarded(UnguardReason),
}

/// Performs the real in-app navigation.
#[async_trait]
pub trait Router: Send + Sync {
    /// Navigates to `target`.
    async fn navigate(&self, target: &str) -> Result<()>;
}

/// Asks the user whether to leave with unsaved changes.
#[async_trait]
pub trait ConfirmPrompt: Send + Sync {
    /// Returns true if the user confirms leaving.
    async fn confirm(&self, message: &str) -> bool;
}

/// Result of a guarded navigation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// The guard was not armed; the router was called directly.
    Proceeded,
    /// The user confirmed and the router was called.
    Confirmed,
    /// The user cancelled; the navigation was dropped.
    Cancelled,
}

/// Answer for the host's native unload hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadDecision {
    /// Let the page unload.
    Allow,
    /// Ask the host to show its native leave prompt.
    Prompt {
        /// Message to show, where the host supports one.
        message: String,
    },
}

/// Shared navigation guard.
///
/// Cloning yields another handle onto the same state.
#[derive(Debug, Clone)]
pub struct NavigationGuard {
    state: Arc<Mutex<GuardState>>,
    message: Arc<str>,
}

impl NavigationGuard {
    /// Creates an unarmed guard that prompts with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardState::Unguarded(UnguardReason::Clean))),
            message: Arc::from(message.into()),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> GuardState {
        *self.lock()
    }

    /// Returns true if navigation away is intercepted.
    pub fn is_guarded(&self) -> bool {
        self.state() == GuardState::Guarded
    }

    /// Returns the confirmation message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Records a field mutation: arms the guard if the session was clean.
    ///
    /// Persisting a step does not disarm it.
    pub fn on_field_mutation(&self) {
        let mut state = self.lock();
        if *state == GuardState::Unguarded(UnguardReason::Clean) {
            debug!("guard armed");
            *state = GuardState::Guarded;
        }
    }

    /// Disarms the guard for a terminal submission.
    pub fn begin_submission(&self) {
        self.set(GuardState::Unguarded(UnguardReason::Submitting));
    }

    /// Re-arms the guard after a failed submission.
    pub fn submission_failed(&self) {
        self.set(GuardState::Guarded);
    }

    /// Re-arms the guard if a submission was abandoned before it settled.
    ///
    /// Leaves any other state alone, so a session discarded or exited
    /// during the submission stays disarmed.
    pub fn abandon_submission(&self) {
        let mut state = self.lock();
        if *state == GuardState::Unguarded(UnguardReason::Submitting) {
            debug!("submission abandoned, guard re-armed");
            *state = GuardState::Guarded;
        }
    }

    /// Disarms the guard for good after a successful submission.
    pub fn complete(&self) {
        self.set(GuardState::Unguarded(UnguardReason::Completed));
    }

    /// Returns the guard to its clean state, e.g. for a new session.
    pub fn reset(&self) {
        self.set(GuardState::Unguarded(UnguardReason::Clean));
    }

    /// Navigates to `target`, asking first if the guard is armed.
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
        if !self.is_guarded() {
            router.navigate(target).await?;
            return Ok(NavigationOutcome::Proceeded);
        }

        if !prompt.confirm(&self.message).await {
            debug!(target, "navigation cancelled");
            return Ok(NavigationOutcome::Cancelled);
        }

        self.set(GuardState::Unguarded(UnguardReason::Confirmed));
        router.navigate(target).await?;
        Ok(NavigationOutcome::Confirmed)
    }

    /// Answers the host's unload hook from the same state as
    /// [`navigate`](Self::navigate).
    pub fn before_unload(&self) -> UnloadDecision {
        if self.is_guarded() {
            UnloadDecision::Prompt {
                message: self.message.to_string(),
            }
        } else {
            UnloadDecision::Allow
        }
    }

    fn set(&self, next: GuardState) {
        *self.lock() = next;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
