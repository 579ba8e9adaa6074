//! Wizard session events.
//!
//! This module provides [`WizardEvent`] for observing a session. Events are
//! broadcast through a channel that can be subscribed to for analytics,
//! logging, or driving a UI.

/// An event emitted by a [`WizardController`](crate::WizardController).
///
/// Events use `String` for step names and ids to keep the event type simple
/// and easy to serialize for logging or transmission.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum WizardEvent {
    /// The session moved forward to another step.
    StepAdvanced {
        /// The flow identifier.
        flow_id: String,
        /// The step that was completed.
        from: String,
        /// The step now active.
        to: String,
    },

    /// Advancing failed with a recoverable error; the session stayed put.
    StepRejected {
        /// The flow identifier.
        flow_id: String,
        /// The step that could not be completed.
        step: String,
        /// Error message describing the failure.
        error: String,
    },

    /// The session moved back along its traversed path.
    StepRetreated {
        /// The flow identifier.
        flow_id: String,
        /// The step that was left.
        from: String,
        /// The step now active.
        to: String,
    },

    /// The session was positioned from a previously persisted entity.
    Resumed {
        /// The flow identifier.
        flow_id: String,
        /// The entity resumed from.
        entity_id: String,
        /// The landing step.
        step: String,
    },

    /// A resume request was ignored because the entity was just created.
    ResumeBypassed {
        /// The flow identifier.
        flow_id: String,
        /// The freshly created entity.
        entity_id: String,
    },

    /// A file was staged locally.
    AttachmentStaged {
        /// The flow identifier.
        flow_id: String,
        /// The field referencing the attachment.
        field: String,
        /// The staged attachment's id.
        attachment_id: String,
    },

    /// An exit attempt hit the armed guard and was cancelled.
    NavigationBlocked {
        /// The flow identifier.
        flow_id: String,
        /// The navigation target.
        target: String,
    },

    /// The user confirmed leaving with unsaved changes.
    NavigationConfirmed {
        /// The flow identifier.
        flow_id: String,
        /// The navigation target.
        target: String,
    },

    /// The terminal step was submitted and the session torn down.
    FlowCompleted {
        /// The flow identifier.
        flow_id: String,
        /// The submitted entity.
        entity_id: String,
    },

    /// The session was discarded without submitting.
    SessionDiscarded {
        /// The flow identifier.
        flow_id: String,
    },
}

impl WizardEvent {
    /// Returns the flow ID for this event.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::StepAdvanced { flow_id, .. }
            | Self::StepRejected { flow_id, .. }
            | Self::StepRetreated { flow_id, .. }
            | Self::Resumed { flow_id, .. }
            | Self::ResumeBypassed { flow_id, .. }
            | Self::AttachmentStaged { flow_id, .. }
            | Self::NavigationBlocked { flow_id, .. }
            | Self::NavigationConfirmed { flow_id, .. }
            | Self::FlowCompleted { flow_id, .. }
            | Self::SessionDiscarded { flow_id } => flow_id,
        }
    }

    /// Returns the step this event leaves the session on, if applicable.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepAdvanced { to, .. } | Self::StepRetreated { to, .. } => Some(to),
            Self::StepRejected { step, .. } | Self::Resumed { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Returns true if this is an error event.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::StepRejected { .. })
    }

    /// Returns true if this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::FlowCompleted { .. } | Self::SessionDiscarded { .. }
        )
    }
}
