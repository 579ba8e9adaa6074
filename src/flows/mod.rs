//! Bundled flow definitions.
//!
//! Each flow is a step enum, a [`StepGraph`](crate::StepGraph) with its
//! persistence adapters, resume rules, and the field mapping between draft
//! fields and the backend entity. All three run on the same
//! [`WizardController`](crate::WizardController).
//!
//! - [`property`]: eight-step property creation, persisting as it goes
//! - [`unit_listing`]: unit listing with an optional pet sub-branch
//! - [`maintenance`]: maintenance-request intake, persisted on submit

pub mod maintenance;
pub mod property;
pub mod unit_listing;

use serde_json::Value as JsonValue;

use crate::Entity;

/// Reads a boolean entity field, treating anything else as false.
pub(crate) fn entity_flag(entity: &Entity, key: &str) -> bool {
    entity
        .get(key)
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
}
