//! Maintenance-request intake flow.
//!
//! Three top-level groups, with nested sub-steps shown under their group:
//!
//! ```text
//! 1 issue:   category --(appliance)--> appliance_info
//! 2 details: details -> entry_access
//! 3 submit:  review
//! ```
//!
//! Nothing is persisted until `review` submits the request.

use serde_json::json;
use std::sync::Arc;
use strum::{AsRefStr, EnumString, IntoStaticStr};

use crate::controller::{ControllerBuilder, FieldMapping};
use crate::normalize::{canonicalize, normalize_scalar};
use crate::{
    EntityBackend, FieldStore, FlowProgress, ProjectingAdapter, Result, StepGraph, StepKey,
    StepwiseConfig, WizardController,
};

/// Flow identifier.
pub const FLOW_ID: &str = "maintenance";

/// Backend resource the flow writes.
pub const RESOURCE: &str = "maintenance_requests";

/// Steps of the maintenance flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum MaintenanceStep {
    /// What kind of problem.
    Category,
    /// Appliance make and model, for appliance issues only.
    ApplianceInfo,
    /// Description, urgency, and photos.
    Details,
    /// Permission to enter and access notes.
    EntryAccess,
    /// Review and submit.
    Review,
}

impl StepKey for MaintenanceStep {
    fn name(&self) -> &'static str {
        self.into()
    }
}

/// Top-level groups shown in the progress header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum MaintenanceGroup {
    /// Category and appliance info.
    Issue,
    /// Details and entry access.
    Details,
    /// Review.
    Submit,
}

impl MaintenanceGroup {
    /// 1-based display position.
    pub fn position(self) -> usize {
        match self {
            Self::Issue => 1,
            Self::Details => 2,
            Self::Submit => 3,
        }
    }

    /// Number of groups.
    pub const COUNT: usize = 3;
}

impl MaintenanceStep {
    /// Returns the group this step is displayed under.
    pub fn group(self) -> MaintenanceGroup {
        match self {
            Self::Category | Self::ApplianceInfo => MaintenanceGroup::Issue,
            Self::Details | Self::EntryAccess => MaintenanceGroup::Details,
            Self::Review => MaintenanceGroup::Submit,
        }
    }

    /// Returns true for steps nested under another step of their group.
    pub fn is_sub_step(self) -> bool {
        matches!(self, Self::ApplianceInfo | Self::EntryAccess)
    }
}

/// Problem categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum MaintenanceCategory {
    /// Leaks, clogs, water heater.
    Plumbing,
    /// Outlets, lights, breakers.
    Electrical,
    /// Fridge, stove, washer.
    #[strum(to_string = "APPLIANCE", serialize = "APPLIANCES")]
    Appliance,
    /// Heating and cooling.
    #[strum(to_string = "HVAC", serialize = "HEATING", serialize = "COOLING")]
    Hvac,
    /// Insects and rodents.
    #[strum(to_string = "PEST", serialize = "PESTS")]
    Pest,
    /// Unclassified.
    #[default]
    None,
}

/// How soon the request needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Urgency {
    /// Same day.
    #[strum(to_string = "EMERGENCY", serialize = "URGENT")]
    Emergency,
    /// Within a few days.
    Soon,
    /// Whenever convenient.
    Routine,
    /// Not specified.
    #[default]
    None,
}

fn category(fields: &FieldStore) -> MaintenanceCategory {
    fields
        .get_str("category")
        .map(canonicalize::<MaintenanceCategory>)
        .unwrap_or_default()
}

/// Builds the step graph, writing through `backend`.
///
/// # Errors
///
/// Returns [`StepwiseError::Configuration`](crate::StepwiseError) only if
/// the definition is internally inconsistent.
pub fn graph(backend: Arc<dyn EntityBackend>) -> Result<StepGraph<MaintenanceStep>> {
    use MaintenanceStep::*;

    StepGraph::builder(FLOW_ID)
        .branch(Category, [ApplianceInfo, Details], |fields: &FieldStore| {
            if category(fields) == MaintenanceCategory::Appliance {
                ApplianceInfo
            } else {
                Details
            }
        })
        .fixed(ApplianceInfo, Details)
        .fixed(Details, EntryAccess)
        .fixed(EntryAccess, Review)
        .terminal(Review)
        .persist(
            Review,
            ProjectingAdapter::new(RESOURCE, backend)
                .require("category")
                .require("description")
                .normalized("category", normalize_scalar::<MaintenanceCategory>)
                .normalized("urgency", normalize_scalar::<Urgency>)
                .copy("description")
                .copy("appliance_brand")
                .copy("appliance_model")
                .copy("entry_permitted")
                .copy("access_notes")
                .attachments("photos")
                .with_static("status", json!("OPEN")),
        )
        .build()
}

/// Returns a controller builder for the maintenance flow.
///
/// The flow persists only on submit, so there is nothing to resume from.
///
/// # Errors
///
/// See [`graph`].
pub fn builder(
    backend: Arc<dyn EntityBackend>,
    config: StepwiseConfig,
) -> Result<ControllerBuilder<MaintenanceStep>> {
    Ok(WizardController::builder(graph(backend)?)
        .map_field(FieldMapping::new("photos").or_default(json!([])))
        .selection_set("photos")
        .config(config))
}

/// Builds a maintenance controller with the default uploader.
///
/// # Errors
///
/// See [`graph`].
pub fn controller(
    backend: Arc<dyn EntityBackend>,
    config: StepwiseConfig,
) -> Result<WizardController<MaintenanceStep>> {
    Ok(builder(backend, config)?.build())
}

/// Returns the group of the progress's current step.
pub fn current_group(progress: &FlowProgress) -> Option<MaintenanceGroup> {
    use MaintenanceStep::*;

    let current = progress.current()?.name;
    [Category, ApplianceInfo, Details, EntryAccess, Review]
        .into_iter()
        .find(|step| step.name() == current)
        .map(MaintenanceStep::group)
}
