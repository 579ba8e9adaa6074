//! Property creation flow.
//!
//! ```text
//! basics -> amenities -> extended_amenities -> photos -> description
//!     description --(multi_unit)--> unit_mix -> pricing -> review
//!     description --(single)------> pricing -> review
//! ```
//!
//! Every step persists. `basics` creates the property; later steps update
//! it; `review` publishes it.

use serde_json::json;
use std::sync::Arc;
use strum::{AsRefStr, EnumString, IntoStaticStr};

use super::entity_flag;
use crate::controller::{ControllerBuilder, FieldMapping};
use crate::normalize::{normalize_list, normalize_scalar};
use crate::{
    Entity, EntityBackend, FieldStore, ProjectingAdapter, Result, ResumeResolver, StepGraph,
    StepKey, StepwiseConfig, WizardController,
};

/// Flow identifier.
pub const FLOW_ID: &str = "property";

/// Backend resource the flow writes.
pub const RESOURCE: &str = "properties";

/// Steps of the property flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PropertyStep {
    /// Name, address, and property type.
    Basics,
    /// Community amenities.
    Amenities,
    /// Parking, laundry, and air conditioning.
    ExtendedAmenities,
    /// Photo gallery.
    Photos,
    /// Marketing description and listing ribbon.
    Description,
    /// Unit mix, for multi-unit properties only.
    UnitMix,
    /// Rent and deposit.
    Pricing,
    /// Final review; publishes the property.
    Review,
}

impl StepKey for PropertyStep {
    fn name(&self) -> &'static str {
        self.into()
    }
}

/// Parking options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ParkingType {
    /// Enclosed garage.
    Garage,
    /// Covered or carport.
    #[strum(to_string = "COVERED", serialize = "CARPORT")]
    Covered,
    /// Off-street lot.
    OffStreet,
    /// On-street.
    #[strum(to_string = "STREET", serialize = "STREET_PARKING")]
    Street,
    /// None provided.
    #[default]
    None,
}

/// Laundry options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum LaundryType {
    /// Washer and dryer in the unit.
    #[strum(to_string = "IN_UNIT", serialize = "WASHER_DRYER")]
    InUnit,
    /// Hookups only.
    Hookups,
    /// Shared laundry room.
    #[strum(to_string = "SHARED", serialize = "COIN_OP", serialize = "ON_SITE")]
    Shared,
    /// None provided.
    #[default]
    None,
}

/// Air-conditioning options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum AcType {
    /// Central air.
    #[strum(to_string = "CENTRAL", serialize = "CENTRAL_AIR")]
    Central,
    /// Wall or window units.
    #[strum(to_string = "WALL_UNIT", serialize = "WINDOW_UNIT")]
    WallUnit,
    /// Evaporative cooler.
    Evaporative,
    /// None provided.
    #[default]
    None,
}

/// Ribbon shown on the listing card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum RibbonType {
    /// Featured listing.
    Featured,
    /// Newly built.
    NewConstruction,
    /// Rent recently lowered.
    PriceReduced,
    /// Move-in special offered.
    MoveInSpecial,
    /// No ribbon.
    #[default]
    None,
}

/// Draft fields that hold selection sets.
pub const SELECTION_SETS: &[&str] = &[
    "amenities",
    "parking_types",
    "laundry_types",
    "ac_types",
    "photos",
];

fn is_multi_unit(fields: &FieldStore) -> bool {
    fields.flag("multi_unit")
}

/// Builds the step graph, writing through `backend`.
///
/// # Errors
///
/// Returns [`StepwiseError::Configuration`](crate::StepwiseError) only if
/// the definition is internally inconsistent.
pub fn graph(backend: Arc<dyn EntityBackend>, marker_key: &str) -> Result<StepGraph<PropertyStep>> {
    use PropertyStep::*;

    let adapter = || ProjectingAdapter::new(RESOURCE, backend.clone()).mark_completion(marker_key);

    StepGraph::builder(FLOW_ID)
        .fixed(Basics, Amenities)
        .fixed(Amenities, ExtendedAmenities)
        .fixed(ExtendedAmenities, Photos)
        .fixed(Photos, Description)
        .branch(Description, [UnitMix, Pricing], |fields: &FieldStore| {
            if is_multi_unit(fields) {
                UnitMix
            } else {
                Pricing
            }
        })
        .fixed(UnitMix, Pricing)
        .fixed(Pricing, Review)
        .terminal(Review)
        .persist(
            Basics,
            adapter()
                .require("name")
                .require("address")
                .copy("name")
                .copy("address")
                .copy("property_type")
                .with_static("status", json!("DRAFT")),
        )
        .persist(Amenities, adapter().copy("amenities"))
        .persist(
            ExtendedAmenities,
            adapter()
                .normalized("parking_types", normalize_list::<ParkingType>)
                .normalized("laundry_types", normalize_list::<LaundryType>)
                .normalized("ac_types", normalize_list::<AcType>),
        )
        .persist(Photos, adapter().attachments("photos"))
        .persist(
            Description,
            adapter()
                .require("description")
                .copy("description")
                .copy("multi_unit")
                .normalized_as("ribbon", "ribbon_type", normalize_scalar::<RibbonType>),
        )
        .persist(UnitMix, adapter().require("units").copy("units"))
        .persist(
            Pricing,
            adapter().require("rent").copy("rent").copy("deposit"),
        )
        .persist(
            Review,
            ProjectingAdapter::new(RESOURCE, backend.clone())
                .with_static("status", json!("PUBLISHED")),
        )
        .build()
}

/// Presence checklist used when an entity has no completion marker.
pub fn resume_rules() -> ResumeResolver<PropertyStep> {
    use PropertyStep::*;

    ResumeResolver::new()
        .when_present(&["name", "address"], Amenities)
        // Extended amenities default to NONE and leave no trace to detect.
        .when_present(&["amenities"], Photos)
        .when_present(&["photos"], Description)
        .when_applicable(UnitMix, |e: &Entity| {
            e.is_present("description") && entity_flag(e, "multi_unit")
        })
        .when(Pricing, |e: &Entity| {
            e.is_present("description") && (!entity_flag(e, "multi_unit") || e.is_present("units"))
        })
        .when_present(&["rent"], Review)
}

/// Mapping between draft fields and entity data.
///
/// Text fields seed as empty strings and numbers as null.
pub fn field_mappings() -> Vec<FieldMapping> {
    vec![
        FieldMapping::new("name").or_default(json!("")),
        FieldMapping::new("address").or_default(json!("")),
        FieldMapping::new("property_type").or_default(json!("")),
        FieldMapping::new("amenities").or_default(json!([])),
        FieldMapping::new("parking_types").or_default(json!(["NONE"])),
        FieldMapping::new("laundry_types").or_default(json!(["NONE"])),
        FieldMapping::new("ac_types").or_default(json!(["NONE"])),
        FieldMapping::new("photos").or_default(json!([])),
        FieldMapping::new("description").or_default(json!("")),
        FieldMapping::renamed("ribbon", "ribbon_type").or_default(json!("NONE")),
        FieldMapping::new("multi_unit").or_default(json!(false)),
        FieldMapping::new("units").or_default(json!([])),
        FieldMapping::new("rent"),
        FieldMapping::new("deposit"),
    ]
}

/// Returns a controller builder for the property flow.
///
/// # Errors
///
/// See [`graph`].
pub fn builder(
    backend: Arc<dyn EntityBackend>,
    config: StepwiseConfig,
) -> Result<ControllerBuilder<PropertyStep>> {
    let graph = graph(backend, &config.completion_marker_key)?;
    let mut builder = WizardController::builder(graph)
        .resume_with(resume_rules().with_completion_marker(config.completion_marker_key.clone()))
        .map_fields(field_mappings())
        .config(config);
    for key in SELECTION_SETS {
        builder = builder.selection_set(*key);
    }
    Ok(builder)
}

/// Builds a property flow controller with the default uploader.
///
/// # Errors
///
/// See [`graph`].
pub fn controller(
    backend: Arc<dyn EntityBackend>,
    config: StepwiseConfig,
) -> Result<WizardController<PropertyStep>> {
    Ok(builder(backend, config)?.build())
}
