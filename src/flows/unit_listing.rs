//! Unit listing flow.
//!
//! ```text
//! listing_details -> pet_policy --(pets_allowed)--> pet_details -> pet_fees -> application_settings
//!                    pet_policy --(no pets)-------------------------------> application_settings
//! ```

use serde_json::json;
use std::sync::Arc;
use strum::{AsRefStr, EnumString, IntoStaticStr};

use super::entity_flag;
use crate::controller::{ControllerBuilder, FieldMapping};
use crate::normalize::normalize_list;
use crate::{
    Entity, EntityBackend, FieldStore, ProjectingAdapter, Result, ResumeResolver, StepGraph,
    StepKey, StepwiseConfig, WizardController,
};

/// Flow identifier.
pub const FLOW_ID: &str = "unit_listing";

/// Backend resource the flow writes.
pub const RESOURCE: &str = "units";

/// Steps of the unit listing flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum UnitListingStep {
    /// Unit name, bedrooms, rent.
    ListingDetails,
    /// Whether pets are allowed.
    PetPolicy,
    /// Allowed pet types and limits.
    PetDetails,
    /// Pet deposit and monthly pet rent.
    PetFees,
    /// Application fee and screening; publishes the listing.
    ApplicationSettings,
}

impl StepKey for UnitListingStep {
    fn name(&self) -> &'static str {
        self.into()
    }
}

/// Pet types a listing can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PetType {
    /// Dogs of any size.
    #[strum(to_string = "DOG", serialize = "DOGS")]
    Dog,
    /// Cats.
    #[strum(to_string = "CAT", serialize = "CATS")]
    Cat,
    /// Small caged animals.
    SmallAnimal,
    /// None accepted.
    #[default]
    None,
}

fn pets_allowed(fields: &FieldStore) -> bool {
    fields.flag("pets_allowed")
}

/// Builds the step graph, writing through `backend`.
///
/// # Errors
///
/// Returns [`StepwiseError::Configuration`](crate::StepwiseError) only if
/// the definition is internally inconsistent.
pub fn graph(
    backend: Arc<dyn EntityBackend>,
    marker_key: &str,
) -> Result<StepGraph<UnitListingStep>> {
    use UnitListingStep::*;

    let adapter = || ProjectingAdapter::new(RESOURCE, backend.clone()).mark_completion(marker_key);

    StepGraph::builder(FLOW_ID)
        .fixed(ListingDetails, PetPolicy)
        .branch(PetPolicy, [PetDetails, ApplicationSettings], |fields: &FieldStore| {
            if pets_allowed(fields) {
                PetDetails
            } else {
                ApplicationSettings
            }
        })
        .fixed(PetDetails, PetFees)
        .fixed(PetFees, ApplicationSettings)
        .terminal(ApplicationSettings)
        .persist(
            ListingDetails,
            adapter()
                .require("unit_name")
                .require("rent")
                .copy("unit_name")
                .copy("bedrooms")
                .copy("bathrooms")
                .copy("rent")
                .with_static("status", json!("DRAFT")),
        )
        .persist(PetPolicy, adapter().copy("pets_allowed"))
        .persist(
            PetDetails,
            adapter()
                .normalized("pet_types", normalize_list::<PetType>)
                .copy("max_pets"),
        )
        .persist(
            PetFees,
            adapter().require("pet_deposit").copy("pet_deposit").copy("pet_rent"),
        )
        .persist(
            ApplicationSettings,
            adapter()
                .copy("application_fee")
                .copy("screening_required")
                .with_static("status", json!("ACTIVE")),
        )
        .build()
}

/// Presence checklist used when an entity has no completion marker.
pub fn resume_rules() -> ResumeResolver<UnitListingStep> {
    use UnitListingStep::*;

    ResumeResolver::new()
        .when_present(&["unit_name", "rent"], PetPolicy)
        .when_applicable(PetDetails, |e: &Entity| entity_flag(e, "pets_allowed"))
        .when_applicable(PetFees, |e: &Entity| {
            entity_flag(e, "pets_allowed") && e.is_present("pet_types")
        })
        .when(ApplicationSettings, |e: &Entity| {
            e.is_present("pets_allowed")
                && (!entity_flag(e, "pets_allowed") || e.is_present("pet_deposit"))
        })
}

/// Mapping between draft fields and entity data.
///
/// Text fields seed as empty strings and numbers as null.
pub fn field_mappings() -> Vec<FieldMapping> {
    vec![
        FieldMapping::new("unit_name").or_default(json!("")),
        FieldMapping::new("bedrooms"),
        FieldMapping::new("bathrooms"),
        FieldMapping::new("rent"),
        FieldMapping::new("pets_allowed").or_default(json!(false)),
        FieldMapping::new("pet_types").or_default(json!([])),
        FieldMapping::new("max_pets"),
        FieldMapping::new("pet_deposit"),
        FieldMapping::new("pet_rent"),
        FieldMapping::new("application_fee"),
        FieldMapping::new("screening_required").or_default(json!(true)),
    ]
}

/// Returns a controller builder for the unit listing flow.
///
/// # Errors
///
/// See [`graph`].
pub fn builder(
    backend: Arc<dyn EntityBackend>,
    config: StepwiseConfig,
) -> Result<ControllerBuilder<UnitListingStep>> {
    let graph = graph(backend, &config.completion_marker_key)?;
    Ok(WizardController::builder(graph)
        .resume_with(resume_rules().with_completion_marker(config.completion_marker_key.clone()))
        .map_fields(field_mappings())
        .selection_set("pet_types")
        .config(config))
}

/// Builds a unit listing controller with the default uploader.
///
/// # Errors
///
/// See [`graph`].
pub fn controller(
    backend: Arc<dyn EntityBackend>,
    config: StepwiseConfig,
) -> Result<WizardController<UnitListingStep>> {
    Ok(builder(backend, config)?.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AdvanceOutcome, EntityId, MemoryEntityBackend};
    use serde_json::Value as JsonValue;

    fn details(c: &WizardController<UnitListingStep>) {
        c.update_field("unit_name", json!("3A")).unwrap();
        c.update_field("rent", json!(1400)).unwrap();
    }

    #[tokio::test]
    async fn test_pets_allowed_routes_to_pet_details() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(backend, StepwiseConfig::default()).unwrap();
        details(&c);
        c.advance().await.unwrap();
        c.update_field("pets_allowed", json!(true)).unwrap();

        assert_eq!(
            c.advance().await.unwrap(),
            AdvanceOutcome::Advanced {
                from: UnitListingStep::PetPolicy,
                to: UnitListingStep::PetDetails
            }
        );
    }

    #[tokio::test]
    async fn test_no_pets_skips_sub_branch_both_ways() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(backend, StepwiseConfig::default()).unwrap();
        details(&c);
        c.advance().await.unwrap();
        c.update_field("pets_allowed", json!(false)).unwrap();

        assert_eq!(
            c.advance().await.unwrap(),
            AdvanceOutcome::Advanced {
                from: UnitListingStep::PetPolicy,
                to: UnitListingStep::ApplicationSettings
            }
        );
        assert_eq!(c.retreat().unwrap(), Some(UnitListingStep::PetPolicy));
    }

    #[tokio::test]
    async fn test_pet_types_are_normalized() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let c = controller(backend.clone(), StepwiseConfig::default()).unwrap();
        details(&c);
        c.advance().await.unwrap();
        c.update_field("pets_allowed", json!(true)).unwrap();
        c.advance().await.unwrap();
        c.update_field("pet_types", json!(["dogs", "Cat", "iguana"])).unwrap();
        c.advance().await.unwrap();

        let id = c.entity_id().unwrap().unwrap();
        let stored = backend.fetch(RESOURCE, &id).await.unwrap().unwrap();
        assert_eq!(stored.get("pet_types"), Some(&json!(["DOG", "CAT"])));
        assert_eq!(c.current_step().unwrap(), UnitListingStep::PetFees);
    }

    #[test]
    fn test_resume_rules_respect_branch() {
        let graph = graph(Arc::new(MemoryEntityBackend::new()), "done").unwrap();
        let rules = resume_rules();
        let fields = FieldStore::new();
        let resolve = |data: JsonValue| {
            let entity = Entity::new(EntityId::new("u-1"), data.as_object().cloned().unwrap());
            rules.resolve(&entity, &graph, &fields).unwrap().step
        };

        assert_eq!(
            resolve(json!({"unit_name": "3A", "rent": 1400})),
            UnitListingStep::PetPolicy
        );
        assert_eq!(
            resolve(json!({"unit_name": "3A", "rent": 1400, "pets_allowed": false})),
            UnitListingStep::ApplicationSettings
        );
        assert_eq!(
            resolve(json!({"unit_name": "3A", "rent": 1400, "pets_allowed": true})),
            UnitListingStep::PetDetails
        );
        assert_eq!(
            resolve(json!({
                "unit_name": "3A", "rent": 1400, "pets_allowed": true, "pet_types": ["DOG"]
            })),
            UnitListingStep::PetFees
        );
    }
}
