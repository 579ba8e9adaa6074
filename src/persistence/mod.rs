//! Per-step persistence against the backend entity.
//!
//! This module provides the [`PersistenceAdapter`] trait run by the
//! controller before advancing past a persisting step, the
//! [`EntityBackend`] collaborator adapters write through, and
//! [`ProjectingAdapter`], the declarative adapter the bundled flows use.
//!
//! Backends:
//!
//! - [`MemoryEntityBackend`]: in-memory storage for tests and demos
//! - `SqliteEntityBackend` (feature `sqlite`): file-backed storage

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryEntityBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEntityBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::field_store::is_meaningful;
use crate::normalize::Normalizer;
use crate::{AttachmentStager, FieldStore, Result, StepwiseError, UploadContext};

/// Server-assigned identifier of the entity a flow builds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wraps a server identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A backend record as returned by create, update, or fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identifier.
    pub id: EntityId,
    /// Persisted fields in backend shape.
    pub data: JsonMap<String, JsonValue>,
}

impl Entity {
    /// Creates an entity.
    pub fn new(id: EntityId, data: JsonMap<String, JsonValue>) -> Self {
        Self { id, data }
    }

    /// Returns a persisted field.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    /// Returns true if `key` holds a meaningful (non-empty) value.
    pub fn is_present(&self, key: &str) -> bool {
        self.data.get(key).is_some_and(is_meaningful)
    }

    /// Returns true if every key in `keys` is present.
    pub fn all_present(&self, keys: &[&str]) -> bool {
        keys.iter().all(|k| self.is_present(k))
    }

    /// Returns the explicit completion marker, if the entity carries one.
    pub fn completed_steps(&self, marker_key: &str) -> Option<Vec<String>> {
        self.data.get(marker_key).and_then(JsonValue::as_array).map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
    }
}

/// The backend entity API collaborator.
///
/// Persistence adapters are its only callers.
#[async_trait]
pub trait EntityBackend: fmt::Debug + Send + Sync {
    /// Creates a new entity of `resource` from `data`.
    ///
    /// # Errors
    ///
    /// Implementations return [`StepwiseError::Validation`] for rejected
    /// input and [`StepwiseError::Network`] for anything else.
    async fn create(&self, resource: &str, data: JsonMap<String, JsonValue>) -> Result<Entity>;

    /// Applies a partial update to an existing entity.
    ///
    /// # Errors
    ///
    /// As [`create`](Self::create); an unknown id is a network error.
    async fn update(
        &self,
        resource: &str,
        id: &EntityId,
        patch: JsonMap<String, JsonValue>,
    ) -> Result<Entity>;

    /// Fetches an entity, for resuming a session.
    async fn fetch(&self, resource: &str, id: &EntityId) -> Result<Option<Entity>>;
}

/// Everything an adapter may read while persisting one step.
#[derive(Debug, Clone, Copy)]
pub struct PersistRequest<'a> {
    /// Flow being persisted.
    pub flow_id: &'a str,
    /// Name of the step being persisted.
    pub step: &'static str,
    /// Field snapshot taken when the advance started.
    pub fields: &'a FieldStore,
    /// Entity id, if a previous step created the entity.
    pub entity_id: Option<&'a EntityId>,
    /// Names of the steps already completed in this session.
    pub completed_steps: &'a [&'static str],
    /// Stager holding the session's attachments.
    pub stager: &'a AttachmentStager,
}

impl PersistRequest<'_> {
    /// Returns the upload owner for attachments of this step.
    pub fn upload_context(&self) -> UploadContext {
        UploadContext {
            flow_id: self.flow_id.to_string(),
            step: self.step.to_string(),
            entity_id: self.entity_id.cloned(),
        }
    }
}

/// Persists one step.
///
/// An adapter projects only its step's fields out of the snapshot,
/// normalizes enum-like values, commits referenced attachments, and then
/// creates the entity (no id yet) or partially updates it.
#[async_trait]
pub trait PersistenceAdapter: fmt::Debug + Send + Sync {
    /// Persists the step and returns the updated entity.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Validation`], [`StepwiseError::Upload`] or
    /// [`StepwiseError::Network`] for recoverable failures.
    async fn persist(&self, request: PersistRequest<'_>) -> Result<Entity>;
}

/// How one draft field maps onto the entity.
#[derive(Clone)]
enum Projection {
    Copy {
        field: String,
        entity_key: String,
    },
    Normalized {
        field: String,
        entity_key: String,
        normalize: Normalizer,
    },
    Attachments {
        field: String,
        entity_key: String,
    },
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy { field, entity_key } => write!(f, "copy({field} -> {entity_key})"),
            Self::Normalized {
                field, entity_key, ..
            } => write!(f, "normalized({field} -> {entity_key})"),
            Self::Attachments { field, entity_key } => {
                write!(f, "attachments({field} -> {entity_key})")
            }
        }
    }
}

/// A declarative [`PersistenceAdapter`].
///
/// # Example
///
/// ```
/// use stepwise::{MemoryEntityBackend, ProjectingAdapter};
/// use stepwise::normalize::normalize_list;
/// use std::sync::Arc;
/// # use strum::{AsRefStr, EnumString};
/// # #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
/// # #[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
/// # enum Parking { Garage, #[default] None }
///
/// let backend = Arc::new(MemoryEntityBackend::new());
/// let adapter = ProjectingAdapter::new("properties", backend)
///     .require("name")
///     .copy("name")
///     .copy_as("street", "address_line1")
///     .normalized("parking", normalize_list::<Parking>)
///     .attachments("photos");
/// ```
#[derive(Clone)]
pub struct ProjectingAdapter {
    resource: String,
    backend: Arc<dyn EntityBackend>,
    projections: Vec<Projection>,
    required: Vec<String>,
    statics: Vec<(String, JsonValue)>,
    completion_marker: Option<String>,
}

impl ProjectingAdapter {
    /// Creates an adapter writing `resource` entities through `backend`.
    pub fn new(resource: impl Into<String>, backend: Arc<dyn EntityBackend>) -> Self {
        Self {
            resource: resource.into(),
            backend,
            projections: Vec::new(),
            required: Vec::new(),
            statics: Vec::new(),
            completion_marker: None,
        }
    }

    /// Sends `field` under the same key.
    pub fn copy(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.copy_as(field.clone(), field)
    }

    /// Sends `field` under `entity_key`.
    pub fn copy_as(mut self, field: impl Into<String>, entity_key: impl Into<String>) -> Self {
        self.projections.push(Projection::Copy {
            field: field.into(),
            entity_key: entity_key.into(),
        });
        self
    }

    /// Sends `field` after canonicalizing it.
    pub fn normalized(self, field: impl Into<String>, normalize: Normalizer) -> Self {
        let field = field.into();
        self.normalized_as(field.clone(), field, normalize)
    }

    /// Sends `field` under `entity_key` after canonicalizing it.
    pub fn normalized_as(
        mut self,
        field: impl Into<String>,
        entity_key: impl Into<String>,
        normalize: Normalizer,
    ) -> Self {
        self.projections.push(Projection::Normalized {
            field: field.into(),
            entity_key: entity_key.into(),
            normalize,
        });
        self
    }

    /// Commits the attachments listed in `field` and sends their URLs.
    pub fn attachments(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.attachments_as(field.clone(), field)
    }

    /// Commits the attachments listed in `field`, sending URLs as
    /// `entity_key`.
    pub fn attachments_as(
        mut self,
        field: impl Into<String>,
        entity_key: impl Into<String>,
    ) -> Self {
        self.projections.push(Projection::Attachments {
            field: field.into(),
            entity_key: entity_key.into(),
        });
        self
    }

    /// Fails with a validation error unless `field` is filled in.
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    /// Always sends `value` under `entity_key` (e.g. a status flip on the
    /// final step).
    pub fn with_static(mut self, entity_key: impl Into<String>, value: JsonValue) -> Self {
        self.statics.push((entity_key.into(), value));
        self
    }

    /// Writes the list of completed steps to `marker_key`.
    pub fn mark_completion(mut self, marker_key: impl Into<String>) -> Self {
        self.completion_marker = Some(marker_key.into());
        self
    }

    /// Returns the target resource.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Builds the partial entity for this step without committing
    /// attachments.
    ///
    /// Attachment projections are left out; [`persist`] adds them after
    /// committing.
    ///
    /// [`persist`]: PersistenceAdapter::persist
    pub fn project(&self, request: &PersistRequest<'_>) -> Result<JsonMap<String, JsonValue>> {
        for field in &self.required {
            if !request.fields.is_present(field) {
                return Err(StepwiseError::validation(field.as_str(), "is required"));
            }
        }

        let mut patch = JsonMap::new();
        for projection in &self.projections {
            match projection {
                Projection::Copy { field, entity_key } => {
                    if let Some(value) = request.fields.get(field) {
                        patch.insert(entity_key.clone(), value.clone());
                    }
                }
                Projection::Normalized {
                    field,
                    entity_key,
                    normalize,
                } => {
                    patch.insert(entity_key.clone(), normalize(request.fields.get(field)));
                }
                Projection::Attachments { .. } => {}
            }
        }

        for (key, value) in &self.statics {
            patch.insert(key.clone(), value.clone());
        }

        if let Some(marker) = &self.completion_marker {
            let mut steps: Vec<JsonValue> = request
                .completed_steps
                .iter()
                .map(|s| JsonValue::String((*s).to_string()))
                .collect();
            let current = JsonValue::String(request.step.to_string());
            if !steps.contains(&current) {
                steps.push(current);
            }
            patch.insert(marker.clone(), JsonValue::Array(steps));
        }

        Ok(patch)
    }
}

#[async_trait]
impl PersistenceAdapter for ProjectingAdapter {
    async fn persist(&self, request: PersistRequest<'_>) -> Result<Entity> {
        let mut patch = self.project(&request)?;

        let owner = request.upload_context();
        for projection in &self.projections {
            if let Projection::Attachments { field, entity_key } = projection {
                let urls = request
                    .stager
                    .resolve_urls(field, request.fields.list(field), &owner)
                    .await?;
                patch.insert(
                    entity_key.clone(),
                    JsonValue::Array(urls.into_iter().map(JsonValue::String).collect()),
                );
            }
        }

        debug!(
            resource = %self.resource,
            step = request.step,
            keys = ?patch.keys().collect::<Vec<_>>(),
            "persisting step"
        );

        match request.entity_id {
            None => self.backend.create(&self.resource, patch).await,
            Some(id) => self.backend.update(&self.resource, id, patch).await,
        }
    }
}

impl fmt::Debug for ProjectingAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectingAdapter")
            .field("resource", &self.resource)
            .field("projections", &self.projections)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_list;
    use crate::{AttachmentPolicy, MemoryUploader, PickedFile};
    use serde_json::json;
    use strum::{AsRefStr, EnumString};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
    #[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
    enum Parking {
        Garage,
        Street,
        #[default]
        None,
    }

    fn stager() -> (AttachmentStager, MemoryUploader) {
        let uploader = MemoryUploader::default();
        (
            AttachmentStager::new(AttachmentPolicy::default(), Arc::new(uploader.clone())),
            uploader,
        )
    }

    fn request<'a>(
        fields: &'a FieldStore,
        entity_id: Option<&'a EntityId>,
        stager: &'a AttachmentStager,
    ) -> PersistRequest<'a> {
        PersistRequest {
            flow_id: "test",
            step: "basics",
            fields,
            entity_id,
            completed_steps: &[],
            stager,
        }
    }

    #[test]
    fn test_entity_helpers() {
        let mut data = JsonMap::new();
        data.insert("name".to_string(), json!("Elm"));
        data.insert("amenities".to_string(), json!([]));
        data.insert("wizard_completed_steps".to_string(), json!(["basics"]));
        let entity = Entity::new(EntityId::new("e1"), data);

        assert!(entity.is_present("name"));
        assert!(!entity.is_present("amenities"));
        assert!(!entity.all_present(&["name", "address"]));
        assert_eq!(
            entity.completed_steps("wizard_completed_steps"),
            Some(vec!["basics".to_string()])
        );
        assert_eq!(entity.completed_steps("other"), None);
        assert_eq!(entity.id.to_string(), "e1");
    }

    #[test]
    fn test_project_only_declared_fields() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let adapter = ProjectingAdapter::new("properties", backend)
            .copy("name")
            .copy_as("street", "address_line1")
            .normalized("parking", normalize_list::<Parking>);

        let mut fields = FieldStore::new();
        fields.update_field("name", json!("Elm Street Lofts"));
        fields.update_field("street", json!("12 Elm St"));
        fields.update_field("parking", json!(["street", "garage", "valet"]));
        fields.update_field("rent", json!(1800));

        let (stager, _) = stager();
        let patch = adapter.project(&request(&fields, None, &stager)).unwrap();

        assert_eq!(patch.get("name"), Some(&json!("Elm Street Lofts")));
        assert_eq!(patch.get("address_line1"), Some(&json!("12 Elm St")));
        assert_eq!(patch.get("parking"), Some(&json!(["STREET", "GARAGE"])));
        assert!(patch.get("rent").is_none());
        assert!(patch.get("street").is_none());
    }

    #[test]
    fn test_normalized_absent_field_defaults_to_none() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let adapter = ProjectingAdapter::new("properties", backend)
            .normalized("parking", normalize_list::<Parking>);
        let fields = FieldStore::new();
        let (stager, _) = stager();
        let patch = adapter.project(&request(&fields, None, &stager)).unwrap();
        assert_eq!(patch.get("parking"), Some(&json!(["NONE"])));
    }

    #[test]
    fn test_required_field_missing() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let adapter = ProjectingAdapter::new("properties", backend).require("name");
        let mut fields = FieldStore::new();
        fields.update_field("name", json!("  "));
        let (stager, _) = stager();
        let result = adapter.project(&request(&fields, None, &stager));
        match result {
            Err(StepwiseError::Validation { field, .. }) => assert_eq!(field, "name"),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_completion_marker_appends_current_step() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let adapter = ProjectingAdapter::new("properties", backend).mark_completion("done");
        let fields = FieldStore::new();
        let (stager, _) = stager();
        let mut req = request(&fields, None, &stager);
        req.completed_steps = &["welcome"];
        let patch = adapter.project(&req).unwrap();
        assert_eq!(patch.get("done"), Some(&json!(["welcome", "basics"])));
    }

    #[tokio::test]
    async fn test_persist_creates_then_updates() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let adapter = ProjectingAdapter::new("properties", backend.clone())
            .copy("name")
            .with_static("status", json!("DRAFT"));
        let (stager, _) = stager();

        let mut fields = FieldStore::new();
        fields.update_field("name", json!("Birch"));
        let created = adapter.persist(request(&fields, None, &stager)).await.unwrap();
        assert_eq!(created.get("status"), Some(&json!("DRAFT")));

        fields.update_field("name", json!("Birch Row"));
        let updated = adapter
            .persist(request(&fields, Some(&created.id), &stager))
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.get("name"), Some(&json!("Birch Row")));
        assert_eq!(backend.create_count(), 1);
        assert_eq!(backend.update_count(), 1);
    }

    #[tokio::test]
    async fn test_persist_commits_attachments_before_submitting() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let adapter = ProjectingAdapter::new("properties", backend.clone()).attachments_as("photos", "gallery");
        let (stager, uploader) = stager();
        let staged = stager
            .stage(PickedFile::new("front.png", "image/png", vec![1, 2, 3]))
            .unwrap();

        let mut fields = FieldStore::new();
        fields.update_field("photos", json!([staged.id.token()]));

        let entity = adapter.persist(request(&fields, None, &stager)).await.unwrap();
        let gallery = entity.get("gallery").and_then(JsonValue::as_array).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].as_str(), staged.committed_url());
        assert_eq!(uploader.upload_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_aborts_before_backend_write() {
        let backend = Arc::new(MemoryEntityBackend::new());
        let adapter = ProjectingAdapter::new("properties", backend.clone()).attachments("photos");
        let (stager, uploader) = stager();
        let staged = stager
            .stage(PickedFile::new("front.png", "image/png", vec![1]))
            .unwrap();
        uploader.fail_next(1);

        let mut fields = FieldStore::new();
        fields.update_field("photos", json!([staged.id.token()]));

        let result = adapter.persist(request(&fields, None, &stager)).await;
        assert!(matches!(result, Err(StepwiseError::Upload(_))));
        assert_eq!(backend.create_count(), 0);
    }
}
