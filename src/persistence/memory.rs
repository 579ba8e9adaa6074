//! In-memory entity backend implementation.
//!
//! This module provides [`MemoryEntityBackend`], a thread-safe in-memory
//! implementation of [`EntityBackend`] suitable for testing and demos.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Entity, EntityBackend, EntityId};
use crate::{Result, StepwiseError};

/// Entities indexed by (resource, id).
type Storage = HashMap<(String, EntityId), Entity>;

/// An in-memory implementation of [`EntityBackend`].
///
/// This implementation uses `Arc<RwLock<...>>` internally, making it safe
/// to clone and share across async tasks. Each call yields once to the
/// runtime so that callers observe a real suspension point, like a network
/// hop.
///
/// # Example
///
/// ```
/// use stepwise::{EntityBackend, MemoryEntityBackend};
/// use serde_json::json;
///
/// # async fn example() -> stepwise::Result<()> {
/// let backend = MemoryEntityBackend::new();
/// let mut data = serde_json::Map::new();
/// data.insert("name".to_string(), json!("Cedar House"));
///
/// let entity = backend.create("properties", data).await?;
/// let fetched = backend.fetch("properties", &entity.id).await?;
/// assert_eq!(fetched, Some(entity));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryEntityBackend {
    storage: Arc<RwLock<Storage>>,
    creates: Arc<AtomicU32>,
    updates: Arc<AtomicU32>,
    failures_left: Arc<AtomicU32>,
}

impl MemoryEntityBackend {
    /// Creates a new, empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` create/update calls fail with a network
    /// error.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Returns the number of successful creates.
    pub fn create_count(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Returns the number of successful updates.
    pub fn update_count(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }

    /// Returns the number of stored entities.
    pub async fn entity_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Inserts an entity directly, e.g. to seed a resume scenario.
    pub async fn insert(&self, resource: &str, entity: Entity) {
        self.storage
            .write()
            .await
            .insert((resource.to_string(), entity.id.clone()), entity);
    }

    fn take_failure(&self) -> Result<()> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            Err(StepwiseError::Network("backend unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EntityBackend for MemoryEntityBackend {
    async fn create(&self, resource: &str, data: JsonMap<String, JsonValue>) -> Result<Entity> {
        tokio::task::yield_now().await;
        self.take_failure()?;

        let id = EntityId::new(Uuid::new_v4().to_string());
        let mut data = data;
        data.insert(
            "updated_at".to_string(),
            JsonValue::String(Utc::now().to_rfc3339()),
        );
        let entity = Entity::new(id.clone(), data);
        self.storage
            .write()
            .await
            .insert((resource.to_string(), id), entity.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(entity)
    }

    async fn update(
        &self,
        resource: &str,
        id: &EntityId,
        patch: JsonMap<String, JsonValue>,
    ) -> Result<Entity> {
        tokio::task::yield_now().await;
        self.take_failure()?;

        let mut storage = self.storage.write().await;
        let entity = storage
            .get_mut(&(resource.to_string(), id.clone()))
            .ok_or_else(|| StepwiseError::Network(format!("{resource}/{id} not found")))?;
        for (key, value) in patch {
            entity.data.insert(key, value);
        }
        entity.data.insert(
            "updated_at".to_string(),
            JsonValue::String(Utc::now().to_rfc3339()),
        );
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(entity.clone())
    }

    async fn fetch(&self, resource: &str, id: &EntityId) -> Result<Option<Entity>> {
        let storage = self.storage.read().await;
        Ok(storage.get(&(resource.to_string(), id.clone())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, JsonValue)]) -> JsonMap<String, JsonValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_new_backend_is_empty() {
        let backend = MemoryEntityBackend::new();
        assert_eq!(backend.entity_count().await, 0);
        assert_eq!(backend.create_count(), 0);
    }

    #[tokio::test]
    async fn test_create_assigns_id() {
        let backend = MemoryEntityBackend::new();
        let a = backend.create("units", data(&[("n", json!(1))])).await.unwrap();
        let b = backend.create("units", data(&[("n", json!(2))])).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(backend.entity_count().await, 2);
        assert!(a.get("updated_at").is_some());
    }

    #[tokio::test]
    async fn test_update_merges_patch() {
        let backend = MemoryEntityBackend::new();
        let created = backend
            .create("units", data(&[("name", json!("2B")), ("beds", json!(2))]))
            .await
            .unwrap();
        let updated = backend
            .update("units", &created.id, data(&[("beds", json!(3))]))
            .await
            .unwrap();
        assert_eq!(updated.get("name"), Some(&json!("2B")));
        assert_eq!(updated.get("beds"), Some(&json!(3)));
        assert_eq!(backend.update_count(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_entity() {
        let backend = MemoryEntityBackend::new();
        let result = backend
            .update("units", &EntityId::new("missing"), JsonMap::new())
            .await;
        assert!(matches!(result, Err(StepwiseError::Network(_))));
    }

    #[tokio::test]
    async fn test_resources_are_separate() {
        let backend = MemoryEntityBackend::new();
        let created = backend.create("units", JsonMap::new()).await.unwrap();
        assert!(backend.fetch("properties", &created.id).await.unwrap().is_none());
        assert!(backend.fetch("units", &created.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fail_next() {
        let backend = MemoryEntityBackend::new();
        backend.fail_next(1);
        assert!(backend.create("units", JsonMap::new()).await.is_err());
        assert!(backend.create("units", JsonMap::new()).await.is_ok());
        assert_eq!(backend.create_count(), 1);
    }

    #[tokio::test]
    async fn test_insert_seeds_entity() {
        let backend = MemoryEntityBackend::new();
        let entity = Entity::new(EntityId::new("p-9"), data(&[("name", json!("Seeded"))]));
        backend.insert("properties", entity.clone()).await;
        assert_eq!(
            backend.fetch("properties", &EntityId::new("p-9")).await.unwrap(),
            Some(entity)
        );
    }
}
