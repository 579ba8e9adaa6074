//! SQLite-backed entity backend implementation.
//!
//! This module provides [`SqliteEntityBackend`], a persistent implementation
//! of [`EntityBackend`] backed by SQLite. It stands in for the remote entity
//! API when drafts must survive process restarts (local tooling, kiosks,
//! integration tests).

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Entity, EntityBackend, EntityId};
use crate::{Result, StepwiseError};

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// SQL for creating the entities table.
const CREATE_ENTITIES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS entities (
        resource TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        data_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (resource, entity_id)
    )
"#;

/// SQL for creating the schema_version table.
const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )
"#;

/// A SQLite-backed implementation of [`EntityBackend`].
///
/// # Thread Safety
///
/// The backend wraps the SQLite connection in a `Mutex` and uses
/// `spawn_blocking` for all database operations, making it safe for use in
/// async contexts.
///
/// # Example
///
/// ```rust,ignore
/// use stepwise::SqliteEntityBackend;
///
/// let backend = SqliteEntityBackend::open("drafts.db").await?;
/// // Or, for tests:
/// let backend = SqliteEntityBackend::open_in_memory().await?;
/// ```
pub struct SqliteEntityBackend {
    conn: Arc<Mutex<Connection>>,
}

fn blocking_failed(e: tokio::task::JoinError) -> StepwiseError {
    StepwiseError::Database(format!("spawn_blocking failed: {}", e))
}

impl SqliteEntityBackend {
    /// Opens a SQLite database at the given path.
    ///
    /// Creates the database and schema if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Database`] if the database cannot be opened
    /// or the schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let conn = tokio::task::spawn_blocking(move || Connection::open(&path))
            .await
            .map_err(blocking_failed)?
            .map_err(|e| StepwiseError::Database(format!("failed to open database: {}", e)))?;

        let backend = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Opens an in-memory SQLite database.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Database`] if the database cannot be created.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(Connection::open_in_memory)
            .await
            .map_err(blocking_failed)?
            .map_err(|e| {
                StepwiseError::Database(format!("failed to open in-memory database: {}", e))
            })?;

        let backend = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    async fn run_migrations(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(CREATE_SCHEMA_VERSION_TABLE, [])?;

            let version: Option<i32> = conn
                .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()?;

            if version.map_or(true, |v| v < SCHEMA_VERSION) {
                conn.execute(CREATE_ENTITIES_TABLE, [])?;
                conn.execute("DELETE FROM schema_version", [])?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }

            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(blocking_failed)?
        .map_err(|e| StepwiseError::Database(format!("migration failed: {}", e)))
    }

    /// Returns the number of stored entities of `resource`.
    pub async fn entity_count(&self, resource: &str) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let resource = resource.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT COUNT(*) FROM entities WHERE resource = ?1",
                params![resource],
                |row| row.get::<_, i64>(0),
            )
        })
        .await
        .map_err(blocking_failed)?
        .map(|n| usize::try_from(n).unwrap_or_default())
        .map_err(|e| StepwiseError::Database(format!("count failed: {}", e)))
    }

    async fn load(&self, resource: String, id: EntityId) -> Result<Option<Entity>> {
        let conn = Arc::clone(&self.conn);

        let raw = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT data_json FROM entities WHERE resource = ?1 AND entity_id = ?2",
                params![resource, id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|json| json.map(|json| (id, json)))
        })
        .await
        .map_err(blocking_failed)?
        .map_err(|e| StepwiseError::Network(format!("query failed: {}", e)))?;

        match raw {
            Some((id, json)) => {
                let data: JsonMap<String, JsonValue> = serde_json::from_str(&json)?;
                Ok(Some(Entity::new(id, data)))
            }
            None => Ok(None),
        }
    }

    async fn store(&self, resource: &str, entity: &Entity, created: bool) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let resource = resource.to_string();
        let id = entity.id.as_str().to_string();
        let data_json = serde_json::to_string(&entity.data)?;
        let now = chrono::Utc::now().to_rfc3339();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            if created {
                conn.execute(
                    "INSERT INTO entities (resource, entity_id, data_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![resource, id, data_json, now],
                )?;
            } else {
                conn.execute(
                    "UPDATE entities SET data_json = ?3, updated_at = ?4 WHERE resource = ?1 AND entity_id = ?2",
                    params![resource, id, data_json, now],
                )?;
            }
            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(blocking_failed)?
        .map_err(|e| StepwiseError::Network(format!("write failed: {}", e)))
    }
}

// Debug implementation that doesn't expose connection details
impl std::fmt::Debug for SqliteEntityBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEntityBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl EntityBackend for SqliteEntityBackend {
    async fn create(&self, resource: &str, data: JsonMap<String, JsonValue>) -> Result<Entity> {
        let entity = Entity::new(EntityId::new(Uuid::new_v4().to_string()), data);
        self.store(resource, &entity, true).await?;
        Ok(entity)
    }

    async fn update(
        &self,
        resource: &str,
        id: &EntityId,
        patch: JsonMap<String, JsonValue>,
    ) -> Result<Entity> {
        let mut entity = self
            .load(resource.to_string(), id.clone())
            .await?
            .ok_or_else(|| StepwiseError::Network(format!("{resource}/{id} not found")))?;
        for (key, value) in patch {
            entity.data.insert(key, value);
        }
        self.store(resource, &entity, false).await?;
        Ok(entity)
    }

    async fn fetch(&self, resource: &str, id: &EntityId) -> Result<Option<Entity>> {
        self.load(resource.to_string(), id.clone()).await
    }
}
