//! Local staging and deferred upload of picked files.
//!
//! A file picked by the user is first *staged*: checked against the
//! [`AttachmentPolicy`], given a local preview URL, and held in memory. The
//! upload happens only when the step owning the attachment is persisted, via
//! [`AttachmentStager::commit`]. Field values reference staged files by
//! token (`staged:<uuid>`); already-uploaded files are plain URLs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{AttachmentPolicy, EntityId, Result, StepwiseError};

const TOKEN_PREFIX: &str = "staged:";

/// Identifier of a staged attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentId(Uuid);

impl AttachmentId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the field-store token referencing this attachment.
    pub fn token(&self) -> String {
        format!("{TOKEN_PREFIX}{}", self.0)
    }

    /// Returns the token as a JSON value, ready for a list field.
    pub fn to_field_value(&self) -> JsonValue {
        JsonValue::String(self.token())
    }

    /// Parses a field-store token.
    pub fn from_token(token: &str) -> Option<Self> {
        token
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .map(Self)
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file the user picked, before staging.
#[derive(Clone, PartialEq, Eq)]
pub struct PickedFile {
    /// Original file name.
    pub file_name: String,
    /// Reported media type.
    pub media_type: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

impl PickedFile {
    /// Creates a picked file.
    pub fn new(
        file_name: impl Into<String>,
        media_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            media_type: media_type.into(),
            bytes: bytes.into(),
        }
    }
}

impl fmt::Debug for PickedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickedFile")
            .field("file_name", &self.file_name)
            .field("media_type", &self.media_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A locally staged file.
///
/// Clones share the commit state, so a URL obtained through one clone is
/// visible through all of them.
#[derive(Clone)]
pub struct StagedAttachment {
    /// Attachment identifier.
    pub id: AttachmentId,
    /// Original file name.
    pub file_name: String,
    /// Normalized media type.
    pub media_type: String,
    /// Local bytes, kept until the session ends.
    pub local_handle: Arc<[u8]>,
    /// Locally servable preview reference, valid for the session only.
    pub preview_url: String,
    /// When the file was staged.
    pub staged_at: DateTime<Utc>,
    committed: Arc<OnceCell<String>>,
}

impl StagedAttachment {
    /// Returns the uploaded URL, once committed.
    pub fn committed_url(&self) -> Option<&str> {
        self.committed.get().map(String::as_str)
    }

    /// Returns true once the upload succeeded.
    pub fn is_committed(&self) -> bool {
        self.committed.initialized()
    }

    /// Returns the size in bytes.
    pub fn size(&self) -> usize {
        self.local_handle.len()
    }
}

impl fmt::Debug for StagedAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedAttachment")
            .field("id", &self.id)
            .field("file_name", &self.file_name)
            .field("media_type", &self.media_type)
            .field("size", &self.size())
            .field("preview_url", &self.preview_url)
            .field("committed_url", &self.committed_url())
            .finish()
    }
}

/// Who an upload belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadContext {
    /// Flow the attachment was picked in.
    pub flow_id: String,
    /// Step that owns the attachment.
    pub step: String,
    /// Backend entity the attachment will be attached to, if created.
    pub entity_id: Option<EntityId>,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Durable URL of the uploaded file.
    pub url: String,
}

/// The file upload collaborator.
///
/// Only [`AttachmentStager::commit`] calls it.
#[async_trait]
pub trait FileUploader: fmt::Debug + Send + Sync {
    /// Uploads one staged file.
    ///
    /// # Errors
    ///
    /// Implementations return [`StepwiseError::Upload`] on failure.
    async fn upload(
        &self,
        file: &StagedAttachment,
        owner: &UploadContext,
    ) -> Result<UploadedFile>;
}

/// An in-memory [`FileUploader`] for tests and demos.
///
/// Produces `{base_url}/{entity}/{attachment}/{file_name}` URLs and can be
/// told to fail the next N uploads.
#[derive(Debug, Clone)]
pub struct MemoryUploader {
    base_url: String,
    uploads: Arc<AtomicU32>,
    failures_left: Arc<AtomicU32>,
}

impl MemoryUploader {
    /// Creates an uploader producing URLs under `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            uploads: Arc::new(AtomicU32::new(0)),
            failures_left: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Makes the next `count` uploads fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Returns the number of successful uploads.
    pub fn upload_count(&self) -> u32 {
        self.uploads.load(Ordering::SeqCst)
    }
}

impl Default for MemoryUploader {
    fn default() -> Self {
        Self::new("https://files.example.test")
    }
}

#[async_trait]
impl FileUploader for MemoryUploader {
    async fn upload(
        &self,
        file: &StagedAttachment,
        owner: &UploadContext,
    ) -> Result<UploadedFile> {
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StepwiseError::Upload(format!(
                "upload of `{}` rejected",
                file.file_name
            )));
        }
        tokio::task::yield_now().await;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let owner_segment = owner
            .entity_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unowned".to_string());
        Ok(UploadedFile {
            url: format!(
                "{}/{}/{}/{}",
                self.base_url, owner_segment, file.id, file.file_name
            ),
        })
    }
}

/// Stages picked files and commits them lazily.
///
/// # Example
///
/// ```
/// use stepwise::{AttachmentPolicy, AttachmentStager, MemoryUploader, PickedFile};
/// use std::sync::Arc;
///
/// let stager = AttachmentStager::new(AttachmentPolicy::default(), Arc::new(MemoryUploader::default()));
/// let staged = stager.stage(PickedFile::new("front.jpg", "image/jpeg", vec![0xFF, 0xD8]))?;
/// assert!(staged.preview_url.starts_with("blob://"));
/// assert!(staged.committed_url().is_none());
///
/// let rejected = stager.stage(PickedFile::new("setup.exe", "application/x-msdownload", vec![0x4D]));
/// assert!(rejected.is_err());
/// # Ok::<(), stepwise::StepwiseError>(())
/// ```
pub struct AttachmentStager {
    policy: AttachmentPolicy,
    uploader: Arc<dyn FileUploader>,
    staged: Mutex<HashMap<AttachmentId, StagedAttachment>>,
}

impl AttachmentStager {
    /// Creates a stager with the given policy and upload collaborator.
    pub fn new(policy: AttachmentPolicy, uploader: Arc<dyn FileUploader>) -> Self {
        Self {
            policy,
            uploader,
            staged: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<AttachmentId, StagedAttachment>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the acceptance policy.
    pub fn policy(&self) -> &AttachmentPolicy {
        &self.policy
    }

    /// Stages a picked file.
    ///
    /// Never touches the network.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::UnsupportedMedia`] if the media type is not
    /// allowed or the file is empty or too large. No preview is created in
    /// that case.
    pub fn stage(&self, file: PickedFile) -> Result<StagedAttachment> {
        let media_type = file.media_type.trim().to_ascii_lowercase();
        if !self.policy.allows(&media_type) {
            warn!(media_type = %media_type, file = %file.file_name, "rejected attachment");
            return Err(StepwiseError::UnsupportedMedia {
                media_type,
                reason: "type is not on the allow-list".to_string(),
            });
        }
        if file.bytes.is_empty() {
            return Err(StepwiseError::UnsupportedMedia {
                media_type,
                reason: "file is empty".to_string(),
            });
        }
        if file.bytes.len() as u64 > self.policy.max_bytes {
            return Err(StepwiseError::UnsupportedMedia {
                media_type,
                reason: format!(
                    "file is {} bytes, limit is {}",
                    file.bytes.len(),
                    self.policy.max_bytes
                ),
            });
        }

        let id = AttachmentId::new();
        let staged = StagedAttachment {
            id,
            preview_url: format!("{}://{}/{}", self.policy.preview_scheme, id, file.file_name),
            file_name: file.file_name,
            media_type,
            local_handle: Arc::from(file.bytes),
            staged_at: Utc::now(),
            committed: Arc::new(OnceCell::new()),
        };
        debug!(attachment = %id, "staged attachment");
        self.registry().insert(id, staged.clone());
        Ok(staged)
    }

    /// Returns a staged attachment by id.
    pub fn get(&self, id: AttachmentId) -> Option<StagedAttachment> {
        self.registry().get(&id).cloned()
    }

    /// Drops a staged attachment. Returns true if it existed.
    pub fn discard(&self, id: AttachmentId) -> bool {
        self.registry().remove(&id).is_some()
    }

    /// Drops every staged attachment.
    pub fn clear(&self) {
        self.registry().clear();
    }

    /// Returns the number of staged attachments.
    pub fn staged_count(&self) -> usize {
        self.registry().len()
    }

    /// Returns the ids of attachments not yet committed.
    pub fn pending(&self) -> Vec<AttachmentId> {
        self.registry()
            .values()
            .filter(|a| !a.is_committed())
            .map(|a| a.id)
            .collect()
    }

    /// Uploads a staged attachment and returns its durable URL.
    ///
    /// Idempotent: committing an already committed attachment returns the
    /// existing URL without uploading again, and concurrent commits of the
    /// same attachment share a single upload.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Upload`] if the attachment is unknown or the
    /// upload fails. A failed commit can be retried.
    pub async fn commit(&self, id: AttachmentId, owner: &UploadContext) -> Result<String> {
        let staged = self
            .get(id)
            .ok_or_else(|| StepwiseError::Upload(format!("attachment {id} is not staged")))?;

        let url = staged
            .committed
            .get_or_try_init(|| async {
                let uploaded = self.uploader.upload(&staged, owner).await?;
                info!(attachment = %id, url = %uploaded.url, "committed attachment");
                Ok::<String, StepwiseError>(uploaded.url)
            })
            .await?;
        Ok(url.clone())
    }

    /// Turns a list field into durable URLs, committing staged entries.
    ///
    /// Staged tokens are committed in order; plain URLs (from a resumed
    /// entity) pass through. Local preview URLs are never passed on.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Upload`] if any commit fails and
    /// [`StepwiseError::Validation`] for entries that are neither tokens
    /// nor URLs.
    pub async fn resolve_urls(
        &self,
        field: &str,
        values: &[JsonValue],
        owner: &UploadContext,
    ) -> Result<Vec<String>> {
        let mut urls = Vec::with_capacity(values.len());
        for value in values {
            let Some(raw) = value.as_str() else {
                return Err(StepwiseError::validation(field, "attachment entry is not a string"));
            };
            match AttachmentId::from_token(raw) {
                Some(id) => urls.push(self.commit(id, owner).await?),
                None if raw.starts_with(&format!("{}://", self.policy.preview_scheme)) => {
                    return Err(StepwiseError::validation(
                        field,
                        "local preview cannot be submitted without its staged file",
                    ));
                }
                None => urls.push(raw.to_string()),
            }
        }
        Ok(urls)
    }
}

impl fmt::Debug for AttachmentStager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentStager")
            .field("policy", &self.policy)
            .field("staged", &self.staged_count())
            .finish_non_exhaustive()
    }
}
