//! Engine configuration.
//!
//! [`StepwiseConfig`] is layered with the `config` crate: embedded defaults,
//! then an optional file, then `STEPWISE__*` environment variables
//! (`STEPWISE__ATTACHMENTS__MAX_BYTES=1048576`).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Default channel capacity for wizard events.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default entity key holding the explicit completion marker.
pub const DEFAULT_COMPLETION_MARKER_KEY: &str = "wizard_completed_steps";

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepwiseConfig {
    /// Attachment acceptance policy.
    pub attachments: AttachmentPolicy,
    /// Capacity of the wizard event broadcast channel.
    pub event_channel_capacity: usize,
    /// Message shown by the navigation guard.
    pub confirm_message: String,
    /// Entity key that lists the steps completed so far.
    pub completion_marker_key: String,
}

impl Default for StepwiseConfig {
    fn default() -> Self {
        Self {
            attachments: AttachmentPolicy::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            confirm_message: "You have unsaved changes. Leave this page?".to_string(),
            completion_marker_key: DEFAULT_COMPLETION_MARKER_KEY.to_string(),
        }
    }
}

impl StepwiseConfig {
    /// Loads configuration from defaults, an optional file, and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Config`](crate::StepwiseError::Config) if a
    /// source cannot be read or the merged result does not deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = serde_json::to_string(&Self::default())?;
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults,
            config::FileFormat::Json,
        ));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STEPWISE")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("attachments.allowed_media_types")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

/// Which picked files the attachment stager accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentPolicy {
    /// Accepted media types; `type/*` accepts a whole family.
    pub allowed_media_types: Vec<String>,
    /// Maximum accepted file size in bytes.
    pub max_bytes: u64,
    /// Scheme of local preview URLs.
    pub preview_scheme: String,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            allowed_media_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
                "image/heic".to_string(),
                "application/pdf".to_string(),
            ],
            max_bytes: 10 * 1024 * 1024,
            preview_scheme: "blob".to_string(),
        }
    }
}

impl AttachmentPolicy {
    /// Returns true if `media_type` is on the allow-list.
    ///
    /// Parameters (`; charset=...`) and case are ignored.
    pub fn allows(&self, media_type: &str) -> bool {
        let essence = media_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence.is_empty() {
            return false;
        }
        self.allowed_media_types.iter().any(|allowed| {
            let allowed = allowed.trim().to_ascii_lowercase();
            match allowed.strip_suffix("/*") {
                Some(family) => essence
                    .split_once('/')
                    .is_some_and(|(head, _)| head == family),
                None => allowed == essence,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StepwiseConfig::default();
        assert_eq!(config.event_channel_capacity, DEFAULT_EVENT_CHANNEL_CAPACITY);
        assert_eq!(config.completion_marker_key, "wizard_completed_steps");
        assert!(config.attachments.allows("image/png"));
    }

    #[test]
    fn test_allows_ignores_case_and_parameters() {
        let policy = AttachmentPolicy::default();
        assert!(policy.allows("IMAGE/JPEG"));
        assert!(policy.allows("application/pdf; name=lease.pdf"));
        assert!(!policy.allows("application/zip"));
        assert!(!policy.allows(""));
    }

    #[test]
    fn test_allows_family_wildcard() {
        let policy = AttachmentPolicy {
            allowed_media_types: vec!["video/*".to_string()],
            ..AttachmentPolicy::default()
        };
        assert!(policy.allows("video/mp4"));
        assert!(!policy.allows("image/png"));
        assert!(!policy.allows("video"));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = StepwiseConfig::load(None).unwrap();
        assert_eq!(config.attachments.preview_scheme, "blob");
    }

    #[test]
    fn test_load_from_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "event_channel_capacity = 16\n[attachments]\nmax_bytes = 2048\nallowed_media_types = [\"image/png\"]"
        )
        .unwrap();

        let config = StepwiseConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.event_channel_capacity, 16);
        assert_eq!(config.attachments.max_bytes, 2048);
        assert!(!config.attachments.allows("image/jpeg"));
        assert_eq!(config.confirm_message, StepwiseConfig::default().confirm_message);
    }
}
