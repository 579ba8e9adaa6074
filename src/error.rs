//! Error types for the Stepwise wizard engine.
//!
//! This module defines the error taxonomy used throughout the crate. The
//! recoverable kinds (validation, media, upload, network) are caught at the
//! [`WizardController`](crate::WizardController) boundary and turned into a
//! per-step [`StepFailure`](crate::StepFailure); the rest propagate.

use thiserror::Error;

/// The main error type for Stepwise operations.
///
/// This enum uses `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking backward compatibility.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StepwiseError {
    /// A required field is missing or malformed.
    #[error("Validation error on `{field}`: {message}")]
    Validation {
        /// The offending field name.
        field: String,
        /// Human-readable explanation.
        message: String,
    },

    /// An attachment was rejected at selection time.
    #[error("Unsupported media `{media_type}`: {reason}")]
    UnsupportedMedia {
        /// The media type reported for the picked file.
        media_type: String,
        /// Why the file was rejected.
        reason: String,
    },

    /// Committing a staged attachment failed.
    #[error("Upload error: {0}")]
    Upload(String),

    /// A backend call failed for reasons other than validation.
    #[error("Network error: {0}")]
    Network(String),

    /// The flow definition is invalid (cycle, unknown step, bad branch).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The wizard session was torn down.
    #[error("Wizard session is closed")]
    SessionClosed,

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Loading [`StepwiseConfig`](crate::StepwiseConfig) failed.
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Database error (for the SQLite entity backend).
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(String),
}

impl StepwiseError {
    /// Creates a validation error for `field`.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if the user can fix the problem and retry the step.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::UnsupportedMedia { .. }
                | Self::Upload(_)
                | Self::Network(_)
        )
    }

    /// Returns the failure kind used for per-step reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::UnsupportedMedia { .. } => ErrorKind::UnsupportedMedia,
            Self::Upload(_) => ErrorKind::Upload,
            Self::Network(_) => ErrorKind::Network,
            _ => ErrorKind::Internal,
        }
    }
}

/// Classification of a step failure surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed field; reported inline.
    Validation,
    /// Attachment rejected at selection.
    UnsupportedMedia,
    /// Attachment commit failed; retry is possible.
    Upload,
    /// Backend call failed; retry is possible.
    Network,
    /// Anything else.
    Internal,
}

/// A specialized `Result` type for Stepwise operations.
pub type Result<T> = std::result::Result<T, StepwiseError>;
