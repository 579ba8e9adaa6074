//! # Stepwise
//!
//! A resumable, branching, per-step-persisted multi-step wizard engine.
//!
//! Stepwise drives a user through a fixed sequence of steps whose routing
//! may branch on what they entered so far. Steps can persist a slice of the
//! draft to a backend entity as the user goes, so that a session can be
//! resumed later from whatever the entity already holds. It is designed for
//! **form-heavy creation flows** where:
//!
//! - Each step is persisted before the user moves on (create, then patch)
//! - Branches depend on earlier answers (e.g. "pets allowed?")
//! - Re-entering users land on the furthest step they can continue from
//! - File uploads are previewed locally and only committed on advance
//! - Leaving with unsaved edits must be confirmed
//!
//! ## Quick Example
//!
//! ```
//! use stepwise::{AdvanceOutcome, FieldStore, StepGraph, StepKey, WizardController};
//! use serde_json::json;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
//! enum Signup { Account, Team, Plan }
//!
//! impl StepKey for Signup {
//!     fn name(&self) -> &'static str {
//!         match self { Self::Account => "account", Self::Team => "team", Self::Plan => "plan" }
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> stepwise::Result<()> {
//! let graph = StepGraph::builder("signup")
//!     .branch(Signup::Account, [Signup::Team, Signup::Plan], |fields: &FieldStore| {
//!         if fields.flag("is_team") { Signup::Team } else { Signup::Plan }
//!     })
//!     .fixed(Signup::Team, Signup::Plan)
//!     .terminal(Signup::Plan)
//!     .build()?;
//!
//! let wizard = WizardController::builder(graph).build();
//! wizard.update_field("is_team", json!(false))?;
//! assert_eq!(
//!     wizard.advance().await?,
//!     AdvanceOutcome::Advanced { from: Signup::Account, to: Signup::Plan }
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Bundled flows
//!
//! [`flows`] ships property creation, unit listing, and maintenance intake
//! definitions built on the same engine.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

pub mod attachment;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod field_store;
pub mod flows;
pub mod graph;
pub mod guard;
pub mod normalize;
pub mod persistence;
pub mod progress;
pub mod resume;
pub mod step;

pub use attachment::{
    AttachmentId, AttachmentStager, FileUploader, MemoryUploader, PickedFile, StagedAttachment,
    UploadContext, UploadedFile,
};
pub use config::{AttachmentPolicy, StepwiseConfig};
pub use controller::{
    AdvanceOutcome, ControllerBuilder, FieldMapping, ResumeOutcome, StepFailure, WizardController,
    WizardSession,
};
pub use error::{ErrorKind, Result, StepwiseError};
pub use event::WizardEvent;
pub use field_store::FieldStore;
pub use graph::{FlowBuilder, StepGraph};
pub use guard::{
    ConfirmPrompt, GuardState, NavigationGuard, NavigationOutcome, Router, UnguardReason,
    UnloadDecision,
};
pub use persistence::{
    Entity, EntityBackend, EntityId, MemoryEntityBackend, PersistRequest, PersistenceAdapter,
    ProjectingAdapter,
};
pub use progress::{FlowProgress, StepProgressEntry, StepStatus};
pub use resume::{ResumeBasis, ResumeDecision, ResumeResolver};
pub use step::{BranchSelector, Routing, StepDefinition, StepKey};

#[cfg(feature = "sqlite")]
pub use persistence::SqliteEntityBackend;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_returns_valid_semver() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
