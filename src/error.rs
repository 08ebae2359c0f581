//! Error types for the publication pipeline.
//!
//! A busy build lock is not represented here: it is a scheduling signal
//! returned as [`crate::build::Dispatch::AlreadyBuilding`].

use serde::Serialize;
use thiserror::Error;

use crate::resource::{ResourceType, SubmissionId};
use crate::store::StoreError;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PublisherError>;

/// Pipeline step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Create,
    Mirror,
    Compress,
    Download,
    Pull,
    Export,
    Upload,
    Delete,
    Publish,
    Receipt,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Mirror => "mirror",
            Self::Compress => "compress",
            Self::Download => "download",
            Self::Pull => "pull",
            Self::Export => "export",
            Self::Upload => "upload",
            Self::Delete => "delete",
            Self::Publish => "publish",
            Self::Receipt => "receipt",
        };
        f.write_str(name)
    }
}

/// One failed item inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub resource: ResourceType,
    pub step: Step,
    pub reason: String,
}

/// What was expected on disk but missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum StateProblem {
    /// No deposit record exists for the submission.
    NoRecord,

    /// The record has no deposit for the requested resource.
    NoDeposit { resource: ResourceType },

    /// Publish refused: these resources have no upload receipt.
    MissingUploads { resources: Vec<ResourceType> },
}

impl std::fmt::Display for StateProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRecord => write!(f, "no deposit record"),
            Self::NoDeposit { resource } => write!(f, "no deposit for {}", resource),
            Self::MissingUploads { resources } => {
                let names: Vec<&str> = resources.iter().map(|r| r.as_str()).collect();
                write!(f, "missing uploads for {}", names.join(", "))
            }
        }
    }
}

/// Errors surfaced by the deposit orchestrator and build dispatcher.
#[derive(Debug, Error)]
pub enum PublisherError {
    /// A request is missing a required field or carries a malformed one.
    #[error("invalid request: {0}")]
    Validation(String),

    /// An external service call failed or returned non-success.
    #[error("submission {submission}: {step} failed{}: {message}", .resource.map(|r| format!(" for {}", r)).unwrap_or_default())]
    RemoteUnavailable {
        submission: SubmissionId,
        resource: Option<ResourceType>,
        step: Step,
        message: String,
    },

    /// A local artifact step (compress, mirror, export) failed.
    #[error("submission {submission}: {step} failed for {resource}: {message}")]
    Artifact {
        submission: SubmissionId,
        resource: ResourceType,
        step: Step,
        message: String,
    },

    /// Expected record or receipt missing.
    #[error("submission {submission}: {problem}")]
    InconsistentState {
        submission: SubmissionId,
        problem: StateProblem,
    },

    /// A batch aborted; `compensated` lists deposits rolled back.
    #[error("submission {submission}: {} item(s) failed", .failures.len())]
    PartialBatchFailure {
        submission: SubmissionId,
        failures: Vec<ItemFailure>,
        compensated: Vec<ResourceType>,
    },

    /// Local state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PublisherError {
    /// Submission the error refers to, if any.
    pub fn submission(&self) -> Option<SubmissionId> {
        match self {
            Self::RemoteUnavailable { submission, .. }
            | Self::Artifact { submission, .. }
            | Self::InconsistentState { submission, .. }
            | Self::PartialBatchFailure { submission, .. } => Some(*submission),
            Self::Validation(_) | Self::Store(_) => None,
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::RemoteUnavailable { .. } => "remote_unavailable",
            Self::Artifact { .. } => "artifact_failed",
            Self::InconsistentState { .. } => "inconsistent_state",
            Self::PartialBatchFailure { .. } => "partial_batch_failure",
            Self::Store(_) => "storage_error",
        }
    }
}
