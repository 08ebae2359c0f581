//! NeuroLibre publisher - build dispatch and Zenodo archival for reviewed
//! preprints.
//!
//! Once a submission is accepted, its artifacts (built book, source
//! repository, dataset, Docker image) are archived to Zenodo so each gets
//! a DOI linked to the parent preprint.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         HTTP API (axum)                          │
//! │  /resources/books          /zenodo/{create,upload,flush,publish} │
//! └───────────────┬───────────────────────────────┬──────────────────┘
//!                 │                               │
//! ┌───────────────┴──────────────┐ ┌──────────────┴──────────────────┐
//! │       BUILD DISPATCHER       │ │      DEPOSIT ORCHESTRATOR       │
//! │  lock per (provider,org,repo)│ │  all-or-nothing create          │
//! │  streams BinderHub output    │ │  receipts gate publish          │
//! └───────┬───────────────┬──────┘ └──────┬──────────────┬───────────┘
//!         │               │               │              │
//!    LockStore      BuildTrigger   ResourceArchiver   DepositApi
//!   (lock files)    (BinderHub)    + ArtifactTools    (Zenodo)
//!                                         │
//!                                    DepositStore
//!                               (JSON records, receipts)
//! ```
//!
//! All coordination between requests goes through the filesystem: lock
//! markers, deposit records and receipt files. No in-memory state is
//! shared across operations.

// === Core Modules ===

/// Submission identifiers and resource kinds.
pub mod resource;

/// Error types.
pub mod error;

/// Configuration.
pub mod config;

/// Build lock markers.
pub mod lock;

/// Deposit records and receipts on disk.
pub mod store;

// === Pipeline ===

/// Local archive production.
pub mod archiver;

/// Zenodo deposition client.
pub mod zenodo;

/// Deposit orchestration.
pub mod deposit;

/// BinderHub build dispatch.
pub mod build;

/// REST API.
pub mod api;

// === Re-exports ===

pub use build::{BuildDispatcher, BuildRequest, Dispatch};
pub use config::PublisherConfig;
pub use deposit::{DepositOrchestrator, SubmissionMetadata};
pub use error::{PublisherError, Result};
pub use resource::{ResourceType, SubmissionId};
