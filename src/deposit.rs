//! Deposit orchestration.
//!
//! Drives one submission through `create -> upload -> publish` (and `flush`
//! to tear deposits down again) against a [`DepositApi`], keeping the
//! on-disk [`DepositStore`] consistent with what exists remotely:
//!
//! - `create` is all-or-nothing: a failed deposit rolls back the ones that
//!   succeeded, and the record is persisted once or not at all.
//! - `upload` requires a record entry for the resource and leaves an
//!   [`UploadReceipt`] behind.
//! - `flush` is best effort and reports one outcome per requested type.
//! - `publish` is refused unless every recorded type has been uploaded;
//!   after that each type is published independently.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::archiver::{ArchiveFailure, ArtifactTools, ResourceArchiver, SourceRoots, UploadSource};
use crate::config::PublisherConfig;
use crate::error::{ItemFailure, PublisherError, Result, StateProblem, Step};
use crate::resource::{short_commit, ResourceType, SubmissionId};
use crate::store::{DepositRecord, DepositStore, PublishReceipt, StoreError, UploadReceipt};
use crate::zenodo::{
    Creator, DeleteOutcome, DepositApi, DepositMetadata, RelatedIdentifier, RemoteDeposit,
};

// ============================================================================
// Requests
// ============================================================================

/// Submission-level metadata shared by every deposit of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionMetadata {
    /// Preprint title.
    pub title: String,
    pub creators: Vec<Creator>,
    /// Author's source repository.
    pub source_url: String,
    /// Journal-side fork the book was built from.
    pub fork_url: String,
    pub commit_source: String,
    pub commit_fork: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl SubmissionMetadata {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title is required".to_string());
        }
        if self.creators.is_empty() {
            return Err("at least one creator is required".to_string());
        }
        if self.creators.iter().any(|c| c.name.trim().is_empty()) {
            return Err("creator name is required".to_string());
        }
        for (field, url) in [("source_url", &self.source_url), ("fork_url", &self.fork_url)] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(format!("{} must be an http(s) URL: {}", field, url));
            }
        }
        for (field, commit) in [
            ("commit_source", &self.commit_source),
            ("commit_fork", &self.commit_fork),
        ] {
            if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!("{} is not a hex hash: {:?}", field, commit));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub issue_id: SubmissionId,
    pub resources: Vec<ResourceType>,
    pub metadata: SubmissionMetadata,
}

/// Submission ids start at 1.
fn validate_issue_id(id: SubmissionId) -> std::result::Result<(), String> {
    if id.0 == 0 {
        return Err("issue_id must be positive".to_string());
    }
    Ok(())
}

impl CreateRequest {
    pub fn validate(&self) -> std::result::Result<(), String> {
        validate_issue_id(self.issue_id)?;
        if self.resources.is_empty() {
            return Err("resources must not be empty".to_string());
        }
        self.metadata.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub issue_id: SubmissionId,
    pub source: UploadSource,
}

impl UploadRequest {
    pub fn validate(&self) -> std::result::Result<(), String> {
        validate_issue_id(self.issue_id)?;
        self.source.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushRequest {
    pub issue_id: SubmissionId,
    pub resources: Vec<ResourceType>,
}

impl FlushRequest {
    pub fn validate(&self) -> std::result::Result<(), String> {
        validate_issue_id(self.issue_id)?;
        if self.resources.is_empty() {
            return Err("resources must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub issue_id: SubmissionId,
}

impl PublishRequest {
    pub fn validate(&self) -> std::result::Result<(), String> {
        validate_issue_id(self.issue_id)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of `create`.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A record already existed and was returned untouched.
    Existing(DepositRecord),
    Created(DepositRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &DepositRecord {
        match self {
            Self::Existing(record) | Self::Created(record) => record,
        }
    }

    pub fn into_record(self) -> DepositRecord {
        match self {
            Self::Existing(record) | Self::Created(record) => record,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlushStatus {
    Deleted,
    /// Published deposits cannot be deleted; the record entry is kept.
    AlreadyPublished,
    /// The remote deposit was already gone.
    NotFound,
    /// No record entry for this type; nothing was called.
    NotInRecord,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushOutcome {
    pub resource: ResourceType,
    #[serde(flatten)]
    pub status: FlushStatus,
}

/// Result of `flush`: every per-item outcome, plus the persistence error if
/// the reduced record could not be written. In that case the record on
/// disk still lists the removed entries; flushing again resolves them as
/// `not_found`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub outcomes: Vec<FlushOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_error: Option<String>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.record_error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishStatus {
    Published {
        doi: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        badge: Option<String>,
    },
    /// A publish receipt already existed; nothing was called.
    AlreadyPublished { doi: String },
    RemoteUnavailable { reason: String },
    /// Published remotely, but the receipt could not be written.
    ReceiptFailed { doi: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub resource: ResourceType,
    #[serde(flatten)]
    pub status: PublishStatus,
}

/// Snapshot of a submission's on-disk state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionState {
    pub issue_id: SubmissionId,
    pub deposits: DepositRecord,
    pub uploaded: Vec<ResourceType>,
    pub published: Vec<PublishReceipt>,
}

// ============================================================================
// Pacing
// ============================================================================

/// Spaces consecutive remote calls of one operation by a fixed interval.
#[derive(Debug)]
struct Pacer {
    interval: Duration,
    last_call: Option<Instant>,
}

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: None,
        }
    }

    /// Wait until the next call is allowed. The first call never waits.
    async fn wait(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                let wait_time = self.interval - elapsed;
                debug!(wait_ms = wait_time.as_millis(), "Pacing before Zenodo request");
                tokio::time::sleep(wait_time).await;
            }
        }
        self.last_call = Some(Instant::now());
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Coordinates deposits, archives and receipts for submissions.
#[derive(Clone)]
pub struct DepositOrchestrator {
    store: DepositStore,
    archiver: ResourceArchiver,
    api: Arc<dyn DepositApi>,
    doi_prefix: String,
    journal: String,
    request_delay: Duration,
}

impl DepositOrchestrator {
    pub fn new(
        store: DepositStore,
        archiver: ResourceArchiver,
        api: Arc<dyn DepositApi>,
        doi_prefix: impl Into<String>,
        journal: impl Into<String>,
    ) -> Self {
        Self {
            store,
            archiver,
            api,
            doi_prefix: doi_prefix.into(),
            journal: journal.into(),
            request_delay: crate::config::DEFAULT_REQUEST_DELAY,
        }
    }

    /// Wire store and archiver from configuration.
    pub fn from_config(
        config: &PublisherConfig,
        api: Arc<dyn DepositApi>,
        tools: Arc<dyn ArtifactTools>,
    ) -> Self {
        let store = DepositStore::new(&config.deposit_dir, &config.journal);
        let archiver = ResourceArchiver::new(
            &config.archive_dir,
            &config.doi_prefix,
            &config.journal,
            tools,
        )
        .with_source_roots(SourceRoots {
            book_dir: Some(config.book_dir.clone()),
            dataset_dir: Some(config.dataset_dir.clone()),
        });
        Self::new(store, archiver, api, &config.doi_prefix, &config.journal)
            .with_request_delay(config.request_delay)
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn store(&self) -> &DepositStore {
        &self.store
    }

    /// DOI of the parent preprint every deposit is part of.
    pub fn parent_doi(&self, id: SubmissionId) -> String {
        format!(
            "{}/{}.{}",
            self.doi_prefix,
            self.journal.to_lowercase(),
            id.padded()
        )
    }

    /// Zenodo metadata for one resource of a submission.
    pub fn deposit_metadata(
        &self,
        resource: ResourceType,
        id: SubmissionId,
        meta: &SubmissionMetadata,
    ) -> DepositMetadata {
        let (upload_type, publication_type) = match resource {
            ResourceType::Book => ("publication", Some("book".to_string())),
            ResourceType::Repository | ResourceType::DockerImage => ("software", None),
            ResourceType::Dataset => ("dataset", None),
        };

        DepositMetadata {
            title: format!("{} for {}", resource.label(), meta.title),
            upload_type: upload_type.to_string(),
            publication_type,
            description: describe(resource, &self.journal, meta),
            creators: meta.creators.clone(),
            keywords: meta.keywords.clone(),
            related_identifiers: vec![RelatedIdentifier::is_part_of(self.parent_doi(id))],
        }
    }

    // === create ===

    /// Create one remote deposit per requested type.
    ///
    /// Returns the existing record untouched if one is already on disk.
    pub async fn create(&self, request: &CreateRequest) -> Result<CreateOutcome> {
        request.validate().map_err(PublisherError::Validation)?;
        let id = request.issue_id;

        if let Some(existing) = self.store.load_record(id)? {
            info!(submission = %id, deposits = existing.len(), "Deposit record exists, skipping create");
            return Ok(CreateOutcome::Existing(existing));
        }

        let mut pacer = Pacer::new(self.request_delay);
        let mut created = DepositRecord::new();
        let mut failures = Vec::new();

        for resource in unique(&request.resources) {
            pacer.wait().await;
            let metadata = self.deposit_metadata(resource, id, &request.metadata);
            match self.api.create(&metadata).await {
                Ok(deposit) => {
                    info!(submission = %id, resource = %resource, deposit_id = deposit.id, "Deposit created");
                    created.insert(resource, deposit);
                }
                Err(e) => {
                    warn!(submission = %id, resource = %resource, error = %e, "Deposit create failed");
                    failures.push(ItemFailure {
                        resource,
                        step: Step::Create,
                        reason: e.describe(),
                    });
                }
            }
        }

        if failures.is_empty() {
            return match self.store.insert_record(id, &created) {
                Ok(()) => {
                    info!(submission = %id, deposits = created.len(), "Deposit record written");
                    Ok(CreateOutcome::Created(created))
                }
                Err(StoreError::RecordExists(_)) => {
                    // A concurrent create won the race; ours are surplus.
                    warn!(submission = %id, "Deposit record appeared during create, rolling back");
                    self.compensate(id, &created, &mut pacer, &mut Vec::new())
                        .await;
                    let existing = self.require_record(id)?;
                    Ok(CreateOutcome::Existing(existing))
                }
                Err(e) => {
                    warn!(submission = %id, error = %e, "Failed to persist deposit record, rolling back");
                    self.compensate(id, &created, &mut pacer, &mut Vec::new())
                        .await;
                    Err(e.into())
                }
            };
        }

        let compensated = self.compensate(id, &created, &mut pacer, &mut failures).await;
        Err(PublisherError::PartialBatchFailure {
            submission: id,
            failures,
            compensated,
        })
    }

    /// Delete every deposit in `created`. Returns the types rolled back;
    /// deletions that fail are appended to `failures`.
    async fn compensate(
        &self,
        id: SubmissionId,
        created: &DepositRecord,
        pacer: &mut Pacer,
        failures: &mut Vec<ItemFailure>,
    ) -> Vec<ResourceType> {
        let mut compensated = Vec::new();

        for (resource, deposit) in &created.deposits {
            pacer.wait().await;
            match self.api.delete(&deposit.links.self_url).await {
                Ok(DeleteOutcome::Deleted) | Ok(DeleteOutcome::NotFound) => {
                    debug!(submission = %id, resource = %resource, "Rolled back deposit");
                    compensated.push(*resource);
                }
                Ok(DeleteOutcome::AlreadyPublished) => {
                    warn!(submission = %id, resource = %resource, "Cannot roll back published deposit");
                    failures.push(ItemFailure {
                        resource: *resource,
                        step: Step::Delete,
                        reason: "deposit already published".to_string(),
                    });
                }
                Err(e) => {
                    warn!(submission = %id, resource = %resource, error = %e, "Rollback delete failed");
                    failures.push(ItemFailure {
                        resource: *resource,
                        step: Step::Delete,
                        reason: e.describe(),
                    });
                }
            }
        }

        compensated
    }

    // === upload ===

    /// Archive one resource and upload it into its deposit's bucket.
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadReceipt> {
        request.validate().map_err(PublisherError::Validation)?;
        let source = self
            .archiver
            .resolve(&request.source)
            .map_err(PublisherError::Validation)?;
        let id = request.issue_id;
        let resource = source.resource();

        let record = self.require_record(id)?;
        let deposit = record
            .get(resource)
            .ok_or(PublisherError::InconsistentState {
                submission: id,
                problem: StateProblem::NoDeposit { resource },
            })?;

        let artifact = self
            .archiver
            .produce(id, &source)
            .await
            .map_err(|failure| archive_error(id, resource, failure))?;

        info!(
            submission = %id,
            resource = %resource,
            file = %artifact.file_name,
            "Uploading archive"
        );
        let response = self
            .api
            .upload(&deposit.links.bucket, &artifact.file_name, &artifact.path)
            .await
            .map_err(|e| PublisherError::RemoteUnavailable {
                submission: id,
                resource: Some(resource),
                step: Step::Upload,
                message: e.describe(),
            })?;

        let receipt = UploadReceipt {
            resource,
            submission: id,
            commit: source.commit().to_string(),
            file_name: artifact.file_name,
            response,
            uploaded_at: now_secs(),
        };
        let path = self.store.write_upload_receipt(&receipt)?;
        info!(
            submission = %id,
            resource = %resource,
            commit = short_commit(&receipt.commit),
            receipt = %path.display(),
            "Upload complete"
        );

        Ok(receipt)
    }

    // === flush ===

    /// Delete the requested deposits. Outcomes follow input order.
    pub async fn flush(&self, request: &FlushRequest) -> Result<FlushReport> {
        request.validate().map_err(PublisherError::Validation)?;
        let id = request.issue_id;

        let Some(mut record) = self.store.load_record(id)? else {
            info!(submission = %id, "No deposit record, nothing to flush");
            return Ok(FlushReport {
                outcomes: unique(&request.resources)
                    .map(|resource| FlushOutcome {
                        resource,
                        status: FlushStatus::NotInRecord,
                    })
                    .collect(),
                record_error: None,
            });
        };

        let mut pacer = Pacer::new(self.request_delay);
        let mut outcomes = Vec::new();

        for resource in unique(&request.resources) {
            let Some(deposit) = record.get(resource).cloned() else {
                outcomes.push(FlushOutcome {
                    resource,
                    status: FlushStatus::NotInRecord,
                });
                continue;
            };

            pacer.wait().await;
            let status = match self.api.delete(&deposit.links.self_url).await {
                Ok(DeleteOutcome::Deleted) => {
                    record.remove(resource);
                    self.discard_local(id, resource);
                    info!(submission = %id, resource = %resource, "Deposit deleted");
                    FlushStatus::Deleted
                }
                Ok(DeleteOutcome::NotFound) => {
                    record.remove(resource);
                    self.discard_local(id, resource);
                    info!(submission = %id, resource = %resource, "Deposit already gone");
                    FlushStatus::NotFound
                }
                Ok(DeleteOutcome::AlreadyPublished) => {
                    info!(submission = %id, resource = %resource, "Deposit published, kept");
                    FlushStatus::AlreadyPublished
                }
                Err(e) => {
                    warn!(submission = %id, resource = %resource, error = %e, "Deposit delete failed");
                    FlushStatus::Failed {
                        reason: e.describe(),
                    }
                }
            };
            outcomes.push(FlushOutcome { resource, status });
        }

        let record_error = match self.store.save_record(id, &record) {
            Ok(()) => None,
            Err(e) => {
                warn!(submission = %id, error = %e, "Failed to write reduced deposit record");
                Some(e.to_string())
            }
        };
        Ok(FlushReport {
            outcomes,
            record_error,
        })
    }

    /// Remove receipts and archives of a deleted deposit.
    fn discard_local(&self, id: SubmissionId, resource: ResourceType) {
        match self.store.remove_upload_receipts(id, resource) {
            Ok(n) if n > 0 => debug!(submission = %id, resource = %resource, removed = n, "Removed upload receipts"),
            Ok(_) => {}
            Err(e) => warn!(submission = %id, resource = %resource, error = %e, "Failed to remove upload receipts"),
        }
        if let Err(e) = self.store.remove_publish_receipt(id, resource) {
            warn!(submission = %id, resource = %resource, error = %e, "Failed to remove publish receipt");
        }
        match self.archiver.remove_archives(id, resource) {
            Ok(n) if n > 0 => debug!(submission = %id, resource = %resource, removed = n, "Removed archives"),
            Ok(_) => {}
            Err(e) => warn!(submission = %id, resource = %resource, error = %e, "Failed to remove archives"),
        }
    }

    // === publish ===

    /// Publish every deposit of the submission.
    ///
    /// Refused without any remote call unless every recorded type has an
    /// upload receipt.
    pub async fn publish(&self, request: &PublishRequest) -> Result<Vec<PublishOutcome>> {
        request.validate().map_err(PublisherError::Validation)?;
        let id = request.issue_id;

        let record = self.require_record(id)?;

        let mut missing = Vec::new();
        for resource in record.resources() {
            if !self.store.has_upload_receipt(id, resource)? {
                missing.push(resource);
            }
        }
        if !missing.is_empty() {
            warn!(submission = %id, missing = ?missing, "Publish refused, uploads missing");
            return Err(PublisherError::InconsistentState {
                submission: id,
                problem: StateProblem::MissingUploads { resources: missing },
            });
        }

        let mut pacer = Pacer::new(self.request_delay);
        let mut outcomes = Vec::with_capacity(record.len());

        for (resource, deposit) in &record.deposits {
            let resource = *resource;
            if let Some(receipt) = self.store.load_publish_receipt(id, resource)? {
                outcomes.push(PublishOutcome {
                    resource,
                    status: PublishStatus::AlreadyPublished { doi: receipt.doi },
                });
                continue;
            }

            pacer.wait().await;
            let status = match self.api.publish(&deposit.links.publish).await {
                Ok(published) => {
                    info!(submission = %id, resource = %resource, doi = %published.doi, "Deposit published");
                    let receipt = PublishReceipt {
                        resource,
                        submission: id,
                        doi: published.doi.clone(),
                        badge: published.badge.clone(),
                        record_url: published.record_url,
                        published_at: now_secs(),
                    };
                    match self.store.write_publish_receipt(&receipt) {
                        Ok(_) => PublishStatus::Published {
                            doi: published.doi,
                            badge: published.badge,
                        },
                        Err(e) => {
                            warn!(submission = %id, resource = %resource, error = %e, "Failed to write publish receipt");
                            PublishStatus::ReceiptFailed {
                                doi: published.doi,
                                reason: e.to_string(),
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(submission = %id, resource = %resource, error = %e, "Publish failed");
                    PublishStatus::RemoteUnavailable {
                        reason: e.describe(),
                    }
                }
            };
            outcomes.push(PublishOutcome { resource, status });
        }

        Ok(outcomes)
    }

    // === read ===

    /// Current deposits, uploads and publications of a submission.
    pub fn read_record(&self, id: SubmissionId) -> Result<SubmissionState> {
        validate_issue_id(id).map_err(PublisherError::Validation)?;
        let deposits = self.require_record(id)?;

        let mut uploaded = Vec::new();
        let mut published = Vec::new();
        for resource in deposits.resources() {
            if self.store.has_upload_receipt(id, resource)? {
                uploaded.push(resource);
            }
            if let Some(receipt) = self.store.load_publish_receipt(id, resource)? {
                published.push(receipt);
            }
        }

        Ok(SubmissionState {
            issue_id: id,
            deposits,
            uploaded,
            published,
        })
    }

    /// Existence is checked before the record is read.
    fn require_record(&self, id: SubmissionId) -> Result<DepositRecord> {
        let missing = || PublisherError::InconsistentState {
            submission: id,
            problem: StateProblem::NoRecord,
        };
        if !self.store.record_exists(id) {
            return Err(missing());
        }
        self.store.load_record(id)?.ok_or_else(missing)
    }
}

/// Requested types without duplicates, first occurrence wins.
fn unique(resources: &[ResourceType]) -> impl Iterator<Item = ResourceType> + '_ {
    let mut seen = BTreeSet::new();
    resources.iter().copied().filter(move |r| seen.insert(*r))
}

/// Remote steps map to `RemoteUnavailable`, local ones to `Artifact`.
fn archive_error(id: SubmissionId, resource: ResourceType, failure: ArchiveFailure) -> PublisherError {
    match failure.step {
        Step::Mirror | Step::Download | Step::Pull => PublisherError::RemoteUnavailable {
            submission: id,
            resource: Some(resource),
            step: failure.step,
            message: failure.message,
        },
        step => PublisherError::Artifact {
            submission: id,
            resource,
            step,
            message: failure.message,
        },
    }
}

fn describe(resource: ResourceType, journal: &str, meta: &SubmissionMetadata) -> String {
    let fork = meta.fork_url.trim_end_matches('/');
    let source = meta.source_url.trim_end_matches('/');
    let fork_link = format!(
        "<a href=\"{}/commit/{}\">{}</a>",
        fork,
        meta.commit_fork,
        short_commit(&meta.commit_fork)
    );
    let source_link = format!(
        "<a href=\"{}/commit/{}\">{}</a>",
        source, meta.commit_source, source
    );

    match resource {
        ResourceType::Book => format!(
            "<p>{} Jupyter Book of \"{}\", built at commit {} of the journal fork. \
             Source repository: {}.</p>",
            journal, meta.title, fork_link, source_link
        ),
        ResourceType::Repository => format!(
            "<p>Snapshot of the {} repository for \"{}\" at commit {}. \
             Source repository: {}.</p>",
            journal, meta.title, fork_link, source_link
        ),
        ResourceType::Dataset => format!(
            "<p>Dataset used to build the {} preprint \"{}\".</p>",
            journal, meta.title
        ),
        ResourceType::DockerImage => format!(
            "<p>Docker image in which the {} preprint \"{}\" was built, \
             from commit {} of the journal fork.</p>",
            journal, meta.title, fork_link
        ),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
