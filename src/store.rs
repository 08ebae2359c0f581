//! File-backed deposit state.
//!
//! Layout under the deposit directory, per submission:
//!
//! ```text
//! <deposit-dir>/<id>/zenodo_deposit_NeuroLibre_<id>.json
//! <deposit-dir>/<id>/zenodo_uploaded_<type>_NeuroLibre_<id>_<shortCommit>.json
//! <deposit-dir>/<id>/zenodo_published_<type>_NeuroLibre_<id>.json
//! ```
//!
//! Every write replaces the whole document through a temp file and an
//! atomic rename, so readers never see a half-written record.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::resource::{short_commit, ResourceType, SubmissionId};
use crate::zenodo::RemoteDeposit;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Deposit record already exists at {0}")]
    RecordExists(PathBuf),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Remote deposits created for one submission, keyed by resource type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DepositRecord {
    pub deposits: BTreeMap<ResourceType, RemoteDeposit>,
}

impl DepositRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: ResourceType) -> Option<&RemoteDeposit> {
        self.deposits.get(&resource)
    }

    pub fn insert(&mut self, resource: ResourceType, deposit: RemoteDeposit) {
        self.deposits.insert(resource, deposit);
    }

    pub fn remove(&mut self, resource: ResourceType) -> Option<RemoteDeposit> {
        self.deposits.remove(&resource)
    }

    pub fn resources(&self) -> impl Iterator<Item = ResourceType> + '_ {
        self.deposits.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.deposits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deposits.is_empty()
    }
}

/// Marker written after a successful bucket upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub resource: ResourceType,
    pub submission: SubmissionId,
    pub commit: String,
    /// Name of the uploaded file inside the bucket.
    pub file_name: String,
    /// Raw response from the bucket upload.
    pub response: serde_json::Value,
    /// Unix epoch seconds.
    pub uploaded_at: u64,
}

/// Marker written after a deposit is published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub resource: ResourceType,
    pub submission: SubmissionId,
    pub doi: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_url: Option<String>,
    /// Unix epoch seconds.
    pub published_at: u64,
}

/// Per-submission JSON records on local disk.
#[derive(Debug, Clone)]
pub struct DepositStore {
    root: PathBuf,
    journal: String,
}

impl DepositStore {
    pub fn new(root: impl Into<PathBuf>, journal: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            journal: journal.into(),
        }
    }

    pub fn submission_dir(&self, id: SubmissionId) -> PathBuf {
        self.root.join(id.padded())
    }

    pub fn record_path(&self, id: SubmissionId) -> PathBuf {
        self.submission_dir(id)
            .join(format!("zenodo_deposit_{}_{}.json", self.journal, id.padded()))
    }

    pub fn upload_receipt_path(
        &self,
        id: SubmissionId,
        resource: ResourceType,
        commit: &str,
    ) -> PathBuf {
        self.submission_dir(id).join(format!(
            "{}{}.json",
            self.upload_receipt_prefix(id, resource),
            short_commit(commit)
        ))
    }

    pub fn publish_receipt_path(&self, id: SubmissionId, resource: ResourceType) -> PathBuf {
        self.submission_dir(id).join(format!(
            "zenodo_published_{}_{}_{}.json",
            resource.as_str(),
            self.journal,
            id.padded()
        ))
    }

    fn upload_receipt_prefix(&self, id: SubmissionId, resource: ResourceType) -> String {
        format!(
            "zenodo_uploaded_{}_{}_{}_",
            resource.as_str(),
            self.journal,
            id.padded()
        )
    }

    // === Deposit record ===

    pub fn record_exists(&self, id: SubmissionId) -> bool {
        self.record_path(id).is_file()
    }

    /// Load the record. Existence is checked before any read.
    pub fn load_record(&self, id: SubmissionId) -> Result<Option<DepositRecord>> {
        let path = self.record_path(id);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Persist a freshly created record. Never replaces an existing one,
    /// even one that appears while this write is in flight.
    pub fn insert_record(&self, id: SubmissionId, record: &DepositRecord) -> Result<()> {
        let path = self.record_path(id);
        write_json(&path, record, Persist::NoClobber)
    }

    /// Replace the record. An empty record deletes the file instead.
    pub fn save_record(&self, id: SubmissionId, record: &DepositRecord) -> Result<()> {
        let path = self.record_path(id);
        if record.is_empty() {
            debug!(submission = %id, "Deposit record empty, removing file");
            return remove_if_exists(&path).map(|_| ());
        }
        write_json_atomic(&path, record)
    }

    // === Receipts ===

    pub fn write_upload_receipt(&self, receipt: &UploadReceipt) -> Result<PathBuf> {
        let path = self.upload_receipt_path(receipt.submission, receipt.resource, &receipt.commit);
        write_json_atomic(&path, receipt)?;
        Ok(path)
    }

    /// All upload receipt files for `resource`, whatever the commit.
    pub fn upload_receipts(&self, id: SubmissionId, resource: ResourceType) -> Result<Vec<PathBuf>> {
        list_with_prefix(
            &self.submission_dir(id),
            &self.upload_receipt_prefix(id, resource),
        )
    }

    pub fn has_upload_receipt(&self, id: SubmissionId, resource: ResourceType) -> Result<bool> {
        Ok(!self.upload_receipts(id, resource)?.is_empty())
    }

    pub fn remove_upload_receipts(&self, id: SubmissionId, resource: ResourceType) -> Result<usize> {
        let mut removed = 0;
        for path in self.upload_receipts(id, resource)? {
            if remove_if_exists(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn write_publish_receipt(&self, receipt: &PublishReceipt) -> Result<PathBuf> {
        let path = self.publish_receipt_path(receipt.submission, receipt.resource);
        write_json_atomic(&path, receipt)?;
        Ok(path)
    }

    pub fn load_publish_receipt(
        &self,
        id: SubmissionId,
        resource: ResourceType,
    ) -> Result<Option<PublishReceipt>> {
        let path = self.publish_receipt_path(id, resource);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn remove_publish_receipt(&self, id: SubmissionId, resource: ResourceType) -> Result<bool> {
        remove_if_exists(&self.publish_receipt_path(id, resource))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persist {
    Replace,
    NoClobber,
}

/// Write `value` to a sibling temp file, then rename over `path`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_json(path, value, Persist::Replace)
}

fn write_json<T: Serialize>(path: &Path, value: &T, mode: Persist) -> Result<()> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err)?;

    let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&body).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    match mode {
        Persist::Replace => tmp.persist(path).map(|_| ()),
        Persist::NoClobber => tmp.persist_noclobber(path).map(|_| ()),
    }
    .map_err(|e| match e.error.kind() {
        io::ErrorKind::AlreadyExists => StoreError::RecordExists(path.to_path_buf()),
        _ => io_err(e.error),
    })
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Files in `dir` whose name starts with `prefix`, sorted.
pub(crate) fn list_with_prefix(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix))
        {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}
