//! Publisher configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lock::DEFAULT_STALE_AFTER;

/// Default BinderHub instance.
pub const DEFAULT_BINDER_URL: &str = "https://binder.conp.cloud";

/// Default Zenodo instance.
pub const DEFAULT_ZENODO_URL: &str = "https://zenodo.org";

/// DOI prefix of the journal.
pub const DEFAULT_DOI_PREFIX: &str = "10.55458";

/// Pause between consecutive Zenodo calls in one batch.
pub const DEFAULT_REQUEST_DELAY: Duration = Duration::from_secs(2);

/// Configuration for the publication pipeline.
#[derive(Clone)]
pub struct PublisherConfig {
    /// Per-submission deposit records and receipts.
    pub deposit_dir: PathBuf,

    /// Per-submission local archives.
    pub archive_dir: PathBuf,

    /// Build lock markers.
    pub lock_dir: PathBuf,

    /// Root of locally built books. Local book uploads must point inside it.
    pub book_dir: PathBuf,

    /// One subdirectory per dataset project.
    pub dataset_dir: PathBuf,

    /// BinderHub base URL.
    pub binder_url: String,

    /// Zenodo base URL (use https://sandbox.zenodo.org for testing).
    pub zenodo_url: String,

    /// Zenodo personal access token.
    pub zenodo_token: String,

    /// rsync host holding built books (`user@host`).
    /// If None, mirrored book locations fail.
    pub mirror_host: Option<String>,

    pub doi_prefix: String,

    /// Journal name used in filenames and the parent DOI.
    pub journal: String,

    pub request_delay: Duration,

    /// Age after which a build lock is reclaimed.
    pub lock_stale_after: Duration,
}

impl PublisherConfig {
    /// All state directories under one data directory.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            deposit_dir: data_dir.join("zenodo"),
            archive_dir: data_dir.join("archives"),
            lock_dir: data_dir.join("locks"),
            book_dir: data_dir.join("books"),
            dataset_dir: data_dir.join("datasets"),
            binder_url: DEFAULT_BINDER_URL.to_string(),
            zenodo_url: DEFAULT_ZENODO_URL.to_string(),
            zenodo_token: String::new(),
            mirror_host: None,
            doi_prefix: DEFAULT_DOI_PREFIX.to_string(),
            journal: "NeuroLibre".to_string(),
            request_delay: DEFAULT_REQUEST_DELAY,
            lock_stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_binder_url(mut self, url: impl Into<String>) -> Self {
        self.binder_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_zenodo(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.zenodo_url = url.into().trim_end_matches('/').to_string();
        self.zenodo_token = token.into();
        self
    }

    pub fn with_mirror_host(mut self, host: Option<String>) -> Self {
        self.mirror_host = host.filter(|h| !h.trim().is_empty());
        self
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    pub fn with_book_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.book_dir = dir.into();
        self
    }

    pub fn with_dataset_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dataset_dir = dir.into();
        self
    }

    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    /// Journal identity used in filenames and the parent DOI.
    pub fn with_journal(mut self, doi_prefix: impl Into<String>, journal: impl Into<String>) -> Self {
        self.doi_prefix = doi_prefix.into();
        self.journal = journal.into();
        self
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::new(default_data_dir())
    }
}

impl std::fmt::Debug for PublisherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherConfig")
            .field("deposit_dir", &self.deposit_dir)
            .field("archive_dir", &self.archive_dir)
            .field("lock_dir", &self.lock_dir)
            .field("book_dir", &self.book_dir)
            .field("dataset_dir", &self.dataset_dir)
            .field("binder_url", &self.binder_url)
            .field("zenodo_url", &self.zenodo_url)
            .field("zenodo_token", &(!self.zenodo_token.is_empty()).then_some("<set>"))
            .field("mirror_host", &self.mirror_host)
            .field("doi_prefix", &self.doi_prefix)
            .field("journal", &self.journal)
            .field("request_delay", &self.request_delay)
            .field("lock_stale_after", &self.lock_stale_after)
            .finish()
    }
}

/// Get the default data directory.
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "neurolibre", "publisher")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./publisher-data"))
}
