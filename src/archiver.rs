//! Local artifact production.
//!
//! Turns an upload locator into a single archive file on disk:
//! - book / dataset directories are zipped
//! - repositories are downloaded as branch archives (`main`, then `master`)
//! - docker images are pulled and saved as a gzipped tarball
//!
//! Anything that shells out or talks to a third party goes through
//! [`ArtifactTools`], so the archiver logic runs in tests without docker,
//! rsync or network access.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::Step;
use crate::resource::{archive_file_name, archive_name_prefix, ResourceType, SubmissionId};

/// Branches tried, in order, when downloading a repository archive.
pub const REPOSITORY_BRANCHES: [&str; 2] = ["main", "master"];

/// Failures of external tools.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{program} exited with {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One `git ls-remote` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub hash: String,
    pub name: String,
}

/// Capabilities backed by external tools.
#[async_trait]
pub trait ArtifactTools: Send + Sync {
    /// Pull a container image.
    async fn pull(&self, image: &str) -> Result<(), ToolError>;

    /// Save a pulled image as a gzipped tarball at `dest`.
    async fn export(&self, image: &str, dest: &Path) -> Result<PathBuf, ToolError>;

    /// Download `url` to `dest`.
    async fn fetch_archive(&self, url: &str, dest: &Path) -> Result<PathBuf, ToolError>;

    /// Mirror `remote_path` from the artifact host into `local_dir`.
    async fn mirror(&self, remote_path: &str, local_dir: &Path) -> Result<PathBuf, ToolError>;

    /// List refs advertised by a remote repository.
    async fn list_remote_refs(&self, repo_url: &str) -> Result<Vec<RemoteRef>, ToolError>;
}

/// Where the built book lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookLocation {
    /// Already on local disk, inside the book directory. Relative paths
    /// are taken from that directory.
    Local { path: PathBuf },

    /// On the artifact host; mirrored before archiving.
    Mirror { remote_path: String },
}

/// Type-specific locator for an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum UploadSource {
    Book {
        location: BookLocation,
        commit: String,
    },
    /// Project directory name under the dataset directory.
    #[serde(rename = "data")]
    Dataset { project: String, commit: String },
    Repository { fork_url: String, commit: String },
    #[serde(rename = "docker")]
    DockerImage { image: String, commit: String },
}

impl UploadSource {
    pub fn resource(&self) -> ResourceType {
        match self {
            Self::Book { .. } => ResourceType::Book,
            Self::Dataset { .. } => ResourceType::Dataset,
            Self::Repository { .. } => ResourceType::Repository,
            Self::DockerImage { .. } => ResourceType::DockerImage,
        }
    }

    pub fn commit(&self) -> &str {
        match self {
            Self::Book { commit, .. }
            | Self::Dataset { commit, .. }
            | Self::Repository { commit, .. }
            | Self::DockerImage { commit, .. } => commit,
        }
    }

    /// Check required fields before any side effect.
    pub fn validate(&self) -> Result<(), String> {
        let commit = self.commit();
        if commit.is_empty() {
            return Err("commit is required".to_string());
        }
        if !commit.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("commit is not a hex hash: {:?}", commit));
        }
        match self {
            Self::Book {
                location: BookLocation::Local { path },
                ..
            } if path.as_os_str().is_empty() => Err("book path is required".to_string()),
            Self::Book {
                location: BookLocation::Mirror { remote_path },
                ..
            } if remote_path.trim().is_empty() => Err("book remote_path is required".to_string()),
            Self::Book {
                location: BookLocation::Mirror { remote_path },
                ..
            } if Path::new(remote_path)
                .components()
                .any(|c| matches!(c, Component::ParentDir)) =>
            {
                Err(format!("book remote_path must not contain '..': {}", remote_path))
            }
            Self::Dataset { project, .. } if !is_plain_name(project) => {
                Err(format!("dataset project must be a plain directory name: {:?}", project))
            }
            Self::Repository { fork_url, .. }
                if !(fork_url.starts_with("https://") || fork_url.starts_with("http://")) =>
            {
                Err(format!("fork_url must be an http(s) URL: {}", fork_url))
            }
            Self::DockerImage { image, .. } if image.trim().is_empty() => {
                Err("docker image is required".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// A single normal path component: no separators, no `.` or `..`, not hidden.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.starts_with('.')
        && !name.contains(['/', '\\'])
}

/// Local directories uploads may be archived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRoots {
    /// Built books (`BookLocation::Local`).
    pub book_dir: Option<PathBuf>,

    /// One subdirectory per dataset project.
    pub dataset_dir: Option<PathBuf>,
}

/// Where an upload's content is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// Canonical directory inside one of the [`SourceRoots`].
    Directory(PathBuf),
    /// Path on the mirror host.
    Mirror(String),
    /// Fork URL whose branch archive is downloaded.
    Repository(String),
    DockerImage(String),
}

/// An upload source checked against the configured roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    resource: ResourceType,
    commit: String,
    location: SourceLocation,
}

impl ResolvedSource {
    pub fn resource(&self) -> ResourceType {
        self.resource
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }
}

/// Canonicalize `requested` (relative to `root` unless absolute) and
/// require a directory strictly inside `root`.
fn resolve_within(root: &Path, requested: &Path, what: &str) -> Result<PathBuf, String> {
    let root = root
        .canonicalize()
        .map_err(|e| format!("{} directory {} is unavailable: {}", what, root.display(), e))?;
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    let resolved = candidate
        .canonicalize()
        .map_err(|e| format!("{} {} not found: {}", what, requested.display(), e))?;

    if resolved == root || !resolved.starts_with(&root) {
        return Err(format!(
            "{} {} is outside {}",
            what,
            requested.display(),
            root.display()
        ));
    }
    if !resolved.is_dir() {
        return Err(format!("{} {} is not a directory", what, requested.display()));
    }
    Ok(resolved)
}

/// An archive ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedArtifact {
    pub resource: ResourceType,
    pub path: PathBuf,
    pub file_name: String,
}

/// Step-tagged archiving failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFailure {
    pub step: Step,
    pub message: String,
}

impl ArchiveFailure {
    fn new(step: Step, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

/// Produces local archives under `<archive-dir>/<id>/`.
#[derive(Clone)]
pub struct ResourceArchiver {
    root: PathBuf,
    doi_prefix: String,
    journal: String,
    roots: SourceRoots,
    tools: Arc<dyn ArtifactTools>,
}

impl ResourceArchiver {
    pub fn new(
        root: impl Into<PathBuf>,
        doi_prefix: impl Into<String>,
        journal: impl Into<String>,
        tools: Arc<dyn ArtifactTools>,
    ) -> Self {
        Self {
            root: root.into(),
            doi_prefix: doi_prefix.into(),
            journal: journal.into(),
            roots: SourceRoots::default(),
            tools,
        }
    }

    pub fn with_source_roots(mut self, roots: SourceRoots) -> Self {
        self.roots = roots;
        self
    }

    pub fn submission_dir(&self, id: SubmissionId) -> PathBuf {
        self.root.join(id.padded())
    }

    pub fn archive_path(&self, id: SubmissionId, resource: ResourceType, commit: &str) -> PathBuf {
        self.submission_dir(id).join(archive_file_name(
            resource,
            &self.doi_prefix,
            &self.journal,
            id,
            commit,
        ))
    }

    /// Validate `source` and resolve local paths against the source roots.
    /// Touches nothing on disk.
    pub fn resolve(&self, source: &UploadSource) -> Result<ResolvedSource, String> {
        source.validate()?;

        let location = match source {
            UploadSource::Book {
                location: BookLocation::Local { path },
                ..
            } => {
                let root = self
                    .roots
                    .book_dir
                    .as_deref()
                    .ok_or("no book directory is configured")?;
                SourceLocation::Directory(resolve_within(root, path, "book")?)
            }
            UploadSource::Book {
                location: BookLocation::Mirror { remote_path },
                ..
            } => SourceLocation::Mirror(remote_path.clone()),
            UploadSource::Dataset { project, .. } => {
                let root = self
                    .roots
                    .dataset_dir
                    .as_deref()
                    .ok_or("no dataset directory is configured")?;
                SourceLocation::Directory(resolve_within(root, Path::new(project), "dataset")?)
            }
            UploadSource::Repository { fork_url, .. } => SourceLocation::Repository(fork_url.clone()),
            UploadSource::DockerImage { image, .. } => SourceLocation::DockerImage(image.clone()),
        };

        Ok(ResolvedSource {
            resource: source.resource(),
            commit: source.commit().to_string(),
            location,
        })
    }

    /// Produce the archive for a resolved source.
    pub async fn produce(
        &self,
        id: SubmissionId,
        source: &ResolvedSource,
    ) -> Result<ArchivedArtifact, ArchiveFailure> {
        let resource = source.resource;
        let dest = self.archive_path(id, resource, &source.commit);
        fs::create_dir_all(self.submission_dir(id))
            .map_err(|e| ArchiveFailure::new(Step::Compress, e.to_string()))?;

        info!(submission = %id, resource = %resource, dest = %dest.display(), "Producing archive");

        let path = match &source.location {
            SourceLocation::Directory(dir) => zip_directory_blocking(dir.clone(), dest).await?,
            SourceLocation::Mirror(remote_path) => {
                let staging = self.staging_dir(id, resource);
                let zipped = match self.tools.mirror(remote_path, &staging).await {
                    Ok(dir) => zip_directory_blocking(dir, dest).await,
                    Err(e) => Err(ArchiveFailure::new(Step::Mirror, e.to_string())),
                };
                remove_staging(&staging);
                zipped?
            }
            SourceLocation::Repository(fork_url) => self.fetch_repository(fork_url, &dest).await?,
            SourceLocation::DockerImage(image) => {
                self.tools
                    .pull(image)
                    .await
                    .map_err(|e| ArchiveFailure::new(Step::Pull, e.to_string()))?;
                self.tools
                    .export(image, &dest)
                    .await
                    .map_err(|e| ArchiveFailure::new(Step::Export, e.to_string()))?
            }
        };

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| ArchiveFailure::new(Step::Compress, "archive path has no file name"))?;

        Ok(ArchivedArtifact {
            resource,
            path,
            file_name,
        })
    }

    /// Scratch directory a mirrored book is copied into before zipping.
    pub fn staging_dir(&self, id: SubmissionId, resource: ResourceType) -> PathBuf {
        self.submission_dir(id).join("mirror").join(resource.as_str())
    }

    /// Download the default branch archive, trying each known branch name.
    async fn fetch_repository(&self, fork_url: &str, dest: &Path) -> Result<PathBuf, ArchiveFailure> {
        let base = fork_url.trim_end_matches('/').trim_end_matches(".git");
        let mut errors = Vec::new();

        for branch in REPOSITORY_BRANCHES {
            let url = format!("{}/archive/refs/heads/{}.zip", base, branch);
            match self.tools.fetch_archive(&url, dest).await {
                Ok(path) => {
                    debug!(url = %url, "Repository archive downloaded");
                    return Ok(path);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Repository archive download failed");
                    errors.push(format!("{}: {}", branch, e));
                }
            }
        }

        Err(ArchiveFailure::new(Step::Download, errors.join("; ")))
    }

    /// Remove every local archive of `resource` for a submission.
    pub fn remove_archives(&self, id: SubmissionId, resource: ResourceType) -> io::Result<usize> {
        let prefix = archive_name_prefix(resource, &self.doi_prefix, &self.journal, id);
        let paths = crate::store::list_with_prefix(&self.submission_dir(id), &prefix)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let mut removed = 0;
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        match fs::remove_dir_all(self.staging_dir(id, resource)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(removed)
    }
}

fn remove_staging(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!(dir = %dir.display(), "Removed mirror staging"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove mirror staging"),
    }
}

async fn zip_directory_blocking(src: PathBuf, dest: PathBuf) -> Result<PathBuf, ArchiveFailure> {
    tokio::task::spawn_blocking(move || zip_directory(&src, &dest).map(|_| dest))
        .await
        .map_err(|e| ArchiveFailure::new(Step::Compress, format!("archive task failed: {}", e)))?
        .map_err(|e| ArchiveFailure::new(Step::Compress, e.to_string()))
}

/// Zip the contents of `src` into `dest`; entry names are relative to `src`.
pub fn zip_directory(src: &Path, dest: &Path) -> io::Result<u64> {
    if !src.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("directory not found: {}", src.display()),
        ));
    }

    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = NamedTempFile::new_in(parent)?;

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(tmp.reopen()?);
    let mut files = 0u64;

    let mut pending = vec![src.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry_name(src, &path);
            if entry.file_type()?.is_dir() {
                zip.add_directory(format!("{}/", name), options)
                    .map_err(zip_err)?;
                pending.push(path);
            } else {
                zip.start_file(name, options).map_err(zip_err)?;
                let mut file = File::open(&path)?;
                io::copy(&mut file, &mut zip)?;
                files += 1;
            }
        }
    }

    zip.finish().map_err(zip_err)?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(files)
}

fn entry_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn zip_err(e: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// [`ArtifactTools`] backed by docker, rsync, git and HTTP downloads.
#[derive(Debug, Clone)]
pub struct ShellTools {
    http: Client,
    mirror_host: Option<String>,
}

impl ShellTools {
    pub fn new(http: Client, mirror_host: Option<String>) -> Self {
        Self { http, mirror_host }
    }
}

async fn run(program: &str, args: &[&str]) -> Result<Output, ToolError> {
    debug!(program = %program, args = ?args, "Running tool");
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(ToolError::Command {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

async fn discard_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(file = %path.display(), "Removed incomplete archive"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove incomplete archive"),
    }
}

/// Parse `git ls-remote` output (`<hash>\t<ref>` per line).
pub fn parse_ls_remote(output: &str) -> Vec<RemoteRef> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let hash = parts.next()?;
            let name = parts.next()?;
            Some(RemoteRef {
                hash: hash.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl ArtifactTools for ShellTools {
    async fn pull(&self, image: &str) -> Result<(), ToolError> {
        run("docker", &["pull", image]).await?;
        info!(image = %image, "Docker image pulled");
        Ok(())
    }

    async fn export(&self, image: &str, dest: &Path) -> Result<PathBuf, ToolError> {
        let dest_str = dest.to_string_lossy();
        // $0 / $1 keep the image and path out of the script text.
        let saved = run(
            "bash",
            &[
                "-c",
                "set -o pipefail; docker save \"$0\" | gzip -c > \"$1\"",
                image,
                &*dest_str,
            ],
        )
        .await;

        if let Err(e) = saved {
            // The redirect leaves a truncated tarball behind.
            discard_file(dest).await;
            return Err(e);
        }
        Ok(dest.to_path_buf())
    }

    async fn fetch_archive(&self, url: &str, dest: &Path) -> Result<PathBuf, ToolError> {
        let download_err = |reason: String| ToolError::Download {
            url: url.to_string(),
            reason,
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| download_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(download_err(format!("HTTP {}", response.status().as_u16())));
        }

        let partial = dest.with_extension("partial");
        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut stream = response.bytes_stream();
            let mut size = 0u64;

            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| download_err(e.to_string()))?;
                size += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            drop(file);

            tokio::fs::rename(&partial, dest).await?;
            Ok::<_, ToolError>(size)
        }
        .await;

        match written {
            Ok(size) => {
                info!(url = %url, size = size, "Archive downloaded");
                Ok(dest.to_path_buf())
            }
            Err(e) => {
                discard_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn mirror(&self, remote_path: &str, local_dir: &Path) -> Result<PathBuf, ToolError> {
        let host = self
            .mirror_host
            .as_deref()
            .ok_or(ToolError::NotConfigured("mirror host"))?;
        tokio::fs::create_dir_all(local_dir).await?;

        let source = format!("{}:{}/", host, remote_path.trim_end_matches('/'));
        let target = format!("{}/", local_dir.display());
        run("rsync", &["-a", "--delete", source.as_str(), target.as_str()]).await?;

        info!(source = %source, target = %target, "Mirrored artifact");
        Ok(local_dir.to_path_buf())
    }

    async fn list_remote_refs(&self, repo_url: &str) -> Result<Vec<RemoteRef>, ToolError> {
        let output = run("git", &["ls-remote", repo_url]).await?;
        Ok(parse_ls_remote(&String::from_utf8_lossy(&output.stdout)))
    }
}
