//! Build dispatch.
//!
//! A build request names a repository and optionally a commit. The
//! dispatcher resolves the commit, takes the per-repository build lock,
//! triggers BinderHub and hands back a stream of its status lines. The
//! lock is held by the task pumping the stream and released when the
//! remote stream ends, fails, or the consumer goes away.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::archiver::ArtifactTools;
use crate::lock::{Acquire, BuildLease, LockKey, LockStore};

/// Build dispatch errors. A busy lock is [`Dispatch::AlreadyBuilding`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid build request: {0}")]
    Validation(String),

    #[error("could not resolve HEAD of {url}: {reason}")]
    ResolveHead { url: String, reason: String },

    #[error("build lock error: {0}")]
    Lock(#[from] std::io::Error),

    #[error("BinderHub request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("BinderHub returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl BuildError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ResolveHead { .. } | Self::Http(_) | Self::Status { .. } => "remote_unavailable",
            Self::Lock(_) => "storage_error",
        }
    }
}

// ============================================================================
// Coordinates
// ============================================================================

/// `(provider, org, repo)` parsed from a repository URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoCoordinates {
    pub provider: String,
    pub org: String,
    pub repo: String,
    /// Normalized clone URL, without a trailing `.git`.
    pub url: String,
}

impl RepoCoordinates {
    /// Parse `https://<host>/<org>/<repo>[.git]`.
    ///
    /// `github.com` becomes `gh` and `gitlab.com` becomes `gl`; other hosts
    /// are kept as given.
    pub fn parse(repo_url: &str) -> Result<Self, String> {
        let trimmed = repo_url.trim().trim_end_matches('/');
        let without_scheme = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .ok_or_else(|| format!("repo_url must be an http(s) URL: {}", repo_url))?;

        let segments: Vec<&str> = without_scheme.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 3 {
            return Err(format!("repo_url must look like https://host/org/repo: {}", repo_url));
        }

        let n = segments.len();
        let host = segments[n - 3];
        let org = segments[n - 2];
        let repo = segments[n - 1].trim_end_matches(".git");
        if repo.is_empty() {
            return Err(format!("repo_url has an empty repository name: {}", repo_url));
        }

        let provider = match host {
            "github.com" => "gh",
            "gitlab.com" => "gl",
            other => other,
        };

        Ok(Self {
            provider: provider.to_string(),
            org: org.to_string(),
            repo: repo.to_string(),
            url: trimmed.trim_end_matches(".git").to_string(),
        })
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::new(&self.provider, &self.org, &self.repo)
    }

    /// BinderHub build endpoint for `commit`.
    pub fn build_url(&self, binder_url: &str, commit: &str) -> String {
        format!(
            "{}/build/{}/{}/{}.git/{}",
            binder_url.trim_end_matches('/'),
            self.provider,
            self.org,
            self.repo,
            commit
        )
    }

    /// Link where a running or finished build can be checked.
    pub fn status_url(&self, binder_url: &str, commit: &str) -> String {
        format!(
            "{}/v2/{}/{}/{}/{}",
            binder_url.trim_end_matches('/'),
            self.provider,
            self.org,
            self.repo,
            commit
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub repo_url: String,
    /// Defaults to the remote HEAD.
    #[serde(default, alias = "commit_hash")]
    pub commit: Option<String>,
}

impl BuildRequest {
    pub fn validate(&self) -> Result<RepoCoordinates, String> {
        if let Some(commit) = &self.commit {
            if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!("commit is not a hex hash: {:?}", commit));
            }
        }
        RepoCoordinates::parse(&self.repo_url)
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Event-stream payload emitted by BinderHub.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildProgress {
    pub phase: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub binder_ref_url: Option<String>,
}

impl BuildProgress {
    /// Parse a `data: {...}` line. Lines without a phase yield None.
    pub fn parse(line: &str) -> Option<Self> {
        let payload = line.trim().strip_prefix("data:")?.trim();
        serde_json::from_str(payload).ok()
    }

    pub fn is_ready(&self) -> bool {
        self.phase == "ready"
    }

    /// Commit the environment was built at, from the last segment of the
    /// ref URL of a `ready` event.
    pub fn built_commit(&self) -> Option<&str> {
        if !self.is_ready() {
            return None;
        }
        self.binder_ref_url
            .as_deref()
            .and_then(|url| url.trim_end_matches('/').rsplit('/').next())
            .filter(|s| !s.is_empty())
    }
}

/// Splits a byte stream into lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\n', '\r']);
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

// ============================================================================
// Trigger
// ============================================================================

pub type ChunkStream = BoxStream<'static, Result<Bytes, BuildError>>;

/// Starts a remote build and returns its raw output.
#[async_trait]
pub trait BuildTrigger: Send + Sync {
    async fn trigger(&self, build_url: &str) -> Result<ChunkStream, BuildError>;
}

/// Triggers builds on a BinderHub instance.
#[derive(Clone)]
pub struct BinderHubTrigger {
    http: Client,
}

impl BinderHubTrigger {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl BuildTrigger for BinderHubTrigger {
    async fn trigger(&self, build_url: &str) -> Result<ChunkStream, BuildError> {
        debug!(url = %build_url, "Triggering BinderHub build");
        let response = self.http.get(build_url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BuildError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.bytes_stream().map(|r| r.map_err(BuildError::from)).boxed())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// One item of a build stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Line(String),
    /// The remote stream closed normally. Never sent after a transport
    /// error, so its absence means the build did not complete.
    Finished,
}

/// Another dispatch holds the lock for this repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildConflict {
    pub provider: String,
    pub org: String,
    pub repo: String,
    pub commit: String,
    pub age_secs: u64,
    pub status_url: String,
}

/// Result of a dispatch attempt.
pub enum Dispatch {
    Started(BuildStream),
    AlreadyBuilding(BuildConflict),
}

/// Status lines of a running build.
pub struct BuildStream {
    pub coordinates: RepoCoordinates,
    pub commit: String,
    rx: mpsc::Receiver<BuildEvent>,
}

impl BuildStream {
    pub async fn recv(&mut self) -> Option<BuildEvent> {
        self.rx.recv().await
    }
}

impl Stream for BuildStream {
    type Item = BuildEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Lock-guarded BinderHub dispatch.
#[derive(Clone)]
pub struct BuildDispatcher {
    locks: LockStore,
    trigger: Arc<dyn BuildTrigger>,
    tools: Arc<dyn ArtifactTools>,
    binder_url: String,
}

impl BuildDispatcher {
    pub fn new(
        locks: LockStore,
        trigger: Arc<dyn BuildTrigger>,
        tools: Arc<dyn ArtifactTools>,
        binder_url: impl Into<String>,
    ) -> Self {
        Self {
            locks,
            trigger,
            tools,
            binder_url: binder_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn binder_url(&self) -> &str {
        &self.binder_url
    }

    /// Start a build unless one is already running for the repository.
    pub async fn dispatch(&self, request: &BuildRequest) -> Result<Dispatch, BuildError> {
        let coords = request.validate().map_err(BuildError::Validation)?;
        let commit = match &request.commit {
            Some(commit) => commit.clone(),
            None => self.resolve_head(&coords.url).await?,
        };

        let lease = match self.locks.try_acquire(&coords.lock_key())? {
            Acquire::Locked(lease) => lease,
            Acquire::Busy { age } => {
                info!(
                    repo = %coords.url,
                    age_secs = age.as_secs(),
                    "Build already running"
                );
                return Ok(Dispatch::AlreadyBuilding(BuildConflict {
                    provider: coords.provider.clone(),
                    org: coords.org.clone(),
                    repo: coords.repo.clone(),
                    status_url: coords.status_url(&self.binder_url, &commit),
                    commit,
                    age_secs: age.as_secs(),
                }));
            }
        };

        let build_url = coords.build_url(&self.binder_url, &commit);
        info!(url = %build_url, "Dispatching build");
        // On error the lease is dropped here, which releases the lock.
        let chunks = self.trigger.trigger(&build_url).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump(chunks, tx, lease));

        Ok(Dispatch::Started(BuildStream {
            coordinates: coords,
            commit,
            rx,
        }))
    }

    async fn resolve_head(&self, repo_url: &str) -> Result<String, BuildError> {
        let refs = self
            .tools
            .list_remote_refs(repo_url)
            .await
            .map_err(|e| BuildError::ResolveHead {
                url: repo_url.to_string(),
                reason: e.to_string(),
            })?;

        refs.into_iter()
            .find(|r| r.name == "HEAD")
            .map(|r| r.hash)
            .ok_or_else(|| BuildError::ResolveHead {
                url: repo_url.to_string(),
                reason: "no HEAD entry in the remote ref list".to_string(),
            })
    }
}

/// Forward remote output line by line while holding the lock.
async fn pump(mut chunks: ChunkStream, tx: mpsc::Sender<BuildEvent>, lease: BuildLease) {
    let mut buffer = LineBuffer::default();
    let mut finished = true;

    'outer: while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "Build stream interrupted");
                finished = false;
                break;
            }
        };
        for line in buffer.push(&chunk) {
            if !forward(&tx, line).await {
                debug!("Build stream consumer went away");
                finished = false;
                break 'outer;
            }
        }
    }

    if finished {
        if let Some(line) = std::mem::take(&mut buffer).finish() {
            finished = forward(&tx, line).await;
        }
    }

    lease.release();
    if finished {
        let _ = tx.send(BuildEvent::Finished).await;
    }
}

async fn forward(tx: &mpsc::Sender<BuildEvent>, line: String) -> bool {
    if let Some(progress) = BuildProgress::parse(&line) {
        match progress.built_commit() {
            Some(commit) => info!(commit = %commit, "Build environment ready"),
            None => debug!(
                phase = %progress.phase,
                message = progress.message.as_deref().unwrap_or("").trim(),
                "Build progress"
            ),
        }
    }
    tx.send(BuildEvent::Line(line)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::tests::FakeTools;
    use crate::archiver::RemoteRef;
    use crate::lock::DEFAULT_STALE_AFTER;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replays scripted chunks; an `Err` entry simulates a dropped connection.
    #[derive(Default)]
    struct FakeTrigger {
        chunks: Vec<Result<&'static str, &'static str>>,
        refuse: bool,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BuildTrigger for FakeTrigger {
        async fn trigger(&self, build_url: &str) -> Result<ChunkStream, BuildError> {
            self.urls.lock().unwrap().push(build_url.to_string());
            if self.refuse {
                return Err(BuildError::Status {
                    status: 503,
                    body: "binder down".to_string(),
                });
            }
            let items: Vec<Result<Bytes, BuildError>> = self
                .chunks
                .iter()
                .map(|c| match c {
                    Ok(text) => Ok(Bytes::from_static(text.as_bytes())),
                    Err(reason) => Err(BuildError::Status {
                        status: 502,
                        body: reason.to_string(),
                    }),
                })
                .collect();
            Ok(futures_util::stream::iter(items).boxed())
        }
    }

    const COMMIT: &str = "e29aa259f6807e62610bc84a86d406065028fe29";

    fn dispatcher(temp: &TempDir, trigger: Arc<FakeTrigger>, tools: FakeTools) -> BuildDispatcher {
        BuildDispatcher::new(
            LockStore::new(temp.path(), DEFAULT_STALE_AFTER),
            trigger,
            Arc::new(tools),
            "https://binder.conp.cloud/",
        )
    }

    fn request(commit: Option<&str>) -> BuildRequest {
        BuildRequest {
            repo_url: "https://github.com/roboneurolibre/fmri-preprint".to_string(),
            commit: commit.map(str::to_string),
        }
    }

    async fn drain(stream: &mut BuildStream) -> Vec<BuildEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_parse_coordinates() {
        let gh = RepoCoordinates::parse("https://github.com/neurolibre/book.git").unwrap();
        assert_eq!((gh.provider.as_str(), gh.org.as_str(), gh.repo.as_str()), ("gh", "neurolibre", "book"));
        assert_eq!(gh.url, "https://github.com/neurolibre/book");

        let gl = RepoCoordinates::parse("https://gitlab.com/lab/paper/").unwrap();
        assert_eq!(gl.provider, "gl");

        let other = RepoCoordinates::parse("https://git.example.org/lab/paper").unwrap();
        assert_eq!(other.provider, "git.example.org");

        assert!(RepoCoordinates::parse("https://github.com/only-org").is_err());
        assert!(RepoCoordinates::parse("github.com/org/repo").is_err());
    }

    #[test]
    fn test_urls() {
        let coords = RepoCoordinates::parse("https://github.com/neurolibre/book").unwrap();
        assert_eq!(
            coords.build_url("https://binder.conp.cloud", "abc123"),
            "https://binder.conp.cloud/build/gh/neurolibre/book.git/abc123"
        );
        assert_eq!(
            coords.status_url("https://binder.conp.cloud/", "abc123"),
            "https://binder.conp.cloud/v2/gh/neurolibre/book/abc123"
        );
        assert_eq!(coords.lock_key().file_name(), "gh_neurolibre_book.lock");
    }

    #[test]
    fn test_build_request_accepts_commit_hash_alias() {
        let request: BuildRequest = serde_json::from_str(
            r#"{"repo_url": "https://github.com/a/b", "commit_hash": "abc123"}"#,
        )
        .unwrap();
        assert_eq!(request.commit.as_deref(), Some("abc123"));

        let bad = BuildRequest {
            repo_url: "https://github.com/a/b".to_string(),
            commit: Some("HEAD~1".to_string()),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_progress_parsing() {
        let ready = BuildProgress::parse(
            r#"data: {"phase": "ready", "message": "server running", "binder_ref_url": "https://github.com/a/b/tree/abc123"}"#,
        )
        .unwrap();
        assert!(ready.is_ready());
        assert_eq!(ready.built_commit(), Some("abc123"));

        let building = BuildProgress::parse(r#"data: {"phase": "building", "message": "Step 1/9"}"#).unwrap();
        assert_eq!(building.built_commit(), None);

        assert!(BuildProgress::parse(": keepalive").is_none());
        assert!(BuildProgress::parse("data: not json").is_none());
    }

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"pha").is_empty());
        assert_eq!(buffer.push(b"se\": \"built\"}\r\n\ndata: x"), vec![r#"data: {"phase": "built"}"#]);
        assert_eq!(buffer.finish().as_deref(), Some("data: x"));
    }

    #[tokio::test]
    async fn test_dispatch_streams_and_releases_lock() {
        let temp = TempDir::new().unwrap();
        let trigger = Arc::new(FakeTrigger {
            chunks: vec![
                Ok("data: {\"phase\": \"building\", \"message\": \"Step 1\"}\n"),
                Ok("data: {\"phase\": \"ready\", \"binder_ref_url\": \"https://github.com/roboneurolibre/fmri-preprint/tree/e29aa2\"}\n"),
            ],
            ..Default::default()
        });
        let dispatcher = dispatcher(&temp, trigger.clone(), FakeTools::default());

        let mut stream = match dispatcher.dispatch(&request(Some(COMMIT))).await.unwrap() {
            Dispatch::Started(stream) => stream,
            Dispatch::AlreadyBuilding(_) => panic!("lock should be free"),
        };
        assert_eq!(stream.commit, COMMIT);

        let events = drain(&mut stream).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], BuildEvent::Line(l) if l.contains("building")));
        assert_eq!(events[2], BuildEvent::Finished);

        assert_eq!(
            trigger.urls.lock().unwrap().as_slice(),
            [format!("https://binder.conp.cloud/build/gh/roboneurolibre/fmri-preprint.git/{}", COMMIT)]
        );
        assert!(!temp.path().join("gh_roboneurolibre_fmri-preprint.lock").exists());
    }

    #[tokio::test]
    async fn test_dispatch_busy_returns_conflict() {
        let temp = TempDir::new().unwrap();
        let trigger = Arc::new(FakeTrigger::default());
        let dispatcher = dispatcher(&temp, trigger.clone(), FakeTools::default());

        let locks = LockStore::new(temp.path(), DEFAULT_STALE_AFTER);
        let key = LockKey::new("gh", "roboneurolibre", "fmri-preprint");
        let _held = locks.try_acquire(&key).unwrap();

        match dispatcher.dispatch(&request(Some(COMMIT))).await.unwrap() {
            Dispatch::AlreadyBuilding(conflict) => {
                assert_eq!(conflict.repo, "fmri-preprint");
                assert_eq!(
                    conflict.status_url,
                    format!("https://binder.conp.cloud/v2/gh/roboneurolibre/fmri-preprint/{}", COMMIT)
                );
            }
            Dispatch::Started(_) => panic!("lock is held"),
        }
        assert!(trigger.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_resolves_head() {
        let temp = TempDir::new().unwrap();
        let trigger = Arc::new(FakeTrigger::default());
        let tools = FakeTools {
            refs: vec![
                RemoteRef {
                    hash: COMMIT.to_string(),
                    name: "HEAD".to_string(),
                },
                RemoteRef {
                    hash: "ffff".to_string(),
                    name: "refs/heads/dev".to_string(),
                },
            ],
            ..Default::default()
        };
        let dispatcher = dispatcher(&temp, trigger, tools);

        match dispatcher.dispatch(&request(None)).await.unwrap() {
            Dispatch::Started(stream) => assert_eq!(stream.commit, COMMIT),
            Dispatch::AlreadyBuilding(_) => panic!("lock should be free"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_head_fails() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp, Arc::new(FakeTrigger::default()), FakeTools::default());

        let result = dispatcher.dispatch(&request(None)).await;
        assert!(matches!(result, Err(BuildError::ResolveHead { .. })));
    }

    #[tokio::test]
    async fn test_interrupted_stream_has_no_sentinel() {
        let temp = TempDir::new().unwrap();
        let trigger = Arc::new(FakeTrigger {
            chunks: vec![Ok("data: {\"phase\": \"building\"}\n"), Err("connection reset")],
            ..Default::default()
        });
        let dispatcher = dispatcher(&temp, trigger, FakeTools::default());

        let mut stream = match dispatcher.dispatch(&request(Some(COMMIT))).await.unwrap() {
            Dispatch::Started(stream) => stream,
            Dispatch::AlreadyBuilding(_) => panic!("lock should be free"),
        };
        let events = drain(&mut stream).await;
        assert_eq!(events.len(), 1);
        assert!(!events.contains(&BuildEvent::Finished));
        assert!(!temp.path().join("gh_roboneurolibre_fmri-preprint.lock").exists());
    }

    #[tokio::test]
    async fn test_trigger_failure_releases_lock() {
        let temp = TempDir::new().unwrap();
        let trigger = Arc::new(FakeTrigger {
            refuse: true,
            ..Default::default()
        });
        let dispatcher = dispatcher(&temp, trigger, FakeTools::default());

        let result = dispatcher.dispatch(&request(Some(COMMIT))).await;
        assert!(matches!(result, Err(BuildError::Status { status: 503, .. })));
        assert!(!temp.path().join("gh_roboneurolibre_fmri-preprint.lock").exists());
    }
}
