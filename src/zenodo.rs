//! Zenodo deposition client.
//!
//! Only the four deposit operations the pipeline needs are wrapped:
//! create, upload into a bucket, delete, and publish. The orchestrator
//! talks to them through [`DepositApi`] so tests can substitute a fake.

use std::path::Path;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Zenodo client errors.
#[derive(Debug, Error)]
pub enum ZenodoError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZenodoError {
    /// Human-readable message, with connection problems called out.
    pub fn describe(&self) -> String {
        match self {
            Self::Http(e) if e.is_connect() => format!("Connection failed - Zenodo may be down: {}", e),
            Self::Http(e) if e.is_timeout() => format!("Request timed out: {}", e),
            other => other.to_string(),
        }
    }
}

/// Links returned with a deposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositLinks {
    /// Identity of the deposition; target of delete.
    #[serde(rename = "self")]
    pub self_url: String,

    /// Upload target.
    pub bucket: String,

    /// Publish action.
    pub publish: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// Handle to a created, not yet published deposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDeposit {
    pub id: u64,
    pub links: DepositLinks,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub submitted: bool,
    /// Pre-reserved DOI, when Zenodo returns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
}

/// Result of deleting a deposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    /// Published depositions cannot be deleted.
    AlreadyPublished,
    NotFound,
}

/// Result of publishing a deposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedDeposit {
    pub doi: String,
    pub badge: Option<String>,
    pub record_url: Option<String>,
}

/// Deposition creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creator {
    /// "Family, Given".
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orcid: Option<String>,
}

/// Related identifier entry (DataCite relation types).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedIdentifier {
    pub relation: String,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

impl RelatedIdentifier {
    /// Artifact belongs to the parent publication `doi`.
    pub fn is_part_of(doi: impl Into<String>) -> Self {
        Self {
            relation: "isPartOf".to_string(),
            identifier: doi.into(),
            resource_type: Some("publication-preprint".to_string()),
        }
    }
}

/// Deposition metadata payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositMetadata {
    pub title: String,
    pub upload_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_type: Option<String>,
    pub description: String,
    pub creators: Vec<Creator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    pub related_identifiers: Vec<RelatedIdentifier>,
}

/// Remote deposit operations.
#[async_trait]
pub trait DepositApi: Send + Sync {
    async fn create(&self, metadata: &DepositMetadata) -> Result<RemoteDeposit, ZenodoError>;

    /// Upload `file` into `bucket_url` under `file_name`.
    async fn upload(
        &self,
        bucket_url: &str,
        file_name: &str,
        file: &Path,
    ) -> Result<serde_json::Value, ZenodoError>;

    async fn delete(&self, self_url: &str) -> Result<DeleteOutcome, ZenodoError>;

    async fn publish(&self, publish_url: &str) -> Result<PublishedDeposit, ZenodoError>;
}

/// Deposition as returned by the Zenodo API.
#[derive(Debug, Deserialize)]
struct DepositionResponse {
    id: u64,
    links: DepositLinks,
    #[serde(default)]
    state: String,
    #[serde(default)]
    submitted: bool,
    #[serde(default)]
    metadata: Option<DepositionResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct DepositionResponseMetadata {
    prereserve_doi: Option<PrereservedDoi>,
}

#[derive(Debug, Deserialize)]
struct PrereservedDoi {
    doi: String,
}

impl From<DepositionResponse> for RemoteDeposit {
    fn from(resp: DepositionResponse) -> Self {
        Self {
            id: resp.id,
            links: resp.links,
            state: resp.state,
            submitted: resp.submitted,
            doi: resp
                .metadata
                .and_then(|m| m.prereserve_doi)
                .map(|p| p.doi),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    doi: Option<String>,
    #[serde(default)]
    links: PublishResponseLinks,
}

#[derive(Debug, Default, Deserialize)]
struct PublishResponseLinks {
    badge: Option<String>,
    html: Option<String>,
}

/// Zenodo REST client.
#[derive(Debug, Clone)]
pub struct ZenodoClient {
    http: Client,
    base_url: String,
    token: String,
}

impl ZenodoClient {
    pub fn new(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn depositions_url(&self) -> String {
        format!("{}/api/deposit/depositions", self.base_url)
    }
}

/// Turn a non-success response into [`ZenodoError::Status`].
async fn status_error(response: reqwest::Response) -> ZenodoError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body = if body.is_empty() {
        status.canonical_reason().unwrap_or("Unknown error").to_string()
    } else {
        body
    };
    ZenodoError::Status {
        status: status.as_u16(),
        body,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ZenodoError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(response).await)
    }
}

#[async_trait]
impl DepositApi for ZenodoClient {
    async fn create(&self, metadata: &DepositMetadata) -> Result<RemoteDeposit, ZenodoError> {
        let url = self.depositions_url();
        debug!(url = %url, title = %metadata.title, "Creating Zenodo deposition");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "metadata": metadata }))
            .send()
            .await?;
        let response = check_status(response).await?;

        let deposition: DepositionResponse = response
            .json()
            .await
            .map_err(|e| ZenodoError::Decode(format!("deposition: {}", e)))?;

        info!(deposition_id = deposition.id, "Zenodo deposition created");
        Ok(deposition.into())
    }

    async fn upload(
        &self,
        bucket_url: &str,
        file_name: &str,
        file: &Path,
    ) -> Result<serde_json::Value, ZenodoError> {
        let url = format!("{}/{}", bucket_url.trim_end_matches('/'), file_name);
        let handle = tokio::fs::File::open(file).await?;
        let size = handle.metadata().await?.len();

        debug!(url = %url, size = size, "Uploading to Zenodo bucket");

        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", size)
            .body(handle)
            .send()
            .await?;
        let response = check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ZenodoError::Decode(format!("upload: {}", e)))
    }

    async fn delete(&self, self_url: &str) -> Result<DeleteOutcome, ZenodoError> {
        let response = self
            .http
            .delete(self_url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::FORBIDDEN => Ok(DeleteOutcome::AlreadyPublished),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(DeleteOutcome::NotFound),
            status if status.is_success() => Ok(DeleteOutcome::Deleted),
            _ => Err(status_error(response).await),
        }
    }

    async fn publish(&self, publish_url: &str) -> Result<PublishedDeposit, ZenodoError> {
        let response = self
            .http
            .post(publish_url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = check_status(response).await?;

        let published: PublishResponse = response
            .json()
            .await
            .map_err(|e| ZenodoError::Decode(format!("publish: {}", e)))?;

        let doi = published
            .doi
            .ok_or_else(|| ZenodoError::Decode("publish response has no doi".to_string()))?;

        info!(doi = %doi, "Zenodo deposition published");
        Ok(PublishedDeposit {
            doi,
            badge: published.links.badge,
            record_url: published.links.html,
        })
    }
}
