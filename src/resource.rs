//! Submission identifiers and the four archivable resource kinds.
//!
//! Every derived filename (deposit record, receipts, local archives) is
//! built here so the naming templates live in one place.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Review case identifier.
///
/// Displayed as a five digit zero-padded decimal (`42` -> `00042`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub u32);

impl SubmissionId {
    /// Zero-padded form used in every path and filename.
    pub fn padded(&self) -> String {
        format!("{:05}", self.0)
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

impl From<u32> for SubmissionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Archivable artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Built Jupyter Book (HTML tree).
    Book,

    /// Source repository snapshot.
    Repository,

    /// Dataset directory.
    #[serde(rename = "data")]
    Dataset,

    /// Container image the book was built in.
    #[serde(rename = "docker")]
    DockerImage,
}

impl ResourceType {
    /// All kinds, in canonical order.
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Book,
        ResourceType::Repository,
        ResourceType::Dataset,
        ResourceType::DockerImage,
    ];

    /// Token used in receipt filenames and JSON keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::Repository => "repository",
            Self::Dataset => "data",
            Self::DockerImage => "docker",
        }
    }

    /// Archive name prefix (`<Kind>_...`).
    pub fn archive_prefix(&self) -> &'static str {
        match self {
            Self::Book => "JupyterBook",
            Self::Repository => "GitHubRepo",
            Self::Dataset => "DatasetArchive",
            Self::DockerImage => "DockerImage",
        }
    }

    /// Extension of the local archive produced for this kind.
    pub fn archive_extension(&self) -> &'static str {
        match self {
            Self::DockerImage => "tar.gz",
            _ => "zip",
        }
    }

    /// Human label used in deposit titles.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Book => "Jupyter Book",
            Self::Repository => "GitHub repository",
            Self::Dataset => "Dataset",
            Self::DockerImage => "Docker image",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First six characters of a commit hash.
pub fn short_commit(commit: &str) -> &str {
    let end = commit
        .char_indices()
        .nth(6)
        .map(|(i, _)| i)
        .unwrap_or(commit.len());
    &commit[..end]
}

/// Archive stem: `<Kind>_<doiPrefix>_<journal>_<paddedId>_<shortCommit>`.
pub fn archive_stem(
    kind: ResourceType,
    doi_prefix: &str,
    journal: &str,
    submission: SubmissionId,
    commit: &str,
) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        kind.archive_prefix(),
        doi_prefix,
        journal,
        submission.padded(),
        short_commit(commit)
    )
}

/// Full archive filename including extension.
pub fn archive_file_name(
    kind: ResourceType,
    doi_prefix: &str,
    journal: &str,
    submission: SubmissionId,
    commit: &str,
) -> String {
    format!(
        "{}.{}",
        archive_stem(kind, doi_prefix, journal, submission, commit),
        kind.archive_extension()
    )
}

/// Prefix shared by every archive of `kind` for a submission, whatever the commit.
pub fn archive_name_prefix(
    kind: ResourceType,
    doi_prefix: &str,
    journal: &str,
    submission: SubmissionId,
) -> String {
    format!(
        "{}_{}_{}_{}_",
        kind.archive_prefix(),
        doi_prefix,
        journal,
        submission.padded()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_padding() {
        assert_eq!(SubmissionId(42).to_string(), "00042");
        assert_eq!(SubmissionId(123456).padded(), "123456");
    }

    #[test]
    fn test_resource_tokens() {
        assert_eq!(ResourceType::Dataset.as_str(), "data");
        assert_eq!(
            serde_json::to_string(&ResourceType::DockerImage).unwrap(),
            "\"docker\""
        );
    }

    #[test]
    fn test_archive_names() {
        let name = archive_file_name(
            ResourceType::Book,
            "10.55458",
            "NeuroLibre",
            SubmissionId(42),
            "e29aa259f6807e62610bc84a86d406065028fe29",
        );
        assert_eq!(name, "JupyterBook_10.55458_NeuroLibre_00042_e29aa2.zip");

        let docker = archive_file_name(
            ResourceType::DockerImage,
            "10.55458",
            "NeuroLibre",
            SubmissionId(7),
            "abc",
        );
        assert_eq!(docker, "DockerImage_10.55458_NeuroLibre_00007_abc.tar.gz");
        assert!(docker.starts_with(&archive_name_prefix(
            ResourceType::DockerImage,
            "10.55458",
            "NeuroLibre",
            SubmissionId(7)
        )));
    }
}
