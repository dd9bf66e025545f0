//! Repository-host collaborator.
//!
//! The host is reached through the [`RepositoryHost`] trait. Failures come
//! back as a typed [`RepoError`] so callers can match the not-found case
//! explicitly. In tests, in-memory implementations avoid network calls.

mod github;

pub use github::GitHubHost;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::RepoError;

/// A resolved remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoHandle {
    pub owner: String,
    pub name: String,
    pub html_url: String,
    pub private: bool,
    pub default_branch: String,
}

impl RepoHandle {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Parameters for creating a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRepository {
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub private: bool,
    /// Create under an organisation rather than the authenticated user.
    pub organisation: bool,
}

/// A file to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    pub path: String,
    pub content: Bytes,
    /// Target branch; the repository's default branch when `None`.
    pub branch: Option<String>,
}

impl RepoFile {
    pub fn new(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            branch: None,
        }
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// A committed file and the checksum the host assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedFile {
    pub path: String,
    pub sha: String,
}

/// Operations the publisher needs from the repository host.
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    /// Whether `owner/name` exists.
    async fn repository_exists(&self, owner: &str, name: &str) -> Result<bool, RepoError>;

    async fn create_repository(&self, request: &NewRepository) -> Result<RepoHandle, RepoError>;

    async fn fetch_repository(&self, owner: &str, name: &str) -> Result<RepoHandle, RepoError>;

    /// Commit `files`, creating or replacing each path.
    async fn push_files(
        &self,
        repo: &RepoHandle,
        files: &[RepoFile],
        message: &str,
    ) -> Result<Vec<CommittedFile>, RepoError>;

    /// Create `branch` from the tip of the default branch unless it already
    /// exists.
    async fn ensure_branch(&self, repo: &RepoHandle, branch: &str) -> Result<(), RepoError>;

    async fn make_public(&self, repo: &RepoHandle) -> Result<(), RepoError>;

    /// Delete `owner/name`; a missing repository is reported as
    /// [`RepoError::NotFound`].
    async fn delete_repository(&self, owner: &str, name: &str) -> Result<(), RepoError>;

    /// Avatar URL of an organisation, looked up with administrative access.
    async fn organisation_avatar(&self, organisation: &str) -> Result<String, RepoError>;
}
