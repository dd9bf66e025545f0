//! Datasets: the publishable unit and its data files.
//!
//! A [`Dataset`] owns its [`DatasetFile`]s. Validation is an explicit
//! [`Dataset::validate`] call that recurses into every file and keeps each
//! entity's errors on the entity itself.

mod file;

pub use file::{DatasetFile, FileSource, FileUpdate, NewDatasetFile, SchemaSpec};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::error::{PublishError, RepoError, ValidationError, ViewError};
use crate::repository::{RepoHandle, RepositoryHost};
use crate::schema::SchemaLoader;
use crate::storage::FileStorage;
use crate::validation::ValidationErrors;

/// Where (and whether) a dataset's remote repository lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishingMethod {
    /// Public repository with public views.
    #[default]
    GithubPublic,
    /// Private repository, no public views.
    GithubPrivate,
    /// Kept locally; no remote repository at all.
    LocalPrivate,
}

impl PublishingMethod {
    /// Whether a remote repository exists for this method.
    pub fn has_remote(self) -> bool {
        match self {
            PublishingMethod::GithubPublic | PublishingMethod::GithubPrivate => true,
            PublishingMethod::LocalPrivate => false,
        }
    }

    pub fn is_public(self) -> bool {
        match self {
            PublishingMethod::GithubPublic => true,
            PublishingMethod::GithubPrivate | PublishingMethod::LocalPrivate => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PublishingMethod::GithubPublic => "github_public",
            PublishingMethod::GithubPrivate => "github_private",
            PublishingMethod::LocalPrivate => "local_private",
        }
    }
}

impl std::fmt::Display for PublishingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PublishingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github_public" => Ok(PublishingMethod::GithubPublic),
            "github_private" => Ok(PublishingMethod::GithubPrivate),
            "local_private" => Ok(PublishingMethod::LocalPrivate),
            other => Err(format!(
                "unknown publishing method '{other}' (expected github_public, github_private or local_private)"
            )),
        }
    }
}

/// The user who creates a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Login on the repository host.
    pub login: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter_handle: Option<String>,
}

impl User {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            login: login.into(),
            ..Default::default()
        }
    }
}

/// Descriptive fields supplied when creating or editing a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub publisher_name: Option<String>,
    #[serde(default)]
    pub publisher_url: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub publishing_method: PublishingMethod,
    /// Organisation that owns the repository instead of the creating user.
    #[serde(default)]
    pub owner: Option<String>,
}

/// Collaborators needed to validate a dataset.
#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    pub storage: &'a dyn FileStorage,
    pub schemas: &'a dyn SchemaLoader,
    pub host: &'a dyn RepositoryHost,
}

/// Whether validation runs for a new dataset or an edit of a persisted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Create,
    Update,
}

/// A publishable dataset and its files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    #[serde(flatten)]
    pub metadata: DatasetMetadata,
    pub user: User,
    /// Repository name, derived from the dataset name at creation.
    pub repo: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub owner_avatar: Option<String>,
    #[serde(default)]
    pub build_status: Option<String>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub datapackage_sha: Option<String>,
    #[serde(default)]
    pub certificate_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<DatasetFile>,
    #[serde(skip)]
    errors: ValidationErrors,
    #[serde(skip)]
    repo_handle: Option<RepoHandle>,
}

impl Dataset {
    pub fn new(metadata: DatasetMetadata, user: User) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repo: parameterize(&metadata.name),
            metadata,
            user,
            url: None,
            owner_avatar: None,
            build_status: None,
            job_id: None,
            datapackage_sha: None,
            certificate_url: None,
            created_at: now,
            updated_at: now,
            files: Vec::new(),
            errors: ValidationErrors::new(),
            repo_handle: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn publishing_method(&self) -> PublishingMethod {
        self.metadata.publishing_method
    }

    pub fn add_file(&mut self, file: DatasetFile) {
        self.files.push(file);
    }

    pub fn file(&self, id: Uuid) -> Option<&DatasetFile> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn file_mut(&mut self, id: Uuid) -> Option<&mut DatasetFile> {
        self.files.iter_mut().find(|f| f.id == id)
    }

    /// The account that owns the remote repository.
    pub fn repo_owner(&self) -> &str {
        match self.metadata.owner.as_deref() {
            Some(owner) if !owner.trim().is_empty() => owner,
            _ => &self.user.login,
        }
    }

    /// Whether an explicit organisation owns the repository.
    pub fn owned_by_organisation(&self) -> bool {
        self.repo_owner() != self.user.login
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.repo_owner(), self.repo)
    }

    pub fn github_url(&self) -> String {
        format!("http://github.com/{}", self.full_name())
    }

    pub fn gh_pages_url(&self) -> String {
        format!("http://{}.github.io/{}", self.repo_owner(), self.repo)
    }

    /// Visibility is restricted for anything other than a public repository.
    pub fn restricted(&self) -> bool {
        !self.publishing_method().is_public()
    }

    /// Names of the schemas attached to this dataset's files, comma-separated.
    pub fn schema_names(&self) -> Option<String> {
        let names: Vec<&str> = self
            .files
            .iter()
            .filter_map(|f| f.schema_name())
            .collect();
        (!names.is_empty()).then(|| names.join(", "))
    }

    /// Site configuration pushed alongside the data.
    pub fn site_config(&self) -> Result<String, ViewError> {
        #[derive(Serialize)]
        struct SiteConfig<'a> {
            data_dir: &'a str,
            update_frequency: Option<&'a str>,
            permalink: &'a str,
        }
        let config = SiteConfig {
            data_dir: ".",
            update_frequency: self.metadata.frequency.as_deref(),
            permalink: "pretty",
        };
        serde_yaml::to_string(&config).map_err(|e| ViewError::Serialize {
            artifact: "_config.yml".into(),
            message: e.to_string(),
        })
    }

    /// Join `folder` and `filename`, skipping blank parts.
    pub fn path(filename: &str, folder: &str) -> String {
        [folder, filename]
            .iter()
            .filter(|p| !p.trim().is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn errors(&self) -> &ValidationErrors {
        &self.errors
    }

    /// Validate the dataset and every file it owns.
    ///
    /// Validation problems are collected on the dataset and its files;
    /// the returned `Err` is reserved for collaborator failures.
    pub async fn validate(
        &mut self,
        ctx: ValidationContext<'_>,
        mode: ValidationMode,
    ) -> Result<bool, PublishError> {
        self.errors.clear();

        if self.metadata.name.trim().is_empty() {
            self.errors
                .push(ValidationError::RequiredFieldMissing { field: "Name" });
        }

        if mode == ValidationMode::Create {
            self.check_repo(ctx.host).await?;
        }

        let mut files_valid = true;
        for file in &mut self.files {
            if !file.validate(ctx).await {
                files_valid = false;
            }
        }

        let valid = self.errors.is_empty() && files_valid;
        debug!(dataset_id = %self.id, valid, "Dataset validated");
        Ok(valid)
    }

    async fn check_repo(&mut self, host: &dyn RepositoryHost) -> Result<(), RepoError> {
        match self.publishing_method() {
            PublishingMethod::GithubPublic | PublishingMethod::GithubPrivate => {
                let owner = self.repo_owner().to_string();
                let name = parameterize(&self.metadata.name);
                info!(owner = %owner, repo = %name, "Checking for an existing repository");
                if host.repository_exists(&owner, &name).await? {
                    self.errors.push(ValidationError::RepositoryConflict {
                        full_name: format!("{owner}/{name}"),
                    });
                }
                Ok(())
            }
            PublishingMethod::LocalPrivate => Ok(()),
        }
    }

    /// Dataset-level messages followed by each invalid file's messages,
    /// de-duplicated.
    pub fn error_messages(&self) -> Vec<String> {
        let mut messages = self.errors.messages();
        for file in self.files.iter().filter(|f| !f.errors().is_empty()) {
            messages.extend(file.error_messages());
        }
        crate::validation::dedup_messages(messages)
    }

    /// The cached remote repository handle, fetched on first use.
    pub async fn actual_repo(
        &mut self,
        host: &dyn RepositoryHost,
    ) -> Result<RepoHandle, RepoError> {
        if let Some(handle) = &self.repo_handle {
            return Ok(handle.clone());
        }
        self.refresh_repo(host).await
    }

    /// Re-fetch the remote repository handle and replace the cached one.
    pub async fn refresh_repo(
        &mut self,
        host: &dyn RepositoryHost,
    ) -> Result<RepoHandle, RepoError> {
        let handle = host.fetch_repository(self.repo_owner(), &self.repo).await?;
        self.repo_handle = Some(handle.clone());
        Ok(handle)
    }

    pub fn cache_repo(&mut self, handle: RepoHandle) {
        self.repo_handle = Some(handle);
    }

    pub fn invalidate_repo(&mut self) {
        self.repo_handle = None;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// What changed between the persisted state of a dataset and its new state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatasetDiff {
    /// `(before, after)` when the publishing method changed.
    pub publishing_method: Option<(PublishingMethod, PublishingMethod)>,
    pub metadata_changed: bool,
    /// Files that are new or whose content, metadata or schema changed.
    pub changed_files: Vec<Uuid>,
}

impl DatasetDiff {
    pub fn between(before: &Dataset, after: &Dataset) -> Self {
        let (old, new) = (before.publishing_method(), after.publishing_method());
        let publishing_method = (old != new).then_some((old, new));

        let (b, a) = (&before.metadata, &after.metadata);
        let metadata_changed = b.name != a.name
            || b.description != a.description
            || b.publisher_name != a.publisher_name
            || b.publisher_url != a.publisher_url
            || b.license != a.license
            || b.frequency != a.frequency;

        let changed_files = after
            .files
            .iter()
            .filter(|file| match before.file(file.id) {
                None => true,
                Some(prev) => file.differs_from(prev),
            })
            .map(|file| file.id)
            .collect();

        Self {
            publishing_method,
            metadata_changed,
            changed_files,
        }
    }

    /// Whether this change is the transition to a public repository.
    pub fn became_public(&self) -> bool {
        matches!(self.publishing_method, Some((old, new)) if !old.is_public() && new.is_public())
    }

    pub fn is_empty(&self) -> bool {
        self.publishing_method.is_none() && !self.metadata_changed && self.changed_files.is_empty()
    }
}

/// Turn free text into a URL-safe slug: ASCII, lowercase, dash-separated.
pub fn parameterize(text: &str) -> String {
    let ascii: String = text.nfkd().filter(char::is_ascii).collect();
    let mut slug = String::with_capacity(ascii.len());
    let mut pending_dash = false;
    for ch in ascii.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}
