//! Publish orchestration.
//!
//! [`Publisher`] validates datasets and routes the outcome to the right
//! delivery channel ([`Publisher::report_status`]), reacts to persisted
//! changes by synchronising the remote repository ([`Publisher::after_update`],
//! [`Publisher::after_destroy`]) and finishes a background repository build
//! ([`Publisher::complete_publishing`]). It also executes the background jobs
//! those steps enqueue.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dataset::{
    Dataset, DatasetDiff, DatasetFile, DatasetMetadata, FileUpdate, NewDatasetFile,
    PublishingMethod, User, ValidationContext, ValidationMode,
};
use crate::error::{JobError, PublishError, RepoError, Result};
use crate::jobs::{Job, JobHandler, JobQueue, JobRegistry, JobStatus, QueuedJob};
use crate::notify::{LiveEvent, Notifier};
use crate::repository::{CommittedFile, NewRepository, RepoFile, RepoHandle, RepositoryHost};
use crate::schema::SchemaLoader;
use crate::storage::{FileFetcher, FileStorage};
use crate::store::{DatasetStore, ErrorRecord};
use crate::views::{self, ViewRenderer};

/// Whether `report_status` runs for a new dataset or an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAction {
    Create,
    Update,
}

/// Result of [`Publisher::report_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The dataset was valid and has been persisted. `repository_job` is the
    /// id of the queued repository-creation job, if one was queued.
    Persisted { repository_job: Option<String> },
    /// The dataset was invalid; nothing was persisted.
    Rejected { messages: Vec<String> },
}

impl ReportOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, ReportOutcome::Persisted { .. })
    }
}

/// Input for creating a dataset.
#[derive(Debug, Clone)]
pub struct CreateDatasetRequest {
    pub metadata: DatasetMetadata,
    pub user: User,
    pub files: Vec<NewDatasetFile>,
}

/// Metadata edits; `None` fields are left alone. The name is fixed once the
/// repository exists.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub description: Option<String>,
    pub publisher_name: Option<String>,
    pub publisher_url: Option<String>,
    pub license: Option<String>,
    pub frequency: Option<String>,
    pub publishing_method: Option<PublishingMethod>,
}

impl MetadataUpdate {
    fn apply(self, metadata: &mut DatasetMetadata) {
        if let Some(v) = self.description {
            metadata.description = Some(v);
        }
        if let Some(v) = self.publisher_name {
            metadata.publisher_name = Some(v);
        }
        if let Some(v) = self.publisher_url {
            metadata.publisher_url = Some(v);
        }
        if let Some(v) = self.license {
            metadata.license = Some(v);
        }
        if let Some(v) = self.frequency {
            metadata.frequency = Some(v);
        }
        if let Some(v) = self.publishing_method {
            metadata.publishing_method = v;
        }
    }
}

/// Changes applied to a persisted dataset by an update job.
#[derive(Debug, Clone, Default)]
pub struct DatasetChanges {
    pub metadata: Option<MetadataUpdate>,
    pub files: Vec<(Uuid, FileUpdate)>,
    pub new_files: Vec<NewDatasetFile>,
}

impl DatasetChanges {
    pub fn file(file_id: Uuid, update: FileUpdate) -> Self {
        Self {
            files: vec![(file_id, update)],
            ..Default::default()
        }
    }
}

/// What a polling client learns about a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub status: Option<JobStatus>,
    /// Why the job itself failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Validation messages from the Error Record.
    pub errors: Vec<String>,
}

/// The collaborators a [`Publisher`] works with.
pub struct Collaborators {
    pub storage: Arc<dyn FileStorage>,
    pub fetcher: Arc<dyn FileFetcher>,
    pub schemas: Arc<dyn SchemaLoader>,
    pub host: Arc<dyn RepositoryHost>,
    pub store: Arc<dyn DatasetStore>,
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<JobRegistry>,
    pub notifier: Notifier,
}

pub struct Publisher {
    storage: Arc<dyn FileStorage>,
    fetcher: Arc<dyn FileFetcher>,
    schemas: Arc<dyn SchemaLoader>,
    host: Arc<dyn RepositoryHost>,
    store: Arc<dyn DatasetStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<JobRegistry>,
    notifier: Notifier,
    views: ViewRenderer,
}

impl Publisher {
    pub fn new(parts: Collaborators) -> Result<Self> {
        Ok(Self {
            storage: parts.storage,
            fetcher: parts.fetcher,
            schemas: parts.schemas,
            host: parts.host,
            store: parts.store,
            queue: parts.queue,
            registry: parts.registry,
            notifier: parts.notifier,
            views: ViewRenderer::new()?,
        })
    }

    pub fn store(&self) -> &dyn DatasetStore {
        self.store.as_ref()
    }

    fn validation_context(&self) -> ValidationContext<'_> {
        ValidationContext {
            storage: self.storage.as_ref(),
            schemas: self.schemas.as_ref(),
            host: self.host.as_ref(),
        }
    }

    async fn assemble_file(&self, input: NewDatasetFile) -> Result<DatasetFile> {
        DatasetFile::new_file(
            input,
            self.storage.as_ref(),
            self.fetcher.as_ref(),
            self.schemas.as_ref(),
        )
        .await
    }

    fn load(&self, dataset_id: Uuid) -> Result<Dataset> {
        self.store
            .find_dataset(dataset_id)?
            .ok_or(PublishError::DatasetNotFound { id: dataset_id })
    }

    // ── Inbound operations ───────────────────────────────────────────────

    /// Assemble a dataset from `request` and report its status.
    ///
    /// With a `channel_id` the outcome is pushed live. Without one, failures
    /// are recorded under the dataset's job id for polling.
    pub async fn create_dataset(
        &self,
        request: CreateDatasetRequest,
        channel_id: Option<&str>,
    ) -> Result<(Dataset, ReportOutcome)> {
        self.create_dataset_for_job(request, channel_id, Uuid::new_v4().to_string())
            .await
    }

    async fn create_dataset_for_job(
        &self,
        request: CreateDatasetRequest,
        channel_id: Option<&str>,
        job_id: String,
    ) -> Result<(Dataset, ReportOutcome)> {
        let mut dataset = Dataset::new(request.metadata, request.user).with_job_id(job_id);
        for input in request.files {
            let file = self.assemble_file(input).await?;
            dataset.add_file(file);
        }
        info!(
            dataset_id = %dataset.id,
            job_id = ?dataset.job_id,
            files = dataset.files.len(),
            "Dataset assembled"
        );
        let outcome = self
            .report_status(&mut dataset, channel_id, PublishAction::Create)
            .await?;
        Ok((dataset, outcome))
    }

    /// Queue a dataset creation with no live channel. Returns the job id to
    /// poll with [`Publisher::job_status`].
    pub fn submit_create_dataset(&self, request: CreateDatasetRequest) -> Result<String> {
        let job = QueuedJob::new(Job::CreateDataset {
            request: Box::new(request),
        });
        let id = job.id.clone();
        self.queue.enqueue(job)?;
        info!(job_id = %id, "Dataset creation queued");
        Ok(id)
    }

    /// Queue a partial update of one file. Always runs in the background.
    pub fn update_dataset_file(
        &self,
        dataset_id: Uuid,
        file_id: Uuid,
        update: FileUpdate,
    ) -> Result<String> {
        let dataset = self.load(dataset_id)?;
        if dataset.file(file_id).is_none() {
            return Err(PublishError::FileNotFound {
                dataset_id,
                file_id,
            });
        }
        self.update_dataset(dataset_id, DatasetChanges::file(file_id, update))
    }

    /// Queue arbitrary changes to a persisted dataset.
    pub fn update_dataset(&self, dataset_id: Uuid, changes: DatasetChanges) -> Result<String> {
        self.load(dataset_id)?;
        let job = QueuedJob::new(Job::UpdateDataset {
            dataset_id,
            changes,
        });
        let id = job.id.clone();
        self.queue.enqueue(job)?;
        info!(dataset_id = %dataset_id, job_id = %id, "Dataset update queued");
        Ok(id)
    }

    /// Remove the remote repository, then the persisted dataset.
    pub async fn destroy_dataset(&self, dataset_id: Uuid) -> Result<()> {
        let dataset = self.load(dataset_id)?;
        self.after_destroy(&dataset).await?;
        self.store.delete_dataset(dataset_id)?;
        info!(dataset_id = %dataset_id, "Dataset destroyed");
        Ok(())
    }

    /// Tracked status of a job plus any recorded validation messages.
    pub fn job_status(&self, job_id: &str) -> Result<JobReport> {
        let job = self.registry.get(job_id);
        let record = self.store.find_error(job_id)?;
        if job.is_none() && record.is_none() {
            return Err(JobError::NotFound {
                id: job_id.to_string(),
            }
            .into());
        }
        Ok(JobReport {
            job_id: job_id.to_string(),
            status: job.as_ref().map(|j| j.status),
            failure: job.and_then(|j| j.error),
            errors: record.map(|r| r.messages).unwrap_or_default(),
        })
    }

    // ── Status reporting ─────────────────────────────────────────────────

    /// Validate an unpersisted dataset and deliver the outcome.
    pub async fn report_status(
        &self,
        dataset: &mut Dataset,
        channel_id: Option<&str>,
        action: PublishAction,
    ) -> Result<ReportOutcome> {
        let mode = match action {
            PublishAction::Create => ValidationMode::Create,
            PublishAction::Update => ValidationMode::Update,
        };
        let valid = dataset.validate(self.validation_context(), mode).await?;

        if valid {
            info!(dataset_id = %dataset.id, ?action, "Dataset valid");
            if let Some(channel_id) = channel_id {
                self.notifier
                    .broadcast(channel_id, LiveEvent::created(dataset))
                    .await;
            }

            dataset.touch();
            self.store.save_dataset(dataset)?;

            let repository_job = match dataset.publishing_method() {
                PublishingMethod::LocalPrivate => {
                    self.notifier.success_email(dataset).await;
                    None
                }
                PublishingMethod::GithubPublic | PublishingMethod::GithubPrivate => match action {
                    PublishAction::Create => {
                        let job = QueuedJob::new(Job::CreateRepository {
                            dataset_id: dataset.id,
                        });
                        let id = job.id.clone();
                        self.queue.enqueue(job)?;
                        info!(dataset_id = %dataset.id, job_id = %id, "Repository creation queued");
                        Some(id)
                    }
                    PublishAction::Update => None,
                },
            };
            return Ok(ReportOutcome::Persisted { repository_job });
        }

        let messages = dataset.error_messages();
        info!(
            dataset_id = %dataset.id,
            errors = messages.len(),
            "Dataset invalid"
        );
        match channel_id {
            Some(channel_id) => {
                self.notifier
                    .broadcast(
                        channel_id,
                        LiveEvent::DatasetFailed {
                            messages: messages.clone(),
                        },
                    )
                    .await;
            }
            None => {
                let job_id = dataset.job_id.clone().unwrap_or_else(|| {
                    warn!(
                        dataset_id = %dataset.id,
                        "Dataset has no job id; keying errors by dataset id"
                    );
                    dataset.id.to_string()
                });
                self.store
                    .record_error(ErrorRecord::new(job_id, messages.clone()))?;
            }
        }
        Ok(ReportOutcome::Rejected { messages })
    }

    // ── Repository sync reactions ────────────────────────────────────────

    /// React to a persisted update of an already-created dataset.
    pub async fn after_update(&self, before: &Dataset, after: &mut Dataset) -> Result<()> {
        if !after.publishing_method().has_remote() {
            debug!(dataset_id = %after.id, "No remote repository to update");
            return Ok(());
        }
        if after.restricted() {
            debug!(dataset_id = %after.id, "Skipping sync of restricted dataset");
            return Ok(());
        }

        let diff = DatasetDiff::between(before, after);
        if diff.is_empty() {
            debug!(dataset_id = %after.id, "Nothing changed");
            return Ok(());
        }

        let repo = after.actual_repo(self.host.as_ref()).await?;

        let mut files = Vec::with_capacity(diff.changed_files.len() + 2);
        for file_id in &diff.changed_files {
            if let Some(file) = after.file(*file_id) {
                files.push(RepoFile::new(
                    views::data_path(file),
                    file.read_bytes(self.storage.as_ref())?,
                ));
            }
        }
        files.extend(self.metadata_files(after)?);
        let committed = self
            .host
            .push_files(&repo, &files, "Dataset updated")
            .await?;
        record_checksums(after, &committed);
        info!(
            dataset_id = %after.id,
            files = committed.len(),
            "Repository updated"
        );

        if diff.became_public() {
            self.host.make_public(&repo).await?;
            after.invalidate_repo();
            self.publish_public_views(after).await?;
        }

        self.store.save_dataset(after)?;
        Ok(())
    }

    /// React to a dataset being destroyed. A repository that no longer
    /// exists is not an error.
    pub async fn after_destroy(&self, dataset: &Dataset) -> Result<()> {
        if !dataset.publishing_method().has_remote() {
            return Ok(());
        }
        match self
            .host
            .delete_repository(dataset.repo_owner(), &dataset.repo)
            .await
        {
            Ok(()) => {
                info!(dataset_id = %dataset.id, repo = %dataset.full_name(), "Repository deleted");
                Ok(())
            }
            Err(RepoError::NotFound { full_name }) => {
                info!(repo = %full_name, "Repository does not exist");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Background repository build ──────────────────────────────────────

    /// Create (or re-use) the remote repository of a persisted dataset and
    /// push its contents.
    pub async fn run_create_repository(&self, dataset_id: Uuid) -> Result<String> {
        let mut dataset = self.load(dataset_id)?;
        if !dataset.publishing_method().has_remote() {
            info!(dataset_id = %dataset_id, "Local dataset needs no repository");
            return Ok("skipped: local dataset".into());
        }

        let repo = self.ensure_repository(&dataset).await?;
        dataset.cache_repo(repo.clone());
        dataset.url = Some(repo.html_url.clone());
        self.store.save_dataset(&dataset)?;

        let mut files = Vec::with_capacity(dataset.files.len() + 2);
        for file in &dataset.files {
            files.push(RepoFile::new(
                views::data_path(file),
                file.read_bytes(self.storage.as_ref())?,
            ));
        }
        files.extend(self.metadata_files(&dataset)?);
        let committed = self
            .host
            .push_files(&repo, &files, "Dataset created")
            .await?;
        record_checksums(&mut dataset, &committed);
        dataset.touch();
        self.store.save_dataset(&dataset)?;
        info!(dataset_id = %dataset_id, repo = %repo.full_name(), "Repository built");

        self.complete_publishing(&mut dataset).await?;
        Ok(format!("published {}", dataset.full_name()))
    }

    async fn ensure_repository(&self, dataset: &Dataset) -> Result<RepoHandle> {
        let owner = dataset.repo_owner();
        // A url is only recorded once this dataset's repository exists, so a
        // redelivered job picks the repository up again.
        if dataset.url.is_some() {
            match self.host.fetch_repository(owner, &dataset.repo).await {
                Ok(handle) => {
                    info!(repo = %handle.full_name(), "Re-using existing repository");
                    return Ok(handle);
                }
                Err(RepoError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let request = NewRepository {
            owner: owner.to_string(),
            name: dataset.repo.clone(),
            description: dataset.metadata.description.clone(),
            homepage: (!dataset.restricted()).then(|| dataset.gh_pages_url()),
            private: dataset.restricted(),
            organisation: dataset.owned_by_organisation(),
        };
        Ok(self.host.create_repository(&request).await?)
    }

    fn metadata_files(&self, dataset: &Dataset) -> Result<Vec<RepoFile>> {
        Ok(vec![
            RepoFile::new("datapackage.json", views::datapackage(dataset)?),
            RepoFile::new("_config.yml", dataset.site_config()?),
        ])
    }

    /// Finish publishing after the repository has been built.
    pub async fn complete_publishing(&self, dataset: &mut Dataset) -> Result<()> {
        dataset.refresh_repo(self.host.as_ref()).await?;
        self.set_owner_avatar(dataset).await?;
        self.publish_public_views(dataset).await?;
        self.notifier.success_email(dataset).await;
        self.notifier.announce(dataset).await;
        self.store.save_dataset(dataset)?;
        info!(dataset_id = %dataset.id, "Publishing complete");
        Ok(())
    }

    async fn set_owner_avatar(&self, dataset: &mut Dataset) -> Result<()> {
        dataset.owner_avatar = if dataset.owned_by_organisation() {
            Some(self.host.organisation_avatar(dataset.repo_owner()).await?)
        } else {
            dataset.user.avatar_url.clone()
        };
        debug!(dataset_id = %dataset.id, avatar = ?dataset.owner_avatar, "Owner avatar set");
        Ok(())
    }

    /// Render and push the public views. Restricted datasets have none.
    async fn publish_public_views(&self, dataset: &mut Dataset) -> Result<()> {
        if dataset.restricted() {
            debug!(dataset_id = %dataset.id, "No public views for restricted dataset");
            return Ok(());
        }
        let repo = dataset.actual_repo(self.host.as_ref()).await?;
        let pages = self.views.view_files(dataset)?;
        self.host.ensure_branch(&repo, views::PAGES_BRANCH).await?;
        let committed = self
            .host
            .push_files(&repo, &pages, "Update public views")
            .await?;
        for page in &committed {
            if let Some(file) = dataset
                .files
                .iter_mut()
                .find(|f| views::page_path(f) == page.path)
            {
                file.view_sha = Some(page.sha.clone());
            }
        }
        info!(dataset_id = %dataset.id, pages = committed.len(), "Public views published");
        Ok(())
    }

    // ── Background update ────────────────────────────────────────────────

    /// Apply `changes` to a persisted dataset, report its status and sync the
    /// repository.
    pub async fn run_update_dataset(
        &self,
        job_id: &str,
        dataset_id: Uuid,
        changes: DatasetChanges,
    ) -> Result<ReportOutcome> {
        let before = self.load(dataset_id)?;
        let mut after = before.clone();
        after.job_id = Some(job_id.to_string());

        if let Some(metadata) = changes.metadata {
            metadata.apply(&mut after.metadata);
        }
        for (file_id, update) in changes.files {
            let file = after
                .file_mut(file_id)
                .ok_or(PublishError::FileNotFound {
                    dataset_id,
                    file_id,
                })?;
            file.update_file(
                update,
                self.storage.as_ref(),
                self.fetcher.as_ref(),
                self.schemas.as_ref(),
            )
            .await?;
        }
        for input in changes.new_files {
            let file = self.assemble_file(input).await?;
            after.add_file(file);
        }

        let outcome = self
            .report_status(&mut after, None, PublishAction::Update)
            .await?;
        if outcome.is_persisted() {
            self.after_update(&before, &mut after).await?;
        }
        Ok(outcome)
    }
}

fn record_checksums(dataset: &mut Dataset, committed: &[CommittedFile]) {
    for entry in committed {
        if entry.path == "datapackage.json" {
            dataset.datapackage_sha = Some(entry.sha.clone());
        } else if let Some(file) = dataset
            .files
            .iter_mut()
            .find(|f| views::data_path(f) == entry.path)
        {
            file.file_sha = Some(entry.sha.clone());
        }
    }
}

#[async_trait]
impl JobHandler for Publisher {
    async fn handle(&self, job: &QueuedJob) -> Result<String> {
        match &job.job {
            Job::CreateDataset { request } => {
                let (dataset, outcome) = self
                    .create_dataset_for_job((**request).clone(), None, job.id.clone())
                    .await?;
                Ok(summarize(&dataset, &outcome))
            }
            Job::CreateRepository { dataset_id } => self.run_create_repository(*dataset_id).await,
            Job::UpdateDataset {
                dataset_id,
                changes,
            } => {
                let outcome = self
                    .run_update_dataset(&job.id, *dataset_id, changes.clone())
                    .await?;
                let dataset = self.load(*dataset_id)?;
                Ok(summarize(&dataset, &outcome))
            }
        }
    }
}

fn summarize(dataset: &Dataset, outcome: &ReportOutcome) -> String {
    match outcome {
        ReportOutcome::Persisted { .. } => format!("dataset {} saved", dataset.id),
        ReportOutcome::Rejected { messages } => {
            format!("dataset rejected with {} error(s)", messages.len())
        }
    }
}
