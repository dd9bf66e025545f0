//! Integration tests for the publish flow.
//!
//! A recording repository host, live channel and job queue stand in for the
//! network so every collaborator call can be counted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use tablepub_core::error::{JobError, NotifyError};
use tablepub_core::jobs::JobHandler;
use tablepub_core::notify::LiveChannel;
use tablepub_core::repository::{CommittedFile, NewRepository, RepoFile};
use tablepub_core::schema::InMemorySchemaLoader;
use tablepub_core::storage::InMemoryFetcher;
use tablepub_core::{
    ChannelJobQueue, Collaborators, CreateDatasetRequest, DatasetChanges, DatasetMetadata,
    DatasetStore, FileSource, Job, JobQueue, JobRegistry, JobStatus, JobWorker, LiveEvent,
    MemoryStorage, MemoryStore, MetadataUpdate, NewDatasetFile, Notifier, PublishError,
    PublishingMethod, Publisher, QueuedJob, RepoError, RepoHandle, RepositoryHost, ReportOutcome,
    User,
};

// ── Recording collaborators ─────────────────────────────────────────────────

#[derive(Clone, Copy, Default)]
enum DeleteBehaviour {
    #[default]
    Succeed,
    NotFound,
    Fail,
}

#[derive(Default)]
struct HostState {
    existing: HashSet<String>,
    branches: HashMap<String, HashSet<String>>,
    calls: usize,
    created: Vec<NewRepository>,
    pushed: Vec<Vec<String>>,
    made_public: usize,
    deleted: Vec<String>,
    delete: DeleteBehaviour,
}

#[derive(Default)]
struct RecordingHost {
    state: Mutex<HostState>,
}

impl RecordingHost {
    fn with_repository(full_name: &str) -> Self {
        let host = Self::default();
        {
            let mut state = host.state.lock().unwrap();
            state.existing.insert(full_name.into());
            state
                .branches
                .insert(full_name.into(), HashSet::from(["main".to_string()]));
        }
        host
    }

    fn deleting(behaviour: DeleteBehaviour) -> Self {
        let host = Self::default();
        host.state.lock().unwrap().delete = behaviour;
        host
    }

    fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    fn created(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }

    fn made_public(&self) -> usize {
        self.state.lock().unwrap().made_public
    }

    fn pushed_paths(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pushed
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn pushes(&self) -> usize {
        self.state.lock().unwrap().pushed.len()
    }

    fn branches(&self, full_name: &str) -> HashSet<String> {
        self.state
            .lock()
            .unwrap()
            .branches
            .get(full_name)
            .cloned()
            .unwrap_or_default()
    }

    fn handle(owner: &str, name: &str, private: bool) -> RepoHandle {
        RepoHandle {
            owner: owner.into(),
            name: name.into(),
            html_url: format!("https://github.com/{owner}/{name}"),
            private,
            default_branch: "main".into(),
        }
    }
}

#[async_trait]
impl RepositoryHost for RecordingHost {
    async fn repository_exists(&self, owner: &str, name: &str) -> Result<bool, RepoError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state.existing.contains(&format!("{owner}/{name}")))
    }

    async fn create_repository(&self, request: &NewRepository) -> Result<RepoHandle, RepoError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let full_name = format!("{}/{}", request.owner, request.name);
        if !state.existing.insert(full_name.clone()) {
            return Err(RepoError::AlreadyExists { full_name });
        }
        state.created.push(request.clone());
        state
            .branches
            .insert(full_name, HashSet::from(["main".to_string()]));
        Ok(Self::handle(&request.owner, &request.name, request.private))
    }

    async fn fetch_repository(&self, owner: &str, name: &str) -> Result<RepoHandle, RepoError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let full_name = format!("{owner}/{name}");
        if !state.existing.contains(&full_name) {
            return Err(RepoError::NotFound { full_name });
        }
        Ok(Self::handle(owner, name, false))
    }

    async fn push_files(
        &self,
        repo: &RepoHandle,
        files: &[RepoFile],
        _message: &str,
    ) -> Result<Vec<CommittedFile>, RepoError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let branches = state.branches.get(&repo.full_name()).cloned().unwrap_or_default();
        for file in files {
            let branch = file.branch.as_deref().unwrap_or(&repo.default_branch);
            if !branches.contains(branch) {
                return Err(RepoError::Api {
                    status: 404,
                    message: format!("Branch {branch} not found"),
                });
            }
        }
        state
            .pushed
            .push(files.iter().map(|f| f.path.clone()).collect());
        Ok(files
            .iter()
            .map(|f| CommittedFile {
                path: f.path.clone(),
                sha: format!("sha-{}", f.path),
            })
            .collect())
    }

    async fn ensure_branch(&self, repo: &RepoHandle, branch: &str) -> Result<(), RepoError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let branches = state.branches.entry(repo.full_name()).or_default();
        if !branches.contains(&repo.default_branch) {
            return Err(RepoError::NotFound {
                full_name: repo.full_name(),
            });
        }
        branches.insert(branch.to_string());
        Ok(())
    }

    async fn make_public(&self, _repo: &RepoHandle) -> Result<(), RepoError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.made_public += 1;
        Ok(())
    }

    async fn delete_repository(&self, owner: &str, name: &str) -> Result<(), RepoError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let full_name = format!("{owner}/{name}");
        match state.delete {
            DeleteBehaviour::Succeed => {
                state.deleted.push(full_name);
                Ok(())
            }
            DeleteBehaviour::NotFound => Err(RepoError::NotFound { full_name }),
            DeleteBehaviour::Fail => Err(RepoError::Api {
                status: 500,
                message: "server error".into(),
            }),
        }
    }

    async fn organisation_avatar(&self, organisation: &str) -> Result<String, RepoError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(format!("https://avatars.example/{organisation}"))
    }
}

#[derive(Default)]
struct RecordingLive {
    events: Mutex<Vec<(String, LiveEvent)>>,
}

impl RecordingLive {
    fn events(&self) -> Vec<(String, LiveEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveChannel for RecordingLive {
    async fn push(&self, channel_id: &str, event: &LiveEvent) -> Result<(), NotifyError> {
        self.events
            .lock()
            .unwrap()
            .push((channel_id.to_string(), event.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingQueue {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl RecordingQueue {
    fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, job: QueuedJob) -> Result<(), JobError> {
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────────────

struct Harness {
    publisher: Publisher,
    host: Arc<RecordingHost>,
    live: Arc<RecordingLive>,
    queue: Arc<RecordingQueue>,
    store: Arc<MemoryStore>,
}

fn harness(host: RecordingHost) -> Harness {
    let host = Arc::new(host);
    let live = Arc::new(RecordingLive::default());
    let queue = Arc::new(RecordingQueue::default());
    let store = Arc::new(MemoryStore::new());
    let publisher = Publisher::new(Collaborators {
        storage: Arc::new(MemoryStorage::new()),
        fetcher: Arc::new(fetcher()),
        schemas: Arc::new(InMemorySchemaLoader::new()),
        host: host.clone(),
        store: store.clone(),
        queue: queue.clone(),
        registry: Arc::new(JobRegistry::default()),
        notifier: Notifier::new(live.clone()),
    })
    .unwrap();
    Harness {
        publisher,
        host,
        live,
        queue,
        store,
    }
}

const REMOTE_CSV: &str = "https://example.org/exports/cats.csv";

fn fetcher() -> InMemoryFetcher {
    InMemoryFetcher::new().with_file(REMOTE_CSV, GOOD)
}

fn upload(title: &str, content: &'static str) -> NewDatasetFile {
    NewDatasetFile {
        title: title.into(),
        description: None,
        source: FileSource::Upload {
            filename: format!("{title}.csv"),
            bytes: Bytes::from_static(content.as_bytes()),
        },
        schema: None,
    }
}

fn request(method: PublishingMethod, files: Vec<NewDatasetFile>) -> CreateDatasetRequest {
    CreateDatasetRequest {
        metadata: DatasetMetadata {
            name: "Cat Census".into(),
            description: Some("Cats, counted".into()),
            publishing_method: method,
            ..Default::default()
        },
        user: User::new("alice"),
        files,
    }
}

const GOOD: &str = "name,age\nTom,3\nFelix,5\n";
const BAD: &str = "name,age\nTom\n";

// ── Status reporting ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_with_live_channel_broadcasts_failure_only() {
    let h = harness(RecordingHost::default());
    let (dataset, outcome) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPublic, vec![upload("Cats", BAD)]),
            Some("channel-1"),
        )
        .await
        .unwrap();

    assert!(!outcome.is_persisted());
    assert!(h.store.list_datasets().unwrap().is_empty());
    let job_id = dataset.job_id.clone().unwrap();
    assert!(h.store.find_error(&job_id).unwrap().is_none());

    let events = h.live.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "channel-1");
    assert!(matches!(events[0].1, LiveEvent::DatasetFailed { .. }));
    assert_eq!(h.queue.len(), 0);
}

#[tokio::test]
async fn test_invalid_without_channel_records_error() {
    let h = harness(RecordingHost::default());
    let (dataset, outcome) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPublic, vec![upload("Cats", BAD)]),
            None,
        )
        .await
        .unwrap();

    let ReportOutcome::Rejected { messages } = outcome else {
        panic!("dataset should have been rejected");
    };
    let record = h
        .store
        .find_error(dataset.job_id.as_deref().unwrap())
        .unwrap()
        .expect("error record");
    assert_eq!(record.messages, messages);
    assert!(h.live.events().is_empty());
    assert!(h.store.list_datasets().unwrap().is_empty());
}

#[tokio::test]
async fn test_two_invalid_files_give_one_message_each() {
    let h = harness(RecordingHost::default());
    let (_, outcome) = h
        .publisher
        .create_dataset(
            request(
                PublishingMethod::LocalPrivate,
                vec![upload("Cats", BAD), upload("Dogs", BAD)],
            ),
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReportOutcome::Rejected {
            messages: vec![
                "Your file 'Cats' does not appear to be a valid CSV. Please check your file and try again.".to_string(),
                "Your file 'Dogs' does not appear to be a valid CSV. Please check your file and try again.".to_string(),
            ]
        }
    );
}

#[tokio::test]
async fn test_valid_with_live_channel_persists_and_queues_repository() {
    let h = harness(RecordingHost::default());
    let (dataset, outcome) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPublic, vec![upload("Cats", GOOD)]),
            Some("channel-1"),
        )
        .await
        .unwrap();

    let ReportOutcome::Persisted {
        repository_job: Some(job_id),
    } = outcome
    else {
        panic!("expected a queued repository job");
    };
    assert!(h.store.find_dataset(dataset.id).unwrap().is_some());

    let jobs = h.queue.jobs.lock().unwrap().clone();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job_id);
    assert!(matches!(
        jobs[0].job,
        Job::CreateRepository { dataset_id } if dataset_id == dataset.id
    ));

    let events = h.live.events();
    assert_eq!(events.len(), 1);
    match &events[0].1 {
        LiveEvent::DatasetCreated { dataset: payload } => {
            assert_eq!(payload["name"], "Cat Census");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_existing_repository_is_a_validation_error() {
    let h = harness(RecordingHost::with_repository("alice/cat-census"));
    let (_, outcome) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPublic, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReportOutcome::Rejected {
            messages: vec!["Repository name alice/cat-census already exists".to_string()]
        }
    );
}

#[tokio::test]
async fn test_local_private_never_calls_host() {
    let h = harness(RecordingHost::default());
    let (dataset, outcome) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::LocalPrivate, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReportOutcome::Persisted {
            repository_job: None
        }
    );
    assert_eq!(h.queue.len(), 0);

    let summary = h.publisher.run_create_repository(dataset.id).await.unwrap();
    assert!(summary.starts_with("skipped"));
    h.publisher.destroy_dataset(dataset.id).await.unwrap();
    assert_eq!(h.host.calls(), 0);
}

// ── Repository build ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_repository_build_pushes_data_and_views() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPublic, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();

    h.publisher.run_create_repository(dataset.id).await.unwrap();

    let paths = h.host.pushed_paths();
    for expected in [
        "data/cats.csv",
        "datapackage.json",
        "_config.yml",
        "index.html",
        "data/cats.html",
    ] {
        assert!(paths.iter().any(|p| p == expected), "missing {expected}");
    }
    assert!(h.host.branches("alice/cat-census").contains("gh-pages"));

    let stored = h.store.find_dataset(dataset.id).unwrap().unwrap();
    assert_eq!(
        stored.url.as_deref(),
        Some("https://github.com/alice/cat-census")
    );
    assert_eq!(stored.datapackage_sha.as_deref(), Some("sha-datapackage.json"));
    assert_eq!(stored.files[0].file_sha.as_deref(), Some("sha-data/cats.csv"));
    assert_eq!(stored.files[0].view_sha.as_deref(), Some("sha-data/cats.html"));
}

#[tokio::test]
async fn test_remote_file_is_downloaded_and_published() {
    let h = harness(RecordingHost::default());
    let remote = NewDatasetFile {
        title: "Cats".into(),
        description: None,
        source: FileSource::Url {
            url: REMOTE_CSV.into(),
        },
        schema: None,
    };
    let (dataset, outcome) = h
        .publisher
        .create_dataset(request(PublishingMethod::GithubPublic, vec![remote]), None)
        .await
        .unwrap();
    assert!(outcome.is_persisted());
    let key = dataset.files[0].storage_key.clone().unwrap();
    assert!(key.as_str().ends_with("/cats.csv"));

    h.publisher.run_create_repository(dataset.id).await.unwrap();
    assert!(h.host.pushed_paths().iter().any(|p| p == "data/cats.csv"));
}

#[tokio::test]
async fn test_duplicate_repository_job_reuses_repository() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPublic, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();

    h.publisher.run_create_repository(dataset.id).await.unwrap();
    h.publisher.run_create_repository(dataset.id).await.unwrap();
    assert_eq!(h.host.created(), 1);
}

#[tokio::test]
async fn test_private_repository_gets_no_views() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPrivate, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();

    h.publisher.run_create_repository(dataset.id).await.unwrap();
    let created = h.host.state.lock().unwrap().created[0].clone();
    assert!(created.private);
    assert_eq!(created.homepage, None);
    assert!(!h.host.pushed_paths().iter().any(|p| p == "index.html"));
    assert!(!h.host.branches("alice/cat-census").contains("gh-pages"));
}

// ── Updates ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_never_queues_repository_creation() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPrivate, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(h.queue.len(), 1);

    let changes = DatasetChanges {
        metadata: Some(MetadataUpdate {
            description: Some("More cats".into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let outcome = h
        .publisher
        .run_update_dataset("update-1", dataset.id, changes)
        .await
        .unwrap();

    assert!(outcome.is_persisted());
    assert_eq!(h.queue.len(), 1);
    let stored = h.store.find_dataset(dataset.id).unwrap().unwrap();
    assert_eq!(stored.metadata.description.as_deref(), Some("More cats"));
}

#[tokio::test]
async fn test_invalid_update_records_error_and_keeps_dataset() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::LocalPrivate, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();

    let changes = DatasetChanges {
        new_files: vec![upload("Dogs", BAD)],
        ..Default::default()
    };
    let outcome = h
        .publisher
        .run_update_dataset("update-1", dataset.id, changes)
        .await
        .unwrap();

    assert!(!outcome.is_persisted());
    assert!(h.store.find_error("update-1").unwrap().is_some());
    let stored = h.store.find_dataset(dataset.id).unwrap().unwrap();
    assert_eq!(stored.files.len(), 1);
}

#[tokio::test]
async fn test_becoming_public_opens_repository_and_publishes_views() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPrivate, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();
    h.publisher.run_create_repository(dataset.id).await.unwrap();
    assert_eq!(h.host.made_public(), 0);

    let changes = DatasetChanges {
        metadata: Some(MetadataUpdate {
            publishing_method: Some(PublishingMethod::GithubPublic),
            ..Default::default()
        }),
        ..Default::default()
    };
    h.publisher
        .run_update_dataset("update-1", dataset.id, changes)
        .await
        .unwrap();

    assert_eq!(h.host.made_public(), 1);
    assert!(h.host.pushed_paths().iter().any(|p| p == "index.html"));
    let stored = h.store.find_dataset(dataset.id).unwrap().unwrap();
    assert_eq!(stored.publishing_method(), PublishingMethod::GithubPublic);
}

fn describe(text: &str) -> DatasetChanges {
    DatasetChanges {
        metadata: Some(MetadataUpdate {
            description: Some(text.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_local_update_never_calls_host() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::LocalPrivate, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();

    let changes = DatasetChanges {
        new_files: vec![upload("Dogs", GOOD)],
        ..describe("More cats")
    };
    let outcome = h
        .publisher
        .run_update_dataset("update-1", dataset.id, changes)
        .await
        .unwrap();

    assert!(outcome.is_persisted());
    assert_eq!(h.host.calls(), 0);
    let stored = h.store.find_dataset(dataset.id).unwrap().unwrap();
    assert_eq!(stored.files.len(), 2);
}

#[tokio::test]
async fn test_private_update_pushes_nothing() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPrivate, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();
    h.publisher.run_create_repository(dataset.id).await.unwrap();
    let pushes = h.host.pushes();

    let outcome = h
        .publisher
        .run_update_dataset("update-1", dataset.id, describe("More cats"))
        .await
        .unwrap();

    assert!(outcome.is_persisted());
    assert_eq!(h.host.pushes(), pushes);
    assert_eq!(h.host.made_public(), 0);
}

#[tokio::test]
async fn test_views_are_not_republished_once_public() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPrivate, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();
    h.publisher.run_create_repository(dataset.id).await.unwrap();

    let changes = DatasetChanges {
        metadata: Some(MetadataUpdate {
            publishing_method: Some(PublishingMethod::GithubPublic),
            ..Default::default()
        }),
        ..Default::default()
    };
    h.publisher
        .run_update_dataset("update-1", dataset.id, changes)
        .await
        .unwrap();
    let index_pushes = |h: &Harness| {
        h.host
            .pushed_paths()
            .iter()
            .filter(|p| *p == "index.html")
            .count()
    };
    assert_eq!(index_pushes(&h), 1);

    h.publisher
        .run_update_dataset("update-2", dataset.id, describe("More cats"))
        .await
        .unwrap();

    assert_eq!(index_pushes(&h), 1);
    assert_eq!(h.host.made_public(), 1);
    let metadata_pushes = h
        .host
        .pushed_paths()
        .iter()
        .filter(|p| *p == "datapackage.json")
        .count();
    assert_eq!(metadata_pushes, 3);
}

#[tokio::test]
async fn test_update_of_missing_file_is_rejected() {
    let h = harness(RecordingHost::default());
    let (dataset, _) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::LocalPrivate, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();

    let err = h
        .publisher
        .update_dataset_file(dataset.id, uuid::Uuid::new_v4(), Default::default())
        .unwrap_err();
    assert!(matches!(err, PublishError::FileNotFound { .. }));
}

// ── Destroy ─────────────────────────────────────────────────────────────────

async fn persisted_public(h: &Harness) -> uuid::Uuid {
    let (dataset, outcome) = h
        .publisher
        .create_dataset(
            request(PublishingMethod::GithubPublic, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();
    assert!(outcome.is_persisted());
    dataset.id
}

#[tokio::test]
async fn test_destroy_deletes_repository_then_dataset() {
    let h = harness(RecordingHost::default());
    let id = persisted_public(&h).await;
    h.publisher.destroy_dataset(id).await.unwrap();
    assert_eq!(
        h.host.state.lock().unwrap().deleted,
        vec!["alice/cat-census".to_string()]
    );
    assert!(h.store.find_dataset(id).unwrap().is_none());
}

#[tokio::test]
async fn test_destroy_tolerates_missing_repository() {
    let h = harness(RecordingHost::deleting(DeleteBehaviour::NotFound));
    let id = persisted_public(&h).await;
    h.publisher.destroy_dataset(id).await.unwrap();
    assert!(h.store.find_dataset(id).unwrap().is_none());
}

#[tokio::test]
async fn test_destroy_propagates_other_host_errors() {
    let h = harness(RecordingHost::deleting(DeleteBehaviour::Fail));
    let id = persisted_public(&h).await;
    let err = h.publisher.destroy_dataset(id).await.unwrap_err();
    assert!(matches!(
        err,
        PublishError::Repository(RepoError::Api { status: 500, .. })
    ));
    assert!(h.store.find_dataset(id).unwrap().is_some());
}

// ── Background jobs ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_queued_creation_is_pollable() {
    let registry = Arc::new(JobRegistry::default());
    let (queue, rx) = ChannelJobQueue::new(registry.clone());
    let publisher = Arc::new(
        Publisher::new(Collaborators {
            storage: Arc::new(MemoryStorage::new()),
            fetcher: Arc::new(fetcher()),
            schemas: Arc::new(InMemorySchemaLoader::new()),
            host: Arc::new(RecordingHost::default()),
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(queue),
            registry: registry.clone(),
            notifier: Notifier::new(Arc::new(RecordingLive::default())),
        })
        .unwrap(),
    );
    let handler: Arc<dyn JobHandler> = publisher.clone();
    let mut worker = JobWorker::new(rx, handler, registry);

    let job_id = publisher
        .submit_create_dataset(request(
            PublishingMethod::GithubPublic,
            vec![upload("Cats", BAD)],
        ))
        .unwrap();
    assert_eq!(
        publisher.job_status(&job_id).unwrap().status,
        Some(JobStatus::Pending)
    );

    assert_eq!(worker.drain().await, 1);
    let report = publisher.job_status(&job_id).unwrap();
    assert_eq!(report.status, Some(JobStatus::Completed));
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("Your file 'Cats'"));
}

#[tokio::test]
async fn test_valid_queued_creation_builds_repository() {
    let registry = Arc::new(JobRegistry::default());
    let (queue, rx) = ChannelJobQueue::new(registry.clone());
    let host = Arc::new(RecordingHost::default());
    let publisher = Arc::new(
        Publisher::new(Collaborators {
            storage: Arc::new(MemoryStorage::new()),
            fetcher: Arc::new(fetcher()),
            schemas: Arc::new(InMemorySchemaLoader::new()),
            host: host.clone(),
            store: Arc::new(MemoryStore::new()),
            queue: Arc::new(queue),
            registry: registry.clone(),
            notifier: Notifier::new(Arc::new(RecordingLive::default())),
        })
        .unwrap(),
    );
    let mut worker = JobWorker::new(rx, publisher.clone(), registry);

    let job_id = publisher
        .submit_create_dataset(request(
            PublishingMethod::GithubPublic,
            vec![upload("Cats", GOOD)],
        ))
        .unwrap();

    assert_eq!(worker.drain().await, 2);
    assert_eq!(
        publisher.job_status(&job_id).unwrap().status,
        Some(JobStatus::Completed)
    );
    assert_eq!(host.created(), 1);
}

#[tokio::test]
async fn test_busy_registry_still_builds_repository() {
    let registry = Arc::new(JobRegistry::default());
    for i in 0..500 {
        registry.register(&format!("earlier-{i}"), "create_dataset");
    }
    let (queue, rx) = ChannelJobQueue::new(registry.clone());
    let host = Arc::new(RecordingHost::default());
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(
        Publisher::new(Collaborators {
            storage: Arc::new(MemoryStorage::new()),
            fetcher: Arc::new(fetcher()),
            schemas: Arc::new(InMemorySchemaLoader::new()),
            host: host.clone(),
            store: store.clone(),
            queue: Arc::new(queue),
            registry: registry.clone(),
            notifier: Notifier::new(Arc::new(RecordingLive::default())),
        })
        .unwrap(),
    );
    let mut worker = JobWorker::new(rx, publisher.clone(), registry);

    let (dataset, outcome) = publisher
        .create_dataset(
            request(PublishingMethod::GithubPublic, vec![upload("Cats", GOOD)]),
            None,
        )
        .await
        .unwrap();
    let ReportOutcome::Persisted {
        repository_job: Some(job_id),
    } = outcome
    else {
        panic!("expected a queued repository job");
    };

    assert_eq!(worker.drain().await, 1);
    assert_eq!(
        publisher.job_status(&job_id).unwrap().status,
        Some(JobStatus::Completed)
    );
    assert_eq!(host.created(), 1);
    let stored = store.find_dataset(dataset.id).unwrap().unwrap();
    assert!(stored.url.is_some());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let h = harness(RecordingHost::default());
    let err = h.publisher.job_status("nope").unwrap_err();
    assert!(matches!(err, PublishError::Job(JobError::NotFound { .. })));
}
