//! # tablepub core
//!
//! Validates tabular datasets (CSV files, optionally checked against a table
//! schema) and publishes them to a hosted repository. Covers validation,
//! outcome delivery to live and polling clients, repository synchronisation
//! and the background jobs that drive it.

pub mod config;
pub mod dataset;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod notify;
pub mod publish;
pub mod repository;
pub mod schema;
pub mod storage;
pub mod store;
pub mod validation;
pub mod views;

// Re-export commonly used types at the crate root.
pub use config::{load_config, PublishConfig};
pub use dataset::{
    Dataset, DatasetDiff, DatasetFile, DatasetMetadata, FileSource, FileUpdate, NewDatasetFile,
    PublishingMethod, SchemaSpec, User,
};
pub use error::{PublishError, RepoError, Result, ValidationError};
pub use jobs::{ChannelJobQueue, Job, JobQueue, JobRegistry, JobStatus, JobWorker, QueuedJob};
pub use notify::{BroadcastHub, LiveEvent, Notifier};
pub use publish::{
    Collaborators, CreateDatasetRequest, DatasetChanges, JobReport, MetadataUpdate,
    PublishAction, Publisher, ReportOutcome,
};
pub use repository::{GitHubHost, RepoHandle, RepositoryHost};
pub use schema::{SchemaLoader, TableSchema, UrlSchemaLoader};
pub use storage::{FileFetcher, FileStorage, HttpFetcher, LocalStorage, MemoryStorage, StorageKey};
pub use store::{DatasetStore, ErrorRecord, JsonStore, MemoryStore};
