//! Error types for the tablepub core.
//!
//! Uses `thiserror` for public API error types. Validation problems are plain
//! values accumulated on the owning entity; everything else is a collaborator
//! failure that propagates to the caller through [`PublishError`].

use std::path::PathBuf;

use uuid::Uuid;

/// Top-level error type for the tablepub core library.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("View error: {0}")]
    View(#[from] ViewError),

    #[error("Dataset not found: {id}")]
    DatasetNotFound { id: Uuid },

    #[error("File {file_id} not found in dataset {dataset_id}")]
    FileNotFound { dataset_id: Uuid, file_id: Uuid },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A problem found while validating a dataset or one of its files.
///
/// These are never raised; they are collected into
/// [`ValidationErrors`](crate::validation::ValidationErrors) and reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("does not appear to be a valid CSV. Please check your file and try again.")]
    FileFormat,

    #[error("had some problems trying to upload. Please check your file and try again.")]
    ContentRead { reason: String },

    #[error("has a schema that is not valid")]
    SchemaInvalid,

    #[error("does not match the schema you provided")]
    SchemaMismatch { violations: Vec<String> },

    #[error("{field} can't be blank")]
    RequiredFieldMissing { field: &'static str },

    #[error("Repository name {full_name} already exists")]
    RepositoryConflict { full_name: String },
}

impl ValidationError {
    /// Whether this error describes the file's content rather than its metadata.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            ValidationError::FileFormat
                | ValidationError::ContentRead { .. }
                | ValidationError::SchemaInvalid
                | ValidationError::SchemaMismatch { .. }
        )
    }
}

/// Errors from the repository-host collaborator.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Repository not found: {full_name}")]
    NotFound { full_name: String },

    #[error("Repository already exists: {full_name}")]
    AlreadyExists { full_name: String },

    #[error("Repository host returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Repository host request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected repository host response: {message}")]
    Decode { message: String },
}

/// Errors from the raw byte storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("No stored content for key: {key}")]
    Missing { key: String },

    #[error("Storage IO failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to fetch file from {url}: {message}")]
    Fetch { url: String, message: String },
}

/// Errors from loading a table schema document.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Failed to fetch schema from {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Schema at {url} is not valid JSON: {message}")]
    Parse { url: String, message: String },

    #[error("Schema at {url} is malformed: {message}")]
    Malformed { url: String, message: String },
}

/// Errors from the dataset persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Persistence failed at {path}: {message}")]
    Persistence { path: PathBuf, message: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Errors from notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Live channel '{channel}' delivery failed: {message}")]
    Live { channel: String, message: String },

    #[error("Email delivery failed: {message}")]
    Email { message: String },

    #[error("Announcement failed: {message}")]
    Announce { message: String },
}

/// Errors from the background job queue.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Job not found: {id}")]
    NotFound { id: String },
}

/// Errors from rendering public views and generated artifacts.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("Template '{template}' failed to render: {message}")]
    Render { template: String, message: String },

    #[error("Failed to serialize {artifact}: {message}")]
    Serialize { artifact: String, message: String },
}

/// A type alias for results using the top-level `PublishError`.
pub type Result<T> = std::result::Result<T, PublishError>;
