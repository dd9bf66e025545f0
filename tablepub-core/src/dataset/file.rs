//! Data files belonging to a dataset.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{parameterize, Dataset, ValidationContext};
use crate::error::{PublishError, StorageError, ValidationError};
use crate::schema::{SchemaLoader, TableSchema};
use crate::storage::{ContentStream, FileFetcher, FileStorage, StorageKey};
use crate::validation::{self, ValidationErrors};

/// Where a file's bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Raw bytes uploaded with the request.
    Upload { filename: String, bytes: Bytes },
    /// Bytes already placed in storage under `storage_key`.
    Stored { storage_key: StorageKey },
    /// A remote file, downloaded and stored when the file is assembled.
    Url { url: String },
}

/// The schema to attach to a file.
#[derive(Debug, Clone)]
pub enum SchemaSpec {
    /// A schema registered earlier.
    Existing(TableSchema),
    /// Register a new schema from its URL.
    Register {
        name: String,
        description: Option<String>,
        url: String,
    },
}

impl SchemaSpec {
    async fn resolve(self, loader: &dyn SchemaLoader) -> Result<TableSchema, PublishError> {
        match self {
            SchemaSpec::Existing(schema) => Ok(schema),
            SchemaSpec::Register {
                name,
                description,
                url,
            } => Ok(TableSchema::register(name, description, url, loader).await?),
        }
    }
}

/// A file entry supplied when creating a dataset.
#[derive(Debug, Clone)]
pub struct NewDatasetFile {
    pub title: String,
    pub description: Option<String>,
    pub source: FileSource,
    pub schema: Option<SchemaSpec>,
}

/// A partial update to an existing file; `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub description: Option<String>,
    pub source: Option<FileSource>,
    pub schema: Option<SchemaSpec>,
}

/// One data file of a dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetFile {
    pub id: Uuid,
    pub title: String,
    /// Derived from the title once the file has been validated.
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub mediatype: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Checksum of the data file as committed to the repository.
    #[serde(default)]
    pub file_sha: Option<String>,
    /// Checksum of the file's public view page.
    #[serde(default)]
    pub view_sha: Option<String>,
    #[serde(default)]
    pub storage_key: Option<StorageKey>,
    #[serde(default)]
    pub schema: Option<TableSchema>,
    /// Content attached in this session, read again for upload.
    #[serde(skip)]
    content: Option<ContentStream>,
    #[serde(skip)]
    errors: ValidationErrors,
}

impl DatasetFile {
    pub fn new(title: impl Into<String>, storage_key: Option<StorageKey>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            mediatype: Some("text/csv".into()),
            storage_key,
            ..Default::default()
        }
    }

    /// Assemble a file from a create request, storing uploaded or downloaded
    /// bytes first.
    pub async fn new_file(
        input: NewDatasetFile,
        storage: &dyn FileStorage,
        fetcher: &dyn FileFetcher,
        schemas: &dyn SchemaLoader,
    ) -> Result<Self, PublishError> {
        let mut file = DatasetFile::new(input.title, None);
        file.description = input.description;
        file.attach(input.source, storage, fetcher).await?;
        if let Some(spec) = input.schema {
            file.schema = Some(spec.resolve(schemas).await?);
        }
        info!(
            file = %file.title,
            storage_key = ?file.storage_key,
            "Dataset file assembled"
        );
        Ok(file)
    }

    /// Apply a partial update. Returns whether the content was replaced.
    pub async fn update_file(
        &mut self,
        update: FileUpdate,
        storage: &dyn FileStorage,
        fetcher: &dyn FileFetcher,
        schemas: &dyn SchemaLoader,
    ) -> Result<bool, PublishError> {
        if let Some(description) = update.description {
            self.description = Some(description);
        }
        let replaced = match update.source {
            Some(source) => {
                self.attach(source, storage, fetcher).await?;
                true
            }
            None => false,
        };
        if let Some(spec) = update.schema {
            self.schema = Some(spec.resolve(schemas).await?);
        }
        debug!(file = %self.title, replaced, "Dataset file updated");
        Ok(replaced)
    }

    async fn attach(
        &mut self,
        source: FileSource,
        storage: &dyn FileStorage,
        fetcher: &dyn FileFetcher,
    ) -> Result<(), StorageError> {
        let (key, bytes) = match source {
            FileSource::Upload { filename, bytes } => (StorageKey::generate(&filename), bytes),
            FileSource::Url { url } => {
                let bytes = fetcher.fetch(&url).await?;
                debug!(file = %self.title, url = %url, "Downloaded remote file");
                (StorageKey::for_url(&url), bytes)
            }
            FileSource::Stored { storage_key } => {
                self.content = Some(storage.get_stream(&storage_key)?);
                self.storage_key = Some(storage_key);
                return Ok(());
            }
        };
        storage.put(&key, bytes.clone())?;
        self.content = Some(ContentStream::new(bytes));
        self.storage_key = Some(key);
        Ok(())
    }

    /// Read the file's full bytes for upload, preferring attached content.
    pub fn read_bytes(&self, storage: &dyn FileStorage) -> Result<Bytes, StorageError> {
        match (&self.content, &self.storage_key) {
            (Some(stream), _) => Ok(stream.get_ref().clone()),
            (None, Some(key)) => Ok(storage.get_stream(key)?.into_inner()),
            (None, None) => Err(StorageError::Missing {
                key: format!("<no storage key for '{}'>", self.title),
            }),
        }
    }

    pub fn schema_name(&self) -> Option<&str> {
        self.schema.as_ref().map(|s| s.name.as_str())
    }

    /// The filename, or the one the title would produce.
    pub fn effective_filename(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| format!("{}.csv", parameterize(&self.title)))
    }

    pub fn github_url(&self, dataset: &Dataset) -> String {
        format!("{}/data/{}", dataset.github_url(), self.effective_filename())
    }

    pub fn gh_pages_url(&self, dataset: &Dataset) -> String {
        format!("{}/data/{}", dataset.gh_pages_url(), self.effective_filename())
    }

    pub fn errors(&self) -> &ValidationErrors {
        &self.errors
    }

    /// Whether this file differs from an earlier state of itself.
    pub fn differs_from(&self, previous: &DatasetFile) -> bool {
        self.title != previous.title
            || self.description != previous.description
            || self.storage_key != previous.storage_key
            || self.schema.as_ref().map(|s| s.id) != previous.schema.as_ref().map(|s| s.id)
    }

    /// Validate the file's fields, content and schema conformance.
    pub async fn validate(&mut self, ctx: ValidationContext<'_>) -> bool {
        self.errors.clear();

        if let (Some(schema), Some(key)) = (&self.schema, &self.storage_key) {
            debug!(file = %self.title, "Checking schema");
            let schema_errors = validation::validate_against_schema(
                schema,
                ctx.storage,
                key,
                self.content.as_mut(),
                ctx.schemas,
            )
            .await;
            self.errors.extend(schema_errors);
        }

        self.check_content(ctx.storage);

        if self.title.trim().is_empty() {
            self.errors
                .push(ValidationError::RequiredFieldMissing { field: "Title" });
        }
        if self.storage_key.as_ref().is_none_or(StorageKey::is_blank) {
            self.errors
                .push(ValidationError::RequiredFieldMissing { field: "Storage key" });
        }

        if !self.title.trim().is_empty() {
            self.filename = Some(format!("{}.csv", parameterize(&self.title)));
        }

        debug!(file = %self.title, errors = self.errors.len(), "File validated");
        self.errors.is_empty()
    }

    fn check_content(&mut self, storage: &dyn FileStorage) {
        let result = match (&mut self.content, &self.storage_key) {
            (Some(stream), _) => validation::validate_content(stream),
            (None, Some(key)) => match storage.get_stream(key) {
                Ok(mut stream) => validation::validate_content(&mut stream),
                Err(StorageError::Missing { .. }) => {
                    warn!(file = %self.title, "No stored content to check");
                    Ok(())
                }
                Err(e) => Err(ValidationError::ContentRead {
                    reason: e.to_string(),
                }),
            },
            (None, None) => Ok(()),
        };
        if let Err(e) = result {
            self.errors.push(e);
        }
    }

    /// Error messages prefixed with the file's title.
    pub fn error_messages(&self) -> Vec<String> {
        let label = if self.title.trim().is_empty() {
            "Your file".to_string()
        } else {
            format!("Your file '{}'", self.title)
        };
        self.errors
            .iter()
            .map(|e| {
                if e.is_content_error() {
                    format!("{label} {e}")
                } else {
                    format!("{label}: {e}")
                }
            })
            .collect()
    }
}
