//! Raw byte storage for uploaded data files.
//!
//! Files are addressed by an opaque [`StorageKey`]. Reads hand back an
//! in-memory seekable stream so the same content can be validated and later
//! re-read for upload. Files given by URL are downloaded through a
//! [`FileFetcher`] before they are stored.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;

/// A readable, seekable view over stored bytes.
pub type ContentStream = Cursor<Bytes>;

/// Opaque reference to externally stored file bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// Wrap an existing key verbatim.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Allocate a fresh key for an upload with the given original filename.
    pub fn generate(filename: &str) -> Self {
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("upload.csv");
        Self(format!("uploads/{}/{}", Uuid::new_v4(), name))
    }

    /// Allocate a key for a file downloaded from `url`, named after the last
    /// segment of its path.
    pub fn for_url(url: &str) -> Self {
        let name = url::Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .unwrap_or_default();
        Self::generate(&name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage backend for raw file bytes.
///
/// Reads are blocking by contract; callers are responsible for restoring the
/// returned stream's cursor if they hand it on.
pub trait FileStorage: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous content.
    fn put(&self, key: &StorageKey, bytes: Bytes) -> Result<(), StorageError>;

    /// Open the content stored under `key`, positioned at the start.
    fn get_stream(&self, key: &StorageKey) -> Result<ContentStream, StorageError>;

    /// Whether anything is stored under `key`.
    fn exists(&self, key: &StorageKey) -> bool;
}

/// Storage backed by a local directory, one file per key.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Store files under `root`, created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &StorageKey) -> PathBuf {
        // Keys are generated internally, but never let one escape the root.
        let relative: PathBuf = Path::new(key.as_str())
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect();
        self.root.join(relative)
    }
}

impl FileStorage for LocalStorage {
    fn put(&self, key: &StorageKey, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.path_for(key);
        write_atomically(&path, &bytes).map_err(|source| StorageError::Io {
            key: key.to_string(),
            source,
        })
    }

    fn get_stream(&self, key: &StorageKey) -> Result<ContentStream, StorageError> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Cursor::new(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::Missing {
                key: key.to_string(),
            }),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn exists(&self, key: &StorageKey) -> bool {
        self.path_for(key).is_file()
    }
}

/// Storage held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<StorageKey, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileStorage for MemoryStorage {
    fn put(&self, key: &StorageKey, bytes: Bytes) -> Result<(), StorageError> {
        let mut objects = self.objects.write().map_err(|_| StorageError::Io {
            key: key.to_string(),
            source: std::io::Error::other("storage lock poisoned"),
        })?;
        objects.insert(key.clone(), bytes);
        Ok(())
    }

    fn get_stream(&self, key: &StorageKey) -> Result<ContentStream, StorageError> {
        let objects = self.objects.read().map_err(|_| StorageError::Io {
            key: key.to_string(),
            source: std::io::Error::other("storage lock poisoned"),
        })?;
        objects
            .get(key)
            .cloned()
            .map(Cursor::new)
            .ok_or_else(|| StorageError::Missing {
                key: key.to_string(),
            })
    }

    fn exists(&self, key: &StorageKey) -> bool {
        self.objects
            .read()
            .map(|o| o.contains_key(key))
            .unwrap_or(false)
    }
}

/// Downloads the bytes of files given by URL.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, StorageError>;
}

/// Fetches files over HTTP(S). Content is read as UTF-8; invalid sequences
/// are replaced.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, StorageError> {
        let fetch_err = |message: String| StorageError::Fetch {
            url: url.to_string(),
            message,
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP {status}")));
        }
        let body = resp.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
        debug!(url, bytes = body.len(), "Fetched remote file");
        Ok(into_utf8(body))
    }
}

/// Serves remote files from memory.
#[derive(Debug, Default)]
pub struct InMemoryFetcher {
    files: HashMap<String, Bytes>,
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, url: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.files.insert(url.into(), content.into());
        self
    }
}

#[async_trait]
impl FileFetcher for InMemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, StorageError> {
        self.files
            .get(url)
            .cloned()
            .map(into_utf8)
            .ok_or_else(|| StorageError::Fetch {
                url: url.to_string(),
                message: "not found".into(),
            })
    }
}

fn into_utf8(body: Bytes) -> Bytes {
    match String::from_utf8_lossy(&body) {
        std::borrow::Cow::Borrowed(_) => body,
        std::borrow::Cow::Owned(text) => Bytes::from(text),
    }
}

/// Write to a `.tmp` sibling and rename over the target.
///
/// Creates parent directories if they don't exist.
pub(crate) fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
