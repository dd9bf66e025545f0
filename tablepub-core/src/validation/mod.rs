//! File and schema validation.
//!
//! Validators never raise: every problem becomes a [`ValidationError`]
//! collected into [`ValidationErrors`] on the entity being validated.

pub mod content;
pub mod schema;

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};

pub use crate::error::ValidationError;
pub use content::validate_content;
pub use schema::{check_table, validate_against_schema};

/// Accumulated validation problems for one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.errors.iter()
    }

    /// Display messages in collection order, without duplicates.
    pub fn messages(&self) -> Vec<String> {
        dedup_messages(self.errors.iter().map(ToString::to_string))
    }
}

impl Extend<ValidationError> for ValidationErrors {
    fn extend<T: IntoIterator<Item = ValidationError>>(&mut self, iter: T) {
        self.errors.extend(iter);
    }
}

impl<'a> IntoIterator for &'a ValidationErrors {
    type Item = &'a ValidationError;
    type IntoIter = std::slice::Iter<'a, ValidationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

/// Drop repeated messages, keeping the first occurrence of each.
pub fn dedup_messages(messages: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    messages
        .into_iter()
        .filter(|m| seen.insert(m.clone()))
        .collect()
}

/// Restores a stream's read position when dropped.
///
/// Validation reads the same stored content that is later read again for
/// upload, so every read goes through one of these.
pub struct RewindGuard<'a, S: Seek> {
    stream: &'a mut S,
    origin: u64,
}

impl<'a, S: Seek> RewindGuard<'a, S> {
    /// Remember the current position and move to the start of the stream.
    pub fn from_start(stream: &'a mut S) -> std::io::Result<Self> {
        let origin = stream.stream_position()?;
        stream.seek(SeekFrom::Start(0))?;
        Ok(Self { stream, origin })
    }

    pub fn stream(&mut self) -> &mut S {
        self.stream
    }
}

impl<S: Seek + Read> Read for RewindGuard<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl<S: Seek> Drop for RewindGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.stream.seek(SeekFrom::Start(self.origin)) {
            tracing::warn!(error = %e, "Failed to restore stream position");
        }
    }
}
