//! Well-formedness check for delimited data.

use std::io::{Read, Seek};

use tracing::debug;

use super::RewindGuard;
use crate::error::ValidationError;

/// Check that `stream` holds well-formed comma-separated data.
///
/// The whole stream is read from the start; its position is restored before
/// returning, whatever the outcome.
pub fn validate_content<R: Read + Seek>(stream: &mut R) -> Result<(), ValidationError> {
    let mut guard = RewindGuard::from_start(stream).map_err(|e| ValidationError::ContentRead {
        reason: e.to_string(),
    })?;

    let mut data = Vec::new();
    guard
        .read_to_end(&mut data)
        .map_err(|e| ValidationError::ContentRead {
            reason: e.to_string(),
        })?;

    if std::str::from_utf8(&data).is_err() {
        return Err(ValidationError::ContentRead {
            reason: "content is not valid UTF-8".into(),
        });
    }

    if let Err(offset) = check_quoting(&data) {
        debug!(offset, "Malformed quoting in delimited data");
        return Err(ValidationError::FileFormat);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_reader(data.as_slice());
    for record in reader.byte_records() {
        if let Err(e) = record {
            return match e.kind() {
                csv::ErrorKind::UnequalLengths { .. } => {
                    debug!(error = %e, "Row width mismatch in delimited data");
                    Err(ValidationError::FileFormat)
                }
                _ => Err(ValidationError::ContentRead {
                    reason: e.to_string(),
                }),
            };
        }
    }

    Ok(())
}

#[derive(Clone, Copy)]
enum QuoteState {
    FieldStart,
    Unquoted,
    Quoted,
    QuoteInQuoted,
}

/// Reject unterminated quoted fields and quotes inside unquoted fields.
///
/// Returns the byte offset of the first offending character.
fn check_quoting(data: &[u8]) -> Result<(), usize> {
    let mut state = QuoteState::FieldStart;
    for (offset, &byte) in data.iter().enumerate() {
        let separator = matches!(byte, b',' | b'\n' | b'\r');
        state = match (state, byte) {
            (QuoteState::FieldStart, b'"') => QuoteState::Quoted,
            (QuoteState::FieldStart, _) if separator => QuoteState::FieldStart,
            (QuoteState::FieldStart, _) => QuoteState::Unquoted,
            (QuoteState::Unquoted, b'"') => return Err(offset),
            (QuoteState::Unquoted, _) if separator => QuoteState::FieldStart,
            (QuoteState::Unquoted, _) => QuoteState::Unquoted,
            (QuoteState::Quoted, b'"') => QuoteState::QuoteInQuoted,
            (QuoteState::Quoted, _) => QuoteState::Quoted,
            (QuoteState::QuoteInQuoted, b'"') => QuoteState::Quoted,
            (QuoteState::QuoteInQuoted, _) if separator => QuoteState::FieldStart,
            (QuoteState::QuoteInQuoted, _) => return Err(offset),
        };
    }
    match state {
        QuoteState::Quoted => Err(data.len()),
        _ => Ok(()),
    }
}
