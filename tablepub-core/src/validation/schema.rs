//! Conformance of file content to an attached table schema.

use std::collections::HashSet;
use std::io::{Read, Seek};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::{debug, info, warn};

use super::RewindGuard;
use crate::error::ValidationError;
use crate::schema::{
    ColumnDefinition, Datatype, SchemaDocument, SchemaLoader, TableDefinition, TableIndex,
    TableSchema,
};
use crate::storage::{ContentStream, FileStorage, StorageKey};

/// Stop collecting violations once this many have been found.
const MAX_VIOLATIONS: usize = 50;

/// Validate a file's content against its attached schema.
///
/// `upload` is the file's attached content, if any; table-group schemas
/// validate a local copy of it, single-table schemas re-read the stored bytes.
/// Always returns the accumulated errors; nothing is raised.
pub async fn validate_against_schema(
    schema: &TableSchema,
    storage: &dyn FileStorage,
    storage_key: &StorageKey,
    upload: Option<&mut ContentStream>,
    loader: &dyn SchemaLoader,
) -> Vec<ValidationError> {
    if !schema.is_valid() {
        return vec![ValidationError::SchemaInvalid];
    }

    let document = match loader.load(&schema.url).await {
        Ok(doc) => doc,
        Err(e) => {
            warn!(schema = %schema.name, error = %e, "Could not load schema document");
            return vec![ValidationError::SchemaInvalid];
        }
    };

    let outcome = if schema.is_table_group() {
        info!(schema = %schema.name, "Validating against table-group schema");
        validate_table_group(document, storage, storage_key, upload)
    } else {
        info!(schema = %schema.name, "Validating against single-table schema");
        validate_single_table(document, storage, storage_key)
    };

    match outcome {
        Ok(violations) if violations.is_empty() => Vec::new(),
        Ok(violations) => {
            debug!(count = violations.len(), "Schema violations found");
            vec![ValidationError::SchemaMismatch { violations }]
        }
        Err(e) => vec![e],
    }
}

fn validate_single_table(
    document: SchemaDocument,
    storage: &dyn FileStorage,
    storage_key: &StorageKey,
) -> Result<Vec<String>, ValidationError> {
    let table = match document {
        SchemaDocument::Table(table) => table,
        SchemaDocument::TableGroup(mut index) => {
            let first = index.first_key().map(str::to_string);
            first
                .and_then(|key| index.remove(&key))
                .ok_or(ValidationError::SchemaInvalid)?
        }
    };
    let stream = storage
        .get_stream(storage_key)
        .map_err(|e| ValidationError::ContentRead {
            reason: e.to_string(),
        })?;
    Ok(check_table(stream, &table))
}

fn validate_table_group(
    document: SchemaDocument,
    storage: &dyn FileStorage,
    storage_key: &StorageKey,
    upload: Option<&mut ContentStream>,
) -> Result<Vec<String>, ValidationError> {
    let read_err = |e: std::io::Error| ValidationError::ContentRead {
        reason: e.to_string(),
    };

    let mut index = match document {
        SchemaDocument::TableGroup(index) => index,
        SchemaDocument::Table(table) => {
            let mut index = TableIndex::default();
            index.insert("", table);
            index
        }
    };

    let mut local = tempfile::Builder::new()
        .prefix("tablepub-")
        .suffix(".csv")
        .tempfile()
        .map_err(read_err)?;
    let copied = match upload {
        Some(stream) => copy_from_start(stream, local.as_file_mut()).map_err(read_err)?,
        None => {
            let mut stream = storage
                .get_stream(storage_key)
                .map_err(|e| ValidationError::ContentRead {
                    reason: e.to_string(),
                })?;
            copy_from_start(&mut stream, local.as_file_mut()).map_err(read_err)?
        }
    };
    debug!(bytes = copied, path = %local.path().display(), "Copied file for validation");

    // The schema indexes tables by their original source URL; only this one
    // local file is present, so its definition is rebound to the local path.
    let local_key = format!("file:{}", local.path().display());
    if !index.rebind_first(local_key.clone()) {
        return Err(ValidationError::SchemaInvalid);
    }
    let table = index.get(&local_key).ok_or(ValidationError::SchemaInvalid)?;

    let file = std::fs::File::open(local.path()).map_err(read_err)?;
    Ok(check_table(file, table))
}

fn copy_from_start<R: Read + Seek>(
    stream: &mut R,
    out: &mut std::fs::File,
) -> std::io::Result<u64> {
    let mut guard = RewindGuard::from_start(stream)?;
    let copied = std::io::copy(&mut guard, out)?;
    std::io::Write::flush(out)?;
    Ok(copied)
}

/// Check delimited content against a table definition.
///
/// Returns human-readable violations; an empty list means the content conforms.
pub fn check_table<R: Read>(reader: R, table: &TableDefinition) -> Vec<String> {
    let columns: Vec<&ColumnDefinition> = table.physical_columns().collect();
    let mut violations = Vec::new();

    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    match csv.headers() {
        Ok(headers) => {
            for (i, column) in columns.iter().enumerate() {
                match headers.get(i) {
                    None => violations.push(format!("missing column '{}'", column.title)),
                    Some(h) if h.trim() != column.title => violations.push(format!(
                        "header '{}' in column {} does not match '{}'",
                        h.trim(),
                        i + 1,
                        column.title
                    )),
                    Some(_) => {}
                }
            }
            for extra in headers.iter().skip(columns.len()) {
                violations.push(format!("unexpected column '{}'", extra.trim()));
            }
        }
        Err(e) => {
            violations.push(format!("header could not be read: {e}"));
            return violations;
        }
    }
    if !violations.is_empty() {
        return violations;
    }

    let mut seen: Vec<HashSet<String>> = vec![HashSet::new(); columns.len()];
    for (i, record) in csv.records().enumerate() {
        let row = i + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                violations.push(format!("row {row} could not be read: {e}"));
                break;
            }
        };
        if record.len() != columns.len() {
            violations.push(format!(
                "row {row} has {} cells, expected {}",
                record.len(),
                columns.len()
            ));
        }
        for (col, column) in columns.iter().enumerate() {
            let cell = record.get(col).unwrap_or("");
            if let Some(problem) = check_cell(cell, column) {
                violations.push(format!("row {row}, column '{}': {problem}", column.name));
            } else if column.constraints.unique
                && !cell.is_empty()
                && !seen[col].insert(cell.to_string())
            {
                violations.push(format!(
                    "row {row}, column '{}': duplicate value '{cell}'",
                    column.name
                ));
            }
        }
        if violations.len() >= MAX_VIOLATIONS {
            break;
        }
    }

    violations.truncate(MAX_VIOLATIONS);
    violations
}

fn check_cell(cell: &str, column: &ColumnDefinition) -> Option<String> {
    let c = &column.constraints;
    if cell.is_empty() {
        return c.required.then(|| "value is required".to_string());
    }

    let numeric = match column.datatype {
        Datatype::String | Datatype::Any => None,
        Datatype::Integer => match cell.trim().parse::<i64>() {
            Ok(v) => Some(v as f64),
            Err(_) => return Some(format!("'{cell}' is not an integer")),
        },
        Datatype::Number => match cell.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => return Some(format!("'{cell}' is not a number")),
        },
        Datatype::Boolean => {
            if !matches!(
                cell.trim().to_ascii_lowercase().as_str(),
                "true" | "false" | "1" | "0"
            ) {
                return Some(format!("'{cell}' is not a boolean"));
            }
            None
        }
        Datatype::Date => {
            if NaiveDate::parse_from_str(cell.trim(), "%Y-%m-%d").is_err() {
                return Some(format!("'{cell}' is not a date"));
            }
            None
        }
        Datatype::DateTime => {
            let t = cell.trim();
            if DateTime::parse_from_rfc3339(t).is_err()
                && NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S").is_err()
            {
                return Some(format!("'{cell}' is not a date-time"));
            }
            None
        }
    };

    let length = cell.chars().count();
    if let Some(min) = c.min_length.filter(|min| length < *min) {
        return Some(format!("'{cell}' is shorter than {min} characters"));
    }
    if let Some(max) = c.max_length.filter(|max| length > *max) {
        return Some(format!("'{cell}' is longer than {max} characters"));
    }
    if let Some(pattern) = c.pattern.as_ref().filter(|p| !p.is_match(cell)) {
        return Some(format!("'{cell}' does not match pattern {}", pattern.as_str()));
    }
    if let Some(value) = numeric {
        if let Some(min) = c.minimum.filter(|min| value < *min) {
            return Some(format!("{value} is below the minimum {min}"));
        }
        if let Some(max) = c.maximum.filter(|max| value > *max) {
            return Some(format!("{value} is above the maximum {max}"));
        }
    }
    if let Some(allowed) = c.allowed.as_ref().filter(|a| !a.iter().any(|v| v == cell)) {
        return Some(format!("'{cell}' is not one of {}", allowed.join(", ")));
    }
    None
}
