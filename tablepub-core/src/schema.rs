//! Table schemas attached to dataset files.
//!
//! Two document formats are understood:
//!
//! - a single-table schema (`{"fields": [...]}`) describing one implicit table;
//! - a table-group schema (`{"tables": [{"url": ..., "tableSchema": ...}]}`)
//!   whose table definitions are indexed by each table's source URL.
//!
//! Both are normalised into [`TableDefinition`]s so the validator can treat
//! them the same once the right table has been looked up.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SchemaError;

/// A registered table schema that dataset files can reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Where the schema document is fetched from at validation time.
    pub url: String,
    /// Whether the schema document itself is well formed.
    pub valid: bool,
    /// Whether the document is a table-group schema rather than a single table.
    pub table_group: bool,
}

impl TableSchema {
    /// Build a schema reference with already-known flags.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        valid: bool,
        table_group: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            url: url.into(),
            valid,
            table_group,
        }
    }

    /// Register a schema by fetching its document and inspecting it.
    ///
    /// Fetch failures propagate. A document that fetches but does not parse
    /// is registered with `valid = false` so the files using it fail
    /// validation with a schema error.
    pub async fn register(
        name: impl Into<String>,
        description: Option<String>,
        url: impl Into<String>,
        loader: &dyn SchemaLoader,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        let url = url.into();
        let raw = loader.fetch(&url).await?;
        let (valid, table_group) = match SchemaDocument::parse(&raw, &url) {
            Ok(doc) => (true, doc.is_table_group()),
            Err(e) => {
                info!(schema = %name, error = %e, "Registered schema is not valid");
                (false, looks_like_table_group(&raw))
            }
        };
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            description,
            url,
            valid,
            table_group,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_table_group(&self) -> bool {
        self.table_group
    }
}

fn looks_like_table_group(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(|v| v.get("tables").is_some() || v.get("tableSchema").is_some())
        .unwrap_or(false)
}

/// A parsed schema document.
#[derive(Debug, Clone)]
pub enum SchemaDocument {
    /// One implicit table.
    Table(TableDefinition),
    /// Tables keyed by their source URL.
    TableGroup(TableIndex),
}

impl SchemaDocument {
    /// Parse a schema document fetched from `base_url`.
    pub fn parse(raw: &str, base_url: &str) -> Result<Self, SchemaError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| SchemaError::Parse {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;
        let malformed = |message: String| SchemaError::Malformed {
            url: base_url.to_string(),
            message,
        };

        if value.get("tables").is_some() {
            let group: RawTableGroup =
                serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
            if group.tables.is_empty() {
                return Err(malformed("table group declares no tables".into()));
            }
            let mut index = TableIndex::default();
            for table in group.tables {
                let key = resolve_table_url(base_url, &table.url);
                let definition = table.table_schema.into_definition().map_err(malformed)?;
                index.insert(key, definition);
            }
            Ok(SchemaDocument::TableGroup(index))
        } else if value.get("tableSchema").is_some() {
            let table: RawCsvwTable =
                serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
            let key = resolve_table_url(base_url, &table.url);
            let mut index = TableIndex::default();
            index.insert(key, table.table_schema.into_definition().map_err(malformed)?);
            Ok(SchemaDocument::TableGroup(index))
        } else if value.get("fields").is_some() {
            let schema: RawTableSchema =
                serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
            Ok(SchemaDocument::Table(schema.into_definition().map_err(malformed)?))
        } else {
            Err(malformed(
                "expected a \"fields\", \"tables\" or \"tableSchema\" member".into(),
            ))
        }
    }

    pub fn is_table_group(&self) -> bool {
        matches!(self, SchemaDocument::TableGroup(_))
    }
}

/// Resolve a table's `url` against the schema's own location.
fn resolve_table_url(base_url: &str, table_url: &str) -> String {
    match url::Url::parse(base_url).and_then(|base| base.join(table_url)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => table_url.to_string(),
    }
}

/// Table definitions keyed by source URL, in document order.
#[derive(Debug, Clone, Default)]
pub struct TableIndex {
    entries: Vec<(String, TableDefinition)>,
}

impl TableIndex {
    pub fn insert(&mut self, key: impl Into<String>, table: TableDefinition) {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, table));
    }

    pub fn get(&self, key: &str) -> Option<&TableDefinition> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, t)| t)
    }

    pub fn remove(&mut self, key: &str) -> Option<TableDefinition> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn first_key(&self) -> Option<&str> {
        self.entries.first().map(|(k, _)| k.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move the first declared table under `key`.
    ///
    /// Returns `false` when the index is empty.
    pub fn rebind_first(&mut self, key: impl Into<String>) -> bool {
        let Some(first) = self.first_key().map(str::to_string) else {
            return false;
        };
        match self.remove(&first) {
            Some(table) => {
                let key = key.into();
                debug!(from = %first, to = %key, "Rebinding table definition");
                self.insert(key, table);
                true
            }
            None => false,
        }
    }
}

/// The columns expected in one table.
#[derive(Debug, Clone, Default)]
pub struct TableDefinition {
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    /// Columns that correspond to physical cells (virtual columns excluded).
    pub fn physical_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(|c| !c.is_virtual)
    }
}

/// One expected column.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub name: String,
    /// The header text expected in the file.
    pub title: String,
    pub datatype: Datatype,
    pub constraints: Constraints,
    pub is_virtual: bool,
}

/// Cell datatypes recognised by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    DateTime,
    Any,
}

impl Datatype {
    fn from_name(name: &str) -> Option<Self> {
        let dt = match name {
            "string" | "normalizedString" | "token" => Datatype::String,
            "integer" | "int" | "long" | "short" | "byte" | "nonNegativeInteger"
            | "positiveInteger" => Datatype::Integer,
            "number" | "decimal" | "double" | "float" => Datatype::Number,
            "boolean" => Datatype::Boolean,
            "date" => Datatype::Date,
            "datetime" | "dateTime" => Datatype::DateTime,
            "any" | "anyAtomicType" => Datatype::Any,
            _ => return None,
        };
        Some(dt)
    }
}

/// Per-column constraints.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub required: bool,
    pub unique: bool,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<Regex>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub allowed: Option<Vec<String>>,
}

// ── Raw document shapes ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawTableSchema {
    fields: Vec<RawField>,
}

impl RawTableSchema {
    fn into_definition(self) -> Result<TableDefinition, String> {
        if self.fields.is_empty() {
            return Err("schema declares no fields".into());
        }
        let columns = self
            .fields
            .into_iter()
            .map(RawField::into_column)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TableDefinition { columns })
    }
}

#[derive(Deserialize)]
struct RawField {
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    constraints: RawConstraints,
}

impl RawField {
    fn into_column(self) -> Result<ColumnDefinition, String> {
        let datatype = match self.kind.as_deref() {
            None => Datatype::String,
            Some(kind) => Datatype::from_name(kind)
                .ok_or_else(|| format!("field '{}' has unknown type '{kind}'", self.name))?,
        };
        let c = self.constraints;
        let constraints = Constraints {
            required: c.required,
            unique: c.unique,
            min_length: c.min_length,
            max_length: c.max_length,
            pattern: compile_pattern(c.pattern.as_deref())?,
            minimum: numeric_bound(c.minimum.as_ref())?,
            maximum: numeric_bound(c.maximum.as_ref())?,
            allowed: c.allowed.map(|values| values.iter().map(value_text).collect()),
        };
        Ok(ColumnDefinition {
            title: self.name.clone(),
            name: self.name,
            datatype,
            constraints,
            is_virtual: false,
        })
    }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConstraints {
    #[serde(default)]
    required: bool,
    #[serde(default)]
    unique: bool,
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<String>,
    minimum: Option<serde_json::Value>,
    maximum: Option<serde_json::Value>,
    #[serde(rename = "enum")]
    allowed: Option<Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct RawTableGroup {
    tables: Vec<RawCsvwTable>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCsvwTable {
    url: String,
    table_schema: RawCsvwSchema,
}

#[derive(Deserialize)]
struct RawCsvwSchema {
    columns: Vec<RawColumn>,
}

impl RawCsvwSchema {
    fn into_definition(self) -> Result<TableDefinition, String> {
        if self.columns.is_empty() {
            return Err("table schema declares no columns".into());
        }
        let columns = self
            .columns
            .into_iter()
            .enumerate()
            .map(|(i, c)| c.into_column(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TableDefinition { columns })
    }
}

#[derive(Deserialize)]
struct RawColumn {
    name: Option<String>,
    titles: Option<Titles>,
    datatype: Option<RawDatatype>,
    #[serde(default)]
    required: bool,
    #[serde(rename = "virtual", default)]
    is_virtual: bool,
}

impl RawColumn {
    fn into_column(self, position: usize) -> Result<ColumnDefinition, String> {
        let title = self.titles.as_ref().and_then(Titles::first);
        let name = self
            .name
            .clone()
            .or_else(|| title.clone())
            .unwrap_or_else(|| format!("_col.{}", position + 1));
        let title = title.unwrap_or_else(|| name.clone());

        let mut constraints = Constraints {
            required: self.required,
            ..Default::default()
        };
        let datatype = match self.datatype {
            None => Datatype::String,
            Some(RawDatatype::Name(n)) => Datatype::from_name(&n)
                .ok_or_else(|| format!("column '{name}' has unknown datatype '{n}'"))?,
            Some(RawDatatype::Derived(d)) => {
                let base = d.base.as_deref().unwrap_or("string");
                let datatype = Datatype::from_name(base)
                    .ok_or_else(|| format!("column '{name}' has unknown datatype '{base}'"))?;
                constraints.min_length = d.min_length;
                constraints.max_length = d.max_length;
                constraints.minimum = numeric_bound(d.minimum.as_ref())?;
                constraints.maximum = numeric_bound(d.maximum.as_ref())?;
                if datatype == Datatype::String {
                    constraints.pattern = compile_pattern(d.format.as_deref())?;
                }
                datatype
            }
        };

        Ok(ColumnDefinition {
            name,
            title,
            datatype,
            constraints,
            is_virtual: self.is_virtual,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Titles {
    One(String),
    Many(Vec<String>),
    Localised(HashMap<String, Titles>),
}

impl Titles {
    fn first(&self) -> Option<String> {
        match self {
            Titles::One(t) => Some(t.clone()),
            Titles::Many(ts) => ts.first().cloned(),
            Titles::Localised(map) => map
                .get("und")
                .or_else(|| map.get("en"))
                .or_else(|| map.values().next())
                .and_then(Titles::first),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDatatype {
    Name(String),
    Derived(RawDerivedDatatype),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDerivedDatatype {
    base: Option<String>,
    format: Option<String>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    #[serde(alias = "minInclusive")]
    minimum: Option<serde_json::Value>,
    #[serde(alias = "maxInclusive")]
    maximum: Option<serde_json::Value>,
}

fn compile_pattern(pattern: Option<&str>) -> Result<Option<Regex>, String> {
    pattern
        .map(|p| {
            // Patterns must match the whole cell.
            Regex::new(&format!("^(?:{p})$")).map_err(|e| format!("invalid pattern '{p}': {e}"))
        })
        .transpose()
}

fn numeric_bound(value: Option<&serde_json::Value>) -> Result<Option<f64>, String> {
    match value {
        None => Ok(None),
        Some(serde_json::Value::Number(n)) => Ok(n.as_f64()),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("bound '{s}' is not numeric")),
        Some(other) => Err(format!("bound {other} is not numeric")),
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// Fetches schema documents by URL.
#[async_trait]
pub trait SchemaLoader: Send + Sync {
    /// Fetch the raw schema text.
    async fn fetch(&self, url: &str) -> Result<String, SchemaError>;

    /// Fetch and parse the schema document.
    async fn load(&self, url: &str) -> Result<SchemaDocument, SchemaError> {
        let raw = self.fetch(url).await?;
        SchemaDocument::parse(&raw, url)
    }
}

/// Loads schemas over HTTP(S), or from the filesystem for `file:` URLs and
/// bare paths.
pub struct UrlSchemaLoader {
    client: reqwest::Client,
}

impl UrlSchemaLoader {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for UrlSchemaLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaLoader for UrlSchemaLoader {
    async fn fetch(&self, url: &str) -> Result<String, SchemaError> {
        let fetch_err = |message: String| SchemaError::Fetch {
            url: url.to_string(),
            message,
        };

        if url.starts_with("http://") || url.starts_with("https://") {
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
            resp.text().await.map_err(|e| fetch_err(e.to_string()))
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| fetch_err(e.to_string()))
        }
    }
}

/// Serves schema documents from memory.
#[derive(Debug, Default)]
pub struct InMemorySchemaLoader {
    documents: HashMap<String, String>,
}

impl InMemorySchemaLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, url: impl Into<String>, raw: impl Into<String>) -> Self {
        self.documents.insert(url.into(), raw.into());
        self
    }
}

#[async_trait]
impl SchemaLoader for InMemorySchemaLoader {
    async fn fetch(&self, url: &str) -> Result<String, SchemaError> {
        self.documents
            .get(url)
            .cloned()
            .ok_or_else(|| SchemaError::Fetch {
                url: url.to_string(),
                message: "not found".into(),
            })
    }
}
