use super::{ClientError, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Tag names the storage engine reserves for its own columns.
pub const RESERVED_TAG_NAMES: [&str; 2] = ["tsid", "timestamp"];

/// Per-request settings resolved before dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Target database. Empty means "use the client default".
    #[serde(default)]
    pub database: String,
}

impl RequestContext {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }
}

/// A single record addressed to one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub table: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Point {
    pub fn builder(table: impl Into<String>) -> PointBuilder {
        PointBuilder::new(table)
    }

    /// Checks the invariants `PointBuilder::build` enforces.
    ///
    /// Useful for points that were deserialized rather than built.
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(ClientError::InvalidPoint(
                "table must not be empty".to_string(),
            ));
        }
        if self.timestamp <= 0 {
            return Err(ClientError::InvalidPoint(format!(
                "timestamp must be > 0 for table '{}'",
                self.table
            )));
        }
        if self.fields.is_empty() {
            return Err(ClientError::InvalidPoint(format!(
                "point for table '{}' must have at least one field",
                self.table
            )));
        }
        for name in self.tags.keys() {
            if name.trim().is_empty() {
                return Err(ClientError::InvalidPoint(
                    "tag name must not be empty".to_string(),
                ));
            }
            if RESERVED_TAG_NAMES.contains(&name.as_str()) {
                return Err(ClientError::InvalidPoint(format!(
                    "tag name '{}' is reserved",
                    name
                )));
            }
        }
        for (name, value) in &self.fields {
            if name.trim().is_empty() {
                return Err(ClientError::InvalidPoint(
                    "field name must not be empty".to_string(),
                ));
            }
            if value.is_null() {
                return Err(ClientError::InvalidPoint(format!(
                    "field '{}' of table '{}' must not be {}",
                    name,
                    self.table,
                    value.type_name()
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`Point`].
#[derive(Debug, Clone)]
pub struct PointBuilder {
    table: String,
    timestamp: Option<i64>,
    tags: BTreeMap<String, Value>,
    fields: BTreeMap<String, Value>,
}

impl PointBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            timestamp: None,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Sets the point timestamp in milliseconds. Defaults to "now".
    pub fn timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Point> {
        let point = Point {
            table: self.table,
            timestamp: self
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            tags: self.tags,
            fields: self.fields,
        };
        point.validate()?;
        Ok(point)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub req_ctx: RequestContext,
    pub points: Vec<Point>,
}

impl WriteRequest {
    pub fn new(points: Vec<Point>) -> Self {
        Self {
            req_ctx: RequestContext::default(),
            points,
        }
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.req_ctx.database = database.into();
        self
    }
}

/// Outcome of a write, possibly aggregated over several endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: u32,
    pub failed: u32,
    /// First error observed while writing, if any.
    #[serde(default)]
    pub message: Option<String>,
}

impl WriteResponse {
    pub fn succeeded(count: u32) -> Self {
        Self {
            success: count,
            ..Self::default()
        }
    }

    pub fn failed(count: u32, message: impl Into<String>) -> Self {
        Self {
            success: 0,
            failed: count,
            message: Some(message.into()),
        }
    }

    /// Merges `other` into `self`: counts add up, the earlier message is kept.
    pub fn combine(&mut self, other: WriteResponse) {
        self.success = self.success.saturating_add(other.success);
        self.failed = self.failed.saturating_add(other.failed);
        if self.message.is_none() {
            self.message = other.message;
        }
    }

    pub fn total(&self) -> u64 {
        self.success as u64 + self.failed as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlQueryRequest {
    #[serde(default)]
    pub req_ctx: RequestContext,
    pub tables: Vec<String>,
    pub sql: String,
}

impl SqlQueryRequest {
    pub fn new(tables: Vec<String>, sql: impl Into<String>) -> Self {
        Self {
            req_ctx: RequestContext::default(),
            tables,
            sql: sql.into(),
        }
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.req_ctx.database = database.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<Column>,
}

impl Row {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| &column.value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlQueryResponse {
    pub sql: String,
    pub affected_rows: u32,
    #[serde(default)]
    pub rows: Vec<Row>,
}

/// Binding of a table to the endpoint currently serving it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub table: String,
    pub endpoint: String,
}

impl Route {
    pub fn new(table: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Routes keyed by table name. May miss entries for unroutable tables.
pub type RouteMap = HashMap<String, Route>;
