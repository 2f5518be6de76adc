//! Provider schema, configuration and fetch types

use serde::{Deserialize, Serialize};

/// Column types a provider may declare for its resource tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Text,
    Uuid,
    Json,
    Timestamp,
}

impl ColumnType {
    /// SQL type used when the table is created in the store
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Bool => "BOOLEAN",
            Self::Int => "INTEGER",
            Self::Float => "REAL",
            Self::Text | Self::Uuid | Self::Json | Self::Timestamp => "TEXT",
        }
    }
}

/// A single column of a resource table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub description: String,
}

impl Column {
    /// Create a new column
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            description: String::new(),
        }
    }
}

/// A table a provider writes one resource into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTable {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<Column>,
}

impl ResourceTable {
    /// Create a new table descriptor
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            columns,
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Snapshot of a provider's tables, as returned by a schema query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSchema {
    pub name: String,
    pub version: String,
    pub resource_tables: Vec<ResourceTable>,
}

impl ProviderSchema {
    /// Find a table by name
    pub fn table(&self, name: &str) -> Option<&ResourceTable> {
        self.resource_tables.iter().find(|t| t.name == name)
    }
}

/// Rendered sample configuration of a provider
///
/// The engine treats the content as opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfiguration {
    pub config: String,
}

/// Sent to a provider before fetching so it knows where to write and what
/// accounts to read from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureRequest {
    /// Connection descriptor of the shared store, passed through untouched
    pub dsn: String,
    /// Provider specific configuration block
    #[serde(default)]
    pub configuration: serde_json::Value,
}

/// Progress reported while a fetch is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchProgress {
    pub resource: String,
    pub rows_written: u64,
    pub finished: bool,
}

/// Final summary of a completed fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSummary {
    pub resources: Vec<String>,
    pub rows_written: u64,
}
