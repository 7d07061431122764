//! Record storage.
//!
//! Every record stream owns one table. The table's columns follow a declared list of
//! [`Field`]s; [`SqliteStorage::migrate`] converges an existing table onto that list and
//! [`SqliteStorage::write`] queues typed rows for a single background writer.

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

mod sqlite;

pub use sqlite::{Migration, SqliteStorage, CURSOR_COLUMN};

/// Logical type of a declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Int,
    Float,
    /// Timestamp, stored as milliseconds since the Unix epoch.
    Time,
    /// Unrecognised type name; stored as text.
    Other(String),
}

impl FieldType {
    /// Physical SQLite column type for this logical type.
    pub fn column_type(&self) -> &'static str {
        match self {
            FieldType::String => "TEXT",
            FieldType::Int | FieldType::Time => "INTEGER",
            FieldType::Float => "REAL",
            FieldType::Other(_) => "TEXT",
        }
    }
}

impl From<String> for FieldType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "string" => FieldType::String,
            "int" | "integer" => FieldType::Int,
            "float" => FieldType::Float,
            "time" => FieldType::Time,
            _ => FieldType::Other(value),
        }
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => f.write_str("string"),
            FieldType::Int => f.write_str("int"),
            FieldType::Float => f.write_str("float"),
            FieldType::Time => f.write_str("time"),
            FieldType::Other(name) => f.write_str(name),
        }
    }
}

/// A declared field of a record stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: FieldType,
    /// chrono format string used to parse `time` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_format: Option<String>,
}

fn default_field_type() -> FieldType {
    FieldType::String
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            time_format: None,
        }
    }

    pub fn with_time_format(mut self, format: impl Into<String>) -> Self {
        self.time_format = Some(format.into());
        self
    }
}

/// A typed value bound into an insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            FieldValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// Column name to value, ready for insertion.
pub type Row = BTreeMap<String, FieldValue>;

/// Read-side selection over a stream's table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Query {
    /// Only rows whose cursor is strictly greater than this value.
    #[serde(default)]
    pub after_cursor: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Storage connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    pub path: String,
    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,
    #[serde(default = "default_synchronous")]
    pub synchronous: String,
    #[serde(default = "default_cache_size")]
    pub cache_size: i64,
}

const DEFAULT_JOURNAL_MODE: &str = "wal";
const DEFAULT_SYNCHRONOUS: &str = "normal";
const DEFAULT_CACHE_SIZE: i64 = 10_000;

fn default_journal_mode() -> String {
    DEFAULT_JOURNAL_MODE.to_string()
}

fn default_synchronous() -> String {
    DEFAULT_SYNCHRONOUS.to_string()
}

fn default_cache_size() -> i64 {
    DEFAULT_CACHE_SIZE
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            journal_mode: default_journal_mode(),
            synchronous: default_synchronous(),
            cache_size: default_cache_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_types_map_to_column_types() {
        assert_eq!(FieldType::from("string".to_string()).column_type(), "TEXT");
        assert_eq!(FieldType::from("int".to_string()).column_type(), "INTEGER");
        assert_eq!(FieldType::from("integer".to_string()).column_type(), "INTEGER");
        assert_eq!(FieldType::from("time".to_string()).column_type(), "INTEGER");
        assert_eq!(FieldType::from("float".to_string()).column_type(), "REAL");
        assert_eq!(FieldType::from("json".to_string()).column_type(), "TEXT");
        assert_eq!(
            FieldType::from("json".to_string()),
            FieldType::Other("json".to_string())
        );
    }

    #[test]
    fn field_type_round_trips_through_display() {
        assert_eq!(String::from(FieldType::Time), "time");
        assert_eq!(String::from(FieldType::Other("uuid".into())), "uuid");
    }

    #[test]
    fn storage_config_defaults() {
        let config: StorageConfig = toml::from_str(r#"path = "/tmp/logs.db""#).unwrap();
        assert_eq!(config, StorageConfig::new("/tmp/logs.db"));
        assert_eq!(config.journal_mode, "wal");
        assert_eq!(config.synchronous, "normal");
        assert_eq!(config.cache_size, 10_000);
    }
}
