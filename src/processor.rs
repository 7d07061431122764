//! Converts raw records into typed rows and hands them to storage.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::metrics::RECORDS_ENQUEUED_TOTAL;
use crate::storage::{Field, FieldType, FieldValue, Row, SqliteStorage};
use crate::Record;

/// Downstream of a tailer: serializes records and forwards the result.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Turn a parsed record into a storable row. `None` suppresses the write.
    fn serialize(&self, record: Record) -> Option<Row>;

    /// Hand a serialized row off for persistence.
    async fn write(&self, row: Row);
}

/// Timestamp layouts tried, in order, for `time` fields without an explicit format.
const FALLBACK_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d/%b/%Y:%H:%M:%S",
    "%d/%b/%Y %H:%M:%S",
];

/// Types record fields according to a stream's field list and writes rows to one table.
pub struct StorageProcessor {
    table: String,
    fields: Vec<Field>,
    storage: Arc<SqliteStorage>,
}

impl StorageProcessor {
    pub fn new(table: impl Into<String>, fields: Vec<Field>, storage: Arc<SqliteStorage>) -> Self {
        Self {
            table: table.into(),
            fields,
            storage,
        }
    }
}

#[async_trait]
impl Processor for StorageProcessor {
    fn serialize(&self, record: Record) -> Option<Row> {
        serialize_record(&self.fields, record)
    }

    async fn write(&self, row: Row) {
        match self.storage.write(&self.table, row).await {
            Ok(()) => RECORDS_ENQUEUED_TOTAL.inc(),
            Err(err) => warn!(table = %self.table, error = %err, "failed to queue record"),
        }
    }
}

/// Keep the declared fields of `record`, converted to their logical types.
///
/// Values that fail to convert are left out of the row; a record with no usable field yields
/// `None`.
pub fn serialize_record(fields: &[Field], mut record: Record) -> Option<Row> {
    let mut row = Row::new();
    for field in fields {
        let Some(raw) = record.remove(&field.name) else {
            continue;
        };
        match convert_value(field, &raw) {
            Some(value) => {
                row.insert(field.name.clone(), value);
            }
            None => debug!(
                field = %field.name,
                field_type = %field.field_type,
                value = %raw,
                "value does not fit field type; skipping"
            ),
        }
    }

    if row.is_empty() {
        None
    } else {
        Some(row)
    }
}

fn convert_value(field: &Field, raw: &str) -> Option<FieldValue> {
    match &field.field_type {
        FieldType::String | FieldType::Other(_) => Some(FieldValue::Text(raw.to_string())),
        FieldType::Int => raw.trim().parse::<i64>().ok().map(FieldValue::Integer),
        FieldType::Float => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(FieldValue::Real),
        FieldType::Time => {
            parse_time_millis(raw.trim(), field.time_format.as_deref()).map(FieldValue::Integer)
        }
    }
}

/// Parse a timestamp into milliseconds since the Unix epoch.
///
/// With a format, the value is tried as a zoned datetime, then as a naive (UTC) datetime, then
/// as a date. Without one, RFC 3339 and [`FALLBACK_TIME_FORMATS`] are tried, and finally a raw
/// integer is taken as epoch milliseconds.
pub fn parse_time_millis(value: &str, format: Option<&str>) -> Option<i64> {
    if let Some(format) = format {
        return DateTime::parse_from_str(value, format)
            .map(|dt| dt.timestamp_millis())
            .or_else(|_| {
                NaiveDateTime::parse_from_str(value, format).map(|dt| dt.and_utc().timestamp_millis())
            })
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(value, format)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc().timestamp_millis())
            });
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }

    for format in FALLBACK_TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }

    value.parse::<i64>().ok()
}
