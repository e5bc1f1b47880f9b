//! SQL value and batch types shared by the reader, the repair rules and the writer.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// A single column value as read from the source.
///
/// SQLite stores values by storage class, so most values arrive as `I64`,
/// `F64`, `Text` or `Bytes`. `Bool` and `Timestamp` are produced for columns
/// declared with those types, and `I32` only by the clamp repair rule.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// 32-bit signed integer (integer/int4).
    I32(i32),

    /// 64-bit signed integer (bigint/int8).
    I64(i64),

    /// Double precision floating point.
    F64(f64),

    /// Text data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// Point in time, normalized to UTC.
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Stable name of the variant, used as a type discriminator.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "boolean",
            SqlValue::I32(_) | SqlValue::I64(_) => "integer",
            SqlValue::F64(_) => "float",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "binary",
            SqlValue::Timestamp(_) => "timestamp",
        }
    }

    /// Short rendering for diagnostics; long text and blobs are truncated.
    #[must_use]
    pub fn preview(&self) -> String {
        const MAX: usize = 64;
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Text(s) if s.chars().count() > MAX => {
                let head: String = s.chars().take(MAX).collect();
                format!("{:?}...", head)
            }
            SqlValue::Text(s) => format!("{:?}", s),
            SqlValue::Bytes(b) => format!("<{} bytes>", b.len()),
            SqlValue::Timestamp(t) => t.to_rfc3339(),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Naive layouts SQLite applications commonly write, tried after RFC 3339.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse a textual timestamp.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff][+hh:mm]`, the same with a
/// `T` separator, and bare dates. Values without an offset are taken as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%:z"] {
        if let Ok(t) = DateTime::parse_from_str(text, fmt) {
            return Some(t.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

/// A page of rows read from one table.
///
/// All rows share the column header; `rows[i][j]` is the value of
/// `columns[j]` in the i-th row read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    /// Column names in source order.
    pub columns: Vec<String>,

    /// Rows in read order.
    pub rows: Vec<Vec<SqlValue>>,
}

impl Batch {
    /// Create a batch with the given header and rows.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self { columns, rows }
    }

    /// Create an empty batch, the end-of-table sentinel.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Position of a column in the header.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Position of a column, appending it (NULL in every row) if absent.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(SqlValue::Null);
        }
        self.columns.len() - 1
    }

    /// Value of `column` in row `row`, if both exist.
    #[must_use]
    pub fn get(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Get the number of rows in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
