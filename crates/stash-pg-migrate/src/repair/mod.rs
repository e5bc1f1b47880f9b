//! Per-table row repairs applied to each page before it is written.
//!
//! The source tolerates values the target rejects: integers wider than the
//! target column, JSON columns holding broken text, timestamps before year 1.
//! Each [`Repair`] variant fixes one such class of problem in place.
//! Anomalies are logged and handled here; they never abort the run.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use tracing::warn;

use crate::core::value::{parse_timestamp, Batch, SqlValue};

/// Earliest calendar year PostgreSQL timestamps accept from this migration.
pub const MIN_TIMESTAMP_YEAR: i32 = 1;

/// What a repair did to one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Rows removed from the batch.
    pub dropped: usize,
    /// Values rewritten in place.
    pub repaired: usize,
}

impl RepairReport {
    pub fn merge(&mut self, other: RepairReport) {
        self.dropped += other.dropped;
        self.repaired += other.repaired;
    }
}

/// A transformation applied to every batch of one table.
pub trait RepairRule: Send + Sync {
    /// Repair `batch` in place. Only row-filtering rules change its length.
    fn repair(&self, table: &str, batch: &mut Batch) -> RepairReport;
}

/// The closed set of repair strategies. `None` is the identity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Repair {
    #[default]
    None,

    /// Clamp 64-bit integers in `column` into the `i32` range.
    ClampI32 { column: &'static str },

    /// Store the value kind of `value_column` in `tag_column`, using the
    /// names the stash application reads back (see [`custom_field_type`]).
    TypeTag {
        value_column: &'static str,
        tag_column: &'static str,
    },

    /// Drop rows whose text in any of `columns` is not valid JSON.
    ValidJson { columns: &'static [&'static str] },

    /// Replace unparseable or out-of-range timestamps with the current time.
    NormalizeTimestamps { columns: &'static [&'static str] },
}

impl RepairRule for Repair {
    fn repair(&self, table: &str, batch: &mut Batch) -> RepairReport {
        self.repair_with_clock(table, batch, &Utc::now)
    }
}

impl Repair {
    /// Like [`RepairRule::repair`] with an explicit clock for substituted timestamps.
    pub fn repair_with_clock(
        &self,
        table: &str,
        batch: &mut Batch,
        now: &dyn Fn() -> DateTime<Utc>,
    ) -> RepairReport {
        match *self {
            Repair::None => RepairReport::default(),
            Repair::ClampI32 { column } => clamp_column(batch, column),
            Repair::TypeTag {
                value_column,
                tag_column,
            } => tag_types(batch, value_column, tag_column),
            Repair::ValidJson { columns } => drop_invalid_json(table, batch, columns),
            Repair::NormalizeTimestamps { columns } => {
                normalize_timestamps(table, batch, columns, now)
            }
        }
    }
}

/// Narrow a 64-bit integer into the `i32` range, saturating at the bounds.
pub fn clamp_to_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn clamp_column(batch: &mut Batch, column: &str) -> RepairReport {
    let mut report = RepairReport::default();
    let Some(idx) = batch.column_index(column) else {
        return report;
    };

    for row in &mut batch.rows {
        if let SqlValue::I64(v) = row[idx] {
            let clamped = clamp_to_i32(v);
            if i64::from(clamped) != v {
                report.repaired += 1;
            }
            row[idx] = SqlValue::I32(clamped);
        }
    }

    report
}

/// Type tag stored next to a custom field value. These are the names the
/// stash application compares against when it decodes `value`; NULL values
/// get no tag.
pub fn custom_field_type(value: &SqlValue) -> Option<&'static str> {
    match value {
        SqlValue::Null => None,
        SqlValue::Bool(_) => Some("bool"),
        SqlValue::I32(_) => Some("int32"),
        SqlValue::I64(_) => Some("int64"),
        SqlValue::F64(_) => Some("float64"),
        SqlValue::Text(_) => Some("string"),
        SqlValue::Bytes(_) => Some("[]uint8"),
        SqlValue::Timestamp(_) => Some("time.Time"),
    }
}

fn tag_types(batch: &mut Batch, value_column: &str, tag_column: &str) -> RepairReport {
    let mut report = RepairReport::default();
    let Some(value_idx) = batch.column_index(value_column) else {
        return report;
    };
    let tag_idx = batch.ensure_column(tag_column);

    for row in &mut batch.rows {
        row[tag_idx] = match custom_field_type(&row[value_idx]) {
            Some(kind) => SqlValue::Text(kind.to_string()),
            None => SqlValue::Null,
        };
        report.repaired += 1;
    }

    report
}

fn drop_invalid_json(table: &str, batch: &mut Batch, columns: &[&str]) -> RepairReport {
    let indexes: Vec<(usize, &str)> = columns
        .iter()
        .filter_map(|c| batch.column_index(c).map(|idx| (idx, *c)))
        .collect();
    if indexes.is_empty() {
        return RepairReport::default();
    }

    let before = batch.rows.len();
    batch.rows.retain(|row| {
        for &(idx, column) in &indexes {
            let parsed = match &row[idx] {
                SqlValue::Text(s) => serde_json::from_str::<serde_json::Value>(s)
                    .map_err(|e| (e, s.clone())),
                SqlValue::Bytes(b) => serde_json::from_slice::<serde_json::Value>(b)
                    .map_err(|e| (e, String::from_utf8_lossy(b).into_owned())),
                _ => continue,
            };
            if let Err((err, raw)) = parsed {
                warn!(
                    "{}: skipping row due to invalid JSON in {}: {}\n  Data: {}",
                    table, column, err, raw
                );
                return false;
            }
        }
        true
    });

    RepairReport {
        dropped: before - batch.rows.len(),
        repaired: 0,
    }
}

fn normalize_timestamps(
    table: &str,
    batch: &mut Batch,
    columns: &[&str],
    now: &dyn Fn() -> DateTime<Utc>,
) -> RepairReport {
    let mut report = RepairReport::default();

    for column in columns {
        let Some(idx) = batch.column_index(column) else {
            continue;
        };

        for row in &mut batch.rows {
            let replacement = match &row[idx] {
                SqlValue::Null => None,
                SqlValue::Timestamp(t) if t.year() >= MIN_TIMESTAMP_YEAR => None,
                SqlValue::Timestamp(t) => {
                    warn!(
                        "{}: out-of-range time for {}: {} - using current time",
                        table, column, t
                    );
                    Some(now())
                }
                SqlValue::Text(s) => match parse_timestamp(s) {
                    Some(t) if t.year() >= MIN_TIMESTAMP_YEAR => Some(t),
                    _ => {
                        warn!(
                            "{}: invalid time for {}: {:?} - using current time",
                            table, column, s
                        );
                        Some(now())
                    }
                },
                other => {
                    warn!(
                        "{}: unrecognized time format for {}: {} - using current time",
                        table,
                        column,
                        other.preview()
                    );
                    Some(now())
                }
            };

            if let Some(t) = replacement {
                // Parsed text counts as normalized, not repaired.
                if !matches!(&row[idx], SqlValue::Text(s) if parse_timestamp(s) == Some(t)) {
                    report.repaired += 1;
                }
                row[idx] = SqlValue::Timestamp(t);
            }
        }
    }

    report
}
