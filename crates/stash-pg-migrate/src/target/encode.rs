//! INSERT statement construction and parameter encoding.
//!
//! Values are bound with the types PostgreSQL reports for the prepared
//! statement, so a SQLite integer can land in a `boolean`, `integer` or
//! `bigint` column alike.

use std::error::Error;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::core::identifier::quote_ident;
use crate::core::value::{parse_timestamp, SqlValue};
use crate::error::Result;

/// PostgreSQL's limit on bind parameters in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// A boxed, thread-safe statement parameter.
pub type Param = Box<dyn ToSql + Sync + Send>;

/// Rows per INSERT so that `rows * columns` stays within the bind limit.
pub fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

/// Build `INSERT INTO "t" ("a", "b") VALUES ($1, $2), ($3, $4)` for `rows` rows.
pub fn build_insert_sql(table: &str, columns: &[String], rows: usize) -> Result<String> {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    let width = columns.len();
    let mut sql = format!("INSERT INTO {} ({}) VALUES ", quote_ident(table)?, column_list);
    sql.reserve(rows * width * 6);

    for r in 0..rows {
        if r > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for c in 0..width {
            if c > 0 {
                sql.push_str(", ");
            }
            sql.push('$');
            sql.push_str(&(r * width + c + 1).to_string());
        }
        sql.push(')');
    }

    Ok(sql)
}

/// A NULL accepted for any parameter type.
#[derive(Debug)]
struct Null;

impl ToSql for Null {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn Error + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Convert a value into a parameter of the given PostgreSQL type.
///
/// Returns a description of the mismatch when the value cannot be
/// represented in that type.
pub fn encode_param(value: &SqlValue, ty: &Type) -> std::result::Result<Param, String> {
    if value.is_null() {
        return Ok(Box::new(Null));
    }

    let mismatch = || {
        format!(
            "cannot store {} value {} in a column of type {}",
            value.type_name(),
            value.preview(),
            ty.name()
        )
    };

    let param: Param = match (ty.name(), value) {
        ("bool", SqlValue::Bool(b)) => Box::new(*b),
        ("bool", SqlValue::I64(v)) => Box::new(*v != 0),
        ("bool", SqlValue::I32(v)) => Box::new(*v != 0),
        ("bool", SqlValue::Text(s)) => match s.trim().to_lowercase().as_str() {
            "1" | "t" | "true" => Box::new(true),
            "0" | "f" | "false" => Box::new(false),
            _ => return Err(mismatch()),
        },

        ("int2", SqlValue::I64(v)) => Box::new(i16::try_from(*v).map_err(|_| mismatch())?),
        ("int2", SqlValue::I32(v)) => Box::new(i16::try_from(*v).map_err(|_| mismatch())?),
        ("int2", SqlValue::Bool(b)) => Box::new(i16::from(*b)),

        ("int4", SqlValue::I64(v)) => Box::new(i32::try_from(*v).map_err(|_| mismatch())?),
        ("int4", SqlValue::I32(v)) => Box::new(*v),
        ("int4", SqlValue::Bool(b)) => Box::new(i32::from(*b)),

        ("int8", SqlValue::I64(v)) => Box::new(*v),
        ("int8", SqlValue::I32(v)) => Box::new(i64::from(*v)),
        ("int8", SqlValue::Bool(b)) => Box::new(i64::from(*b)),

        ("int2" | "int4" | "int8", SqlValue::Text(s)) => {
            let v: i64 = s.trim().parse().map_err(|_| mismatch())?;
            match ty.name() {
                "int2" => Box::new(i16::try_from(v).map_err(|_| mismatch())?),
                "int4" => Box::new(i32::try_from(v).map_err(|_| mismatch())?),
                _ => Box::new(v),
            }
        }

        ("float4", SqlValue::F64(v)) => Box::new(*v as f32),
        ("float4", SqlValue::I64(v)) => Box::new(*v as f32),
        ("float4", SqlValue::I32(v)) => Box::new(*v as f32),
        ("float8", SqlValue::F64(v)) => Box::new(*v),
        ("float8", SqlValue::I64(v)) => Box::new(*v as f64),
        ("float8", SqlValue::I32(v)) => Box::new(f64::from(*v)),
        ("float4" | "float8", SqlValue::Text(s)) => {
            let v: f64 = s.trim().parse().map_err(|_| mismatch())?;
            if ty.name() == "float4" {
                Box::new(v as f32)
            } else {
                Box::new(v)
            }
        }

        ("numeric", SqlValue::I64(v)) => Box::new(Decimal::from(*v)),
        ("numeric", SqlValue::I32(v)) => Box::new(Decimal::from(*v)),
        ("numeric", SqlValue::F64(v)) => Box::new(Decimal::try_from(*v).map_err(|_| mismatch())?),
        ("numeric", SqlValue::Text(s)) => {
            Box::new(s.trim().parse::<Decimal>().map_err(|_| mismatch())?)
        }

        ("text" | "varchar" | "bpchar" | "name", v) => Box::new(text_of(v).ok_or_else(mismatch)?),

        ("json" | "jsonb", SqlValue::Text(s)) => {
            Box::new(serde_json::from_str::<serde_json::Value>(s).map_err(|e| e.to_string())?)
        }
        ("json" | "jsonb", SqlValue::Bytes(b)) => {
            Box::new(serde_json::from_slice::<serde_json::Value>(b).map_err(|e| e.to_string())?)
        }
        ("json" | "jsonb", SqlValue::Bool(b)) => Box::new(serde_json::Value::from(*b)),
        ("json" | "jsonb", SqlValue::I64(v)) => Box::new(serde_json::Value::from(*v)),
        ("json" | "jsonb", SqlValue::I32(v)) => Box::new(serde_json::Value::from(*v)),
        ("json" | "jsonb", SqlValue::F64(v)) => Box::new(serde_json::Value::from(*v)),

        ("bytea", SqlValue::Bytes(b)) => Box::new(b.clone()),
        ("bytea", SqlValue::Text(s)) => Box::new(s.clone().into_bytes()),

        ("timestamptz", v) => Box::new(instant_of(v).ok_or_else(mismatch)?),
        ("timestamp", v) => Box::new(instant_of(v).ok_or_else(mismatch)?.naive_utc()),
        ("date", SqlValue::Text(s)) => Box::new(
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .ok()
                .or_else(|| parse_timestamp(s).map(|t| t.date_naive()))
                .ok_or_else(mismatch)?,
        ),
        ("date", v) => Box::new(instant_of(v).ok_or_else(mismatch)?.date_naive()),
        ("time", SqlValue::Text(s)) => Box::new(
            NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
                .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M"))
                .map_err(|_| mismatch())?,
        ),

        _ => return Err(mismatch()),
    };

    Ok(param)
}

fn text_of(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Text(s) => Some(s.clone()),
        SqlValue::Bool(b) => Some(b.to_string()),
        SqlValue::I32(v) => Some(v.to_string()),
        SqlValue::I64(v) => Some(v.to_string()),
        SqlValue::F64(v) => Some(v.to_string()),
        SqlValue::Timestamp(t) => Some(t.to_rfc3339()),
        SqlValue::Bytes(b) => String::from_utf8(b.clone()).ok(),
        SqlValue::Null => None,
    }
}

/// Interpret a value as a point in time. Integers are Unix seconds.
fn instant_of(value: &SqlValue) -> Option<DateTime<Utc>> {
    match value {
        SqlValue::Timestamp(t) => Some(*t),
        SqlValue::Text(s) => parse_timestamp(s),
        SqlValue::I64(secs) => DateTime::from_timestamp(*secs, 0),
        SqlValue::I32(secs) => DateTime::from_timestamp(i64::from(*secs), 0),
        _ => None,
    }
}

/// Render the first row of a failed statement for error reports.
pub fn preview_args(row: &[SqlValue]) -> String {
    row.iter()
        .map(SqlValue::preview)
        .collect::<Vec<_>>()
        .join(", ")
}
