//! SQLite source reader.
//!
//! Implements [`SourceReader`] for the stash SQLite database using SQLx. The
//! database is opened read-only through a pool of one connection, and a read
//! transaction is held for the reader's lifetime so every page comes from the
//! same snapshot.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::core::identifier::quote_ident;
use crate::core::traits::SourceReader;
use crate::core::value::{parse_timestamp, Batch, SqlValue};
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A column as declared in the source schema.
#[derive(Debug, Clone)]
struct SourceColumn {
    name: String,
    /// Lowercased declared type; empty when the column has none.
    decl_type: String,
}

impl SourceColumn {
    fn is_bool(&self) -> bool {
        self.decl_type.starts_with("bool")
    }

    fn is_datetime(&self) -> bool {
        self.decl_type.contains("datetime") || self.decl_type.contains("timestamp")
    }
}

/// State owned by the single reader session.
struct Snapshot {
    tx: Option<Transaction<'static, Sqlite>>,
    columns: HashMap<String, Vec<SourceColumn>>,
}

/// SQLite source reader implementation.
pub struct SqliteReader {
    pool: SqlitePool,
    snapshot: Mutex<Snapshot>,
}

impl SqliteReader {
    /// Open the database at `config.path` and start the read snapshot.
    pub async fn open(config: &SourceConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .read_only(true)
            .create_if_missing(false)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::connection(format!("sqlite {}", config.path), e))?;

        // WAL keeps a concurrent writer from blocking the snapshot. Switching
        // needs write access, so a read-only open may keep the current mode.
        let journal_mode = match sqlx::query_scalar::<_, String>("PRAGMA journal_mode = WAL")
            .fetch_one(&pool)
            .await
        {
            Ok(mode) => mode,
            Err(e) => {
                debug!("Could not switch source to WAL: {}", e);
                sqlx::query_scalar::<_, String>("PRAGMA journal_mode")
                    .fetch_one(&pool)
                    .await
                    .map_err(|e| MigrateError::connection("sqlite", e))?
            }
        };
        if journal_mode.eq_ignore_ascii_case("wal") {
            debug!("Source journal mode: {}", journal_mode);
        } else {
            warn!(
                "Source journal mode is {}, not WAL; concurrent writers may block the migration",
                journal_mode
            );
        }

        let tx = pool
            .begin()
            .await
            .map_err(|e| MigrateError::connection("sqlite", e))?;

        info!("Opened SQLite source: {}", config.path);

        Ok(Self {
            pool,
            snapshot: Mutex::new(Snapshot {
                tx: Some(tx),
                columns: HashMap::new(),
            }),
        })
    }

    /// Load (once) the declared columns of a table.
    async fn load_columns<'a>(
        snapshot: &'a mut Snapshot,
        table: &str,
    ) -> Result<&'a [SourceColumn]> {
        if !snapshot.columns.contains_key(table) {
            let tx = snapshot
                .tx
                .as_mut()
                .ok_or_else(|| MigrateError::transfer(table, "source reader is closed"))?;

            let rows: Vec<SqliteRow> =
                sqlx::query("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")
                    .bind(table)
                    .fetch_all(&mut **tx)
                    .await?;

            let columns: Vec<SourceColumn> = rows
                .iter()
                .map(|row| {
                    Ok(SourceColumn {
                        name: row.try_get::<String, _>(0)?,
                        decl_type: row.try_get::<String, _>(1)?.to_lowercase(),
                    })
                })
                .collect::<std::result::Result<_, sqlx::Error>>()?;

            if columns.is_empty() {
                return Err(MigrateError::transfer(table, "table not found in source"));
            }
            snapshot.columns.insert(table.to_string(), columns);
        }

        Ok(snapshot
            .columns
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    /// Convert a SQLite row into values, decoding by storage class.
    fn row_to_values(row: &SqliteRow, columns: &[SourceColumn]) -> Result<Vec<SqlValue>> {
        columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let raw = row.try_get_raw(i)?;
                if raw.is_null() {
                    return Ok(SqlValue::Null);
                }
                let storage = raw.type_info().name().to_string();

                let value = match storage.as_str() {
                    "INTEGER" => {
                        let v = row.try_get_unchecked::<i64, _>(i)?;
                        if col.is_bool() {
                            SqlValue::Bool(v != 0)
                        } else {
                            SqlValue::I64(v)
                        }
                    }
                    "REAL" => SqlValue::F64(row.try_get_unchecked::<f64, _>(i)?),
                    "BLOB" => SqlValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(i)?),
                    _ => {
                        let text = row.try_get_unchecked::<String, _>(i)?;
                        match col.is_datetime().then(|| parse_timestamp(&text)).flatten() {
                            Some(t) => SqlValue::Timestamp(t),
                            None => SqlValue::Text(text),
                        }
                    }
                };
                Ok(value)
            })
            .collect()
    }
}

#[async_trait]
impl SourceReader for SqliteReader {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut snapshot = self.snapshot.lock().await;
        let tx = snapshot
            .tx
            .as_mut()
            .ok_or_else(|| MigrateError::transfer(table, "source reader is closed"))?;

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(table)
        .fetch_one(&mut **tx)
        .await?;

        Ok(count > 0)
    }

    async fn read_page(&self, table: &str, limit: usize, offset: usize) -> Result<Batch> {
        let mut snapshot = self.snapshot.lock().await;
        let columns = Self::load_columns(&mut snapshot, table).await?.to_vec();

        let column_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let query = format!(
            "SELECT {} FROM {} LIMIT ?1 OFFSET ?2",
            column_list,
            quote_ident(table)?
        );

        let tx = snapshot
            .tx
            .as_mut()
            .ok_or_else(|| MigrateError::transfer(table, "source reader is closed"))?;

        let rows: Vec<SqliteRow> = sqlx::query(&query)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&mut **tx)
            .await?;

        if rows.is_empty() {
            return Ok(Batch::empty());
        }

        let values = rows
            .iter()
            .map(|row| Self::row_to_values(row, &columns))
            .collect::<Result<Vec<_>>>()?;

        Ok(Batch::new(
            columns.into_iter().map(|c| c.name).collect(),
            values,
        ))
    }

    async fn get_row_count(&self, table: &str) -> Result<i64> {
        let mut snapshot = self.snapshot.lock().await;
        let tx = snapshot
            .tx
            .as_mut()
            .ok_or_else(|| MigrateError::transfer(table, "source reader is closed"))?;

        let query = format!("SELECT COUNT(*) FROM {}", quote_ident(table)?);
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&mut **tx).await?;
        Ok(count)
    }

    fn db_type(&self) -> &str {
        "sqlite"
    }

    async fn close(&self) -> Result<()> {
        let tx = self.snapshot.lock().await.tx.take();
        if let Some(tx) = tx {
            tx.rollback().await?;
        }
        self.pool.close().await;
        Ok(())
    }
}
