//! PostgreSQL target writer.
//!
//! Implements [`TargetWriter`] on a single deadpool-postgres session. The
//! session is checked out once and kept for the whole run, so the session
//! settings made at connect time apply to every batch.

pub mod encode;
pub mod tls;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio::sync::Mutex;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use crate::config::{redact_connection_string, TargetConfig};
use crate::core::identifier::{quote_ident, quote_literal};
use crate::core::traits::TargetWriter;
use crate::core::value::Batch;
use crate::error::{MigrateError, Result};

use encode::{build_insert_sql, encode_param, preview_args, rows_per_statement};
use tls::SslMode;

/// Session setup applied right after connecting. Replica mode skips
/// foreign-key triggers so tables can load in any order.
const SESSION_SETUP: &str = "SET session_replication_role = replica";

/// Largest `statement_timeout` PostgreSQL accepts, in whole seconds. The
/// server setting is an `int` of milliseconds.
pub const MAX_STATEMENT_TIMEOUT_SECS: u64 = i32::MAX as u64 / 1000;

/// PostgreSQL target writer implementation.
pub struct PgWriter {
    pool: Pool,
    session: Mutex<Option<Object>>,
}

impl PgWriter {
    /// Connect to the target and prepare the migration session.
    pub async fn connect(config: &TargetConfig) -> Result<Self> {
        let mut pg_config = PgConfig::from_str(&config.url).map_err(|e| {
            MigrateError::Config(format!("invalid target connection string: {}", e))
        })?;

        // Connection options for reliability
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        let ssl_mode = match &config.ssl_mode {
            Some(mode) => SslMode::parse(mode)?,
            None => SslMode::from_connection(pg_config.get_ssl_mode()),
        };
        pg_config.ssl_mode(ssl_mode.negotiation());

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let pool = match tls::make_connector(ssl_mode)? {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(1)
                    .build()
                    .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?
            }
            Some(connector) => {
                let mgr = Manager::from_config(pg_config, connector, mgr_config);
                Pool::builder(mgr)
                    .max_size(1)
                    .build()
                    .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?
            }
        };

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::connection("postgres", e))?;

        client
            .batch_execute(SESSION_SETUP)
            .await
            .map_err(|e| MigrateError::connection("postgres", describe_pg_error(&e)))?;

        if let Some(secs) = config.statement_timeout_secs {
            client
                .batch_execute(&statement_timeout_sql(secs)?)
                .await
                .map_err(|e| MigrateError::connection("postgres", describe_pg_error(&e)))?;
        }

        info!(
            "Connected to PostgreSQL target: {}",
            redact_connection_string(&config.url)
        );

        Ok(Self {
            pool,
            session: Mutex::new(Some(client)),
        })
    }
}

/// Build the statement that moves the `id` sequence of `table` past its
/// largest id, or to 1 when the table is empty.
pub fn reset_sequence_sql(table: &str) -> Result<String> {
    let ident = quote_ident(table)?;
    Ok(format!(
        "SELECT setval(pg_get_serial_sequence({}, 'id'), COALESCE(MAX(id) + 1, 1), false) FROM {}",
        quote_literal(&ident),
        ident
    ))
}

/// Build the session setting for a statement timeout of `secs` seconds.
pub fn statement_timeout_sql(secs: u64) -> Result<String> {
    let millis = secs
        .checked_mul(1000)
        .filter(|ms| *ms <= i32::MAX as u64)
        .ok_or_else(|| {
            MigrateError::Config(format!(
                "statement timeout of {}s exceeds the {}s maximum",
                secs, MAX_STATEMENT_TIMEOUT_SECS
            ))
        })?;
    Ok(format!("SET statement_timeout = {}", millis))
}

/// Flatten a PostgreSQL error into one line including server detail.
pub fn describe_pg_error(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => {
            let mut msg = format!("{}: {}", db.code().code(), db.message());
            if let Some(detail) = db.detail() {
                msg.push_str(&format!(" ({})", detail));
            }
            msg
        }
        None => e.to_string(),
    }
}

fn closed(table: &str) -> MigrateError {
    MigrateError::transfer(table, "target session is closed")
}

#[async_trait]
impl TargetWriter for PgWriter {
    async fn write_batch(&self, table: &str, batch: &Batch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        if batch.columns.is_empty() {
            return Err(MigrateError::transfer(table, "batch has rows but no columns"));
        }

        let mut session = self.session.lock().await;
        let client = session.as_mut().ok_or_else(|| closed(table))?;

        // Dropping the transaction without commit rolls it back.
        let tx = client.transaction().await?;
        let chunk_rows = rows_per_statement(batch.columns.len());
        let mut written = 0u64;

        for chunk in batch.rows.chunks(chunk_rows) {
            let sql = build_insert_sql(table, &batch.columns, chunk.len())?;
            let statement_error = |message: String| MigrateError::Statement {
                table: table.to_string(),
                statement: format!(
                    "INSERT INTO {} ({}) VALUES ... ({} rows)",
                    table,
                    batch.columns.join(", "),
                    chunk.len()
                ),
                args: preview_args(&chunk[0]),
                message,
            };

            let stmt = tx
                .prepare(&sql)
                .await
                .map_err(|e| statement_error(describe_pg_error(&e)))?;

            let types = stmt.params();
            let mut params = Vec::with_capacity(types.len());
            for (i, value) in chunk.iter().flatten().enumerate() {
                let param = encode_param(value, &types[i]).map_err(|e| {
                    statement_error(format!(
                        "column {}: {}",
                        batch.columns[i % batch.columns.len()],
                        e
                    ))
                })?;
                params.push(param);
            }
            let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
                .collect();

            written += tx
                .execute(&stmt, &refs)
                .await
                .map_err(|e| statement_error(describe_pg_error(&e)))?;
        }

        tx.commit().await?;
        debug!("{}: committed {} rows", table, written);
        Ok(written)
    }

    async fn reset_sequences(&self, tables: &[&str]) -> Result<Vec<(String, i64)>> {
        let mut session = self.session.lock().await;
        let client = session.as_mut().ok_or_else(|| closed("sequences"))?;

        let tx = client.transaction().await?;
        let mut values = Vec::with_capacity(tables.len());

        for table in tables {
            let sql = reset_sequence_sql(table)?;
            let statement_error = |message: String| MigrateError::Statement {
                table: table.to_string(),
                statement: sql.clone(),
                args: String::new(),
                message,
            };

            let row = tx
                .query_one(&sql, &[])
                .await
                .map_err(|e| statement_error(describe_pg_error(&e)))?;
            let next: Option<i64> = row
                .try_get(0)
                .map_err(|e| statement_error(describe_pg_error(&e)))?;

            match next {
                Some(next) => {
                    debug!("Reset sequence for {} to {}", table, next);
                    values.push((table.to_string(), next));
                }
                None => warn!("{}: id column has no sequence, not resetting", table),
            }
        }

        tx.commit().await?;
        Ok(values)
    }

    async fn get_row_count(&self, table: &str) -> Result<i64> {
        let session = self.session.lock().await;
        let client = session.as_ref().ok_or_else(|| closed(table))?;

        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table)?);
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get::<_, i64>(0))
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) -> Result<()> {
        drop(self.session.lock().await.take());
        self.pool.close();
        Ok(())
    }
}
