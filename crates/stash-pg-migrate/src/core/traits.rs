//! Core traits for the migration stores.
//!
//! - [`SourceReader`]: reads pages of rows from the source database
//! - [`TargetWriter`]: writes pages of rows and resets sequences on the target
//!
//! The transfer engine and the orchestrator only see these traits, so tests
//! can drive the whole pipeline with in-memory stores.

use async_trait::async_trait;

use crate::error::Result;

use super::value::Batch;

/// Read data from the source database.
///
/// Every page is read from the same snapshot for the lifetime of the reader.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Check whether a table exists in the source.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Read up to `limit` rows of `table`, skipping the first `offset`.
    ///
    /// Rows come back in the table's natural order. A batch with no rows
    /// means the table is exhausted; its column header may be empty.
    async fn read_page(&self, table: &str, limit: usize, offset: usize) -> Result<Batch>;

    /// Get the row count for a table.
    async fn get_row_count(&self, table: &str) -> Result<i64>;

    /// Get the database type identifier (e.g., "sqlite").
    fn db_type(&self) -> &str;

    /// Release the snapshot and close the connection.
    async fn close(&self) -> Result<()>;
}

/// Write data to the target database.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Insert every row of `batch` into `table` inside one transaction.
    ///
    /// Either all rows are committed or none are. Returns the rows written.
    async fn write_batch(&self, table: &str, batch: &Batch) -> Result<u64>;

    /// Point the `id` sequence of each table past its largest id.
    ///
    /// All resets share one transaction. Returns the next value each
    /// sequence will hand out, in input order. Tables whose `id` has no
    /// sequence are left out.
    async fn reset_sequences(&self, tables: &[&str]) -> Result<Vec<(String, i64)>>;

    /// Get the row count for a table.
    async fn get_row_count(&self, table: &str) -> Result<i64>;

    /// Get the database type identifier (e.g., "postgres").
    fn db_type(&self) -> &str;

    /// Close the session.
    async fn close(&self) -> Result<()>;
}
