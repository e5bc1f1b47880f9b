//! Batched table transfer.
//!
//! Each table is copied page by page: fetch `page_size` rows at the current
//! offset, repair them, write them in their own transaction, advance. An empty
//! page ends the table. With read-ahead enabled a reader task fetches the next
//! page while the current one is written; pages still reach the writer in
//! read order.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::MigrationConfig;
use crate::core::catalog::{TableDescriptor, DEFAULT_PAGE_SIZE};
use crate::core::traits::{SourceReader, TargetWriter};
use crate::core::value::Batch;
use crate::error::{MigrateError, Result};
use crate::repair::RepairRule;

/// Transfer engine configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Rows per page and per write transaction.
    pub page_size: usize,
    /// Fetch the next page while the current one is written.
    pub read_ahead: bool,
    /// Limit for each fetch and write.
    pub operation_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_ahead: false,
            operation_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl From<&MigrationConfig> for TransferConfig {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            page_size: config.page_size,
            read_ahead: config.read_ahead,
            operation_timeout: config.operation_timeout(),
        }
    }
}

/// Statistics for one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub table: String,
    /// The table was optional and absent from the source.
    pub skipped: bool,
    pub rows_read: u64,
    pub rows_written: u64,
    /// Rows removed by repair rules.
    pub rows_dropped: u64,
    /// Values rewritten by repair rules.
    pub values_repaired: u64,
    /// Non-empty pages processed.
    pub batches: u64,
    pub duration_seconds: f64,
}

impl TableStats {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }
}

/// Await `fut`, failing with [`MigrateError::Timeout`] once `limit` passes.
pub async fn with_timeout<T>(
    limit: Option<Duration>,
    operation: impl FnOnce() -> String,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| MigrateError::Timeout {
                operation: operation(),
                seconds: limit.as_secs(),
            })?,
    }
}

/// Transfer engine for moving tables from the source to the target.
pub struct TransferEngine {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    config: TransferConfig,
    rows_transferred: AtomicU64,
}

impl TransferEngine {
    /// Create a new transfer engine.
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        config: TransferConfig,
    ) -> Self {
        Self {
            source,
            target,
            config,
            rows_transferred: AtomicU64::new(0),
        }
    }

    /// Get the total rows written so far across all tables.
    pub fn rows_transferred(&self) -> u64 {
        self.rows_transferred.load(Ordering::Relaxed)
    }

    /// Copy one table. Any fetch or write failure aborts with the error.
    pub async fn execute(&self, table: &TableDescriptor) -> Result<TableStats> {
        let name = table.name;
        info!("Fetching {}", name);

        let start = Instant::now();
        let mut stats = TableStats::new(name);

        if table.optional {
            let exists = with_timeout(
                self.config.operation_timeout,
                || format!("checking {}", name),
                self.source.table_exists(name),
            )
            .await?;
            if !exists {
                info!("{}: not present in source, skipping", name);
                stats.skipped = true;
                return Ok(stats);
            }
        }

        if self.config.read_ahead {
            self.copy_read_ahead(table, &mut stats).await?;
        } else {
            self.copy_sequential(table, &mut stats).await?;
        }

        stats.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            "{}: {} rows read, {} written, {} dropped in {:.2}s",
            name,
            stats.rows_read,
            stats.rows_written,
            stats.rows_dropped,
            stats.duration_seconds
        );
        Ok(stats)
    }

    async fn copy_sequential(&self, table: &TableDescriptor, stats: &mut TableStats) -> Result<()> {
        let page_size = self.config.page_size;
        let mut offset = 0usize;

        loop {
            let batch = fetch_page(
                self.source.as_ref(),
                table.name,
                page_size,
                offset,
                self.config.operation_timeout,
            )
            .await?;
            if batch.is_empty() {
                return Ok(());
            }
            self.write_page(table, batch, offset, stats).await?;
            offset += page_size;
        }
    }

    async fn copy_read_ahead(&self, table: &TableDescriptor, stats: &mut TableStats) -> Result<()> {
        let name = table.name;
        let page_size = self.config.page_size;
        let timeout = self.config.operation_timeout;

        // Depth 1: at most one page waits while another is being written.
        let (tx, mut rx) = mpsc::channel::<Result<Batch>>(1);
        let source = self.source.clone();

        let reader = tokio::spawn(async move {
            let mut offset = 0usize;
            loop {
                let result = fetch_page(source.as_ref(), name, page_size, offset, timeout).await;
                let last = !matches!(&result, Ok(batch) if !batch.is_empty());
                if tx.send(result).await.is_err() || last {
                    return;
                }
                offset += page_size;
            }
        });

        let mut offset = 0usize;
        while let Some(result) = rx.recv().await {
            let batch = result?;
            if batch.is_empty() {
                break;
            }
            self.write_page(table, batch, offset, stats).await?;
            offset += page_size;
        }

        reader
            .await
            .map_err(|e| MigrateError::transfer(name, format!("Reader task failed: {}", e)))
    }

    async fn write_page(
        &self,
        table: &TableDescriptor,
        mut batch: Batch,
        offset: usize,
        stats: &mut TableStats,
    ) -> Result<()> {
        let name = table.name;
        let read = batch.len();
        stats.rows_read += read as u64;
        stats.batches += 1;

        let report = table.repair.repair(name, &mut batch);
        stats.rows_dropped += report.dropped as u64;
        stats.values_repaired += report.repaired as u64;

        if batch.is_empty() {
            debug!("{}: every row at offset {} was dropped", name, offset);
            return Ok(());
        }

        let expected = batch.len() as u64;
        let written = with_timeout(
            self.config.operation_timeout,
            || format!("writing {} at offset {}", name, offset),
            self.target.write_batch(name, &batch),
        )
        .await?;

        if written != expected {
            return Err(MigrateError::transfer(
                name,
                format!("wrote {} of {} rows at offset {}", written, expected, offset),
            ));
        }

        stats.rows_written += written;
        self.rows_transferred.fetch_add(written, Ordering::Relaxed);
        debug!(
            "{}: offset {} read {} rows, wrote {}",
            name, offset, read, written
        );
        Ok(())
    }
}

async fn fetch_page(
    source: &dyn SourceReader,
    table: &str,
    page_size: usize,
    offset: usize,
    timeout: Option<Duration>,
) -> Result<Batch> {
    with_timeout(
        timeout,
        || format!("fetching {} at offset {}", table, offset),
        source.read_page(table, page_size, offset),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::SqlValue;
    use crate::repair::Repair;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Source with one table of `rows` integer ids.
    struct Counting {
        rows: usize,
        delay: Option<Duration>,
        offsets: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl SourceReader for Counting {
        async fn table_exists(&self, table: &str) -> Result<bool> {
            Ok(table == "tags")
        }

        async fn read_page(&self, _table: &str, limit: usize, offset: usize) -> Result<Batch> {
            self.offsets.lock().unwrap().push(offset);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let end = self.rows.min(offset + limit);
            if offset >= end {
                return Ok(Batch::empty());
            }
            let rows = (offset..end)
                .map(|i| vec![SqlValue::I64(i as i64 + 1)])
                .collect();
            Ok(Batch::new(vec!["id".to_string()], rows))
        }

        async fn get_row_count(&self, _table: &str) -> Result<i64> {
            Ok(self.rows as i64)
        }

        fn db_type(&self) -> &str {
            "memory"
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        batches: Mutex<Vec<Batch>>,
    }

    #[async_trait]
    impl TargetWriter for Recording {
        async fn write_batch(&self, _table: &str, batch: &Batch) -> Result<u64> {
            self.batches.lock().unwrap().push(batch.clone());
            Ok(batch.len() as u64)
        }

        async fn reset_sequences(&self, _tables: &[&str]) -> Result<Vec<(String, i64)>> {
            Ok(Vec::new())
        }

        async fn get_row_count(&self, _table: &str) -> Result<i64> {
            Ok(0)
        }

        fn db_type(&self) -> &str {
            "memory"
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn engine(rows: usize, config: TransferConfig) -> (Arc<Counting>, Arc<Recording>, TransferEngine) {
        let source = Arc::new(Counting {
            rows,
            delay: None,
            offsets: Mutex::new(Vec::new()),
        });
        let target = Arc::new(Recording::default());
        let engine = TransferEngine::new(source.clone(), target.clone(), config);
        (source, target, engine)
    }

    fn ids(target: &Recording) -> Vec<i64> {
        target
            .batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.rows.iter())
            .map(|r| match r[0] {
                SqlValue::I64(v) => v,
                _ => panic!("unexpected value"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pages_until_empty_fetch() {
        let config = TransferConfig {
            page_size: 10,
            ..Default::default()
        };
        let (source, target, engine) = engine(25, config);

        let stats = engine.execute(&TableDescriptor::new("tags")).await.unwrap();

        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 10, 20, 30]);
        assert_eq!(stats.rows_read, 25);
        assert_eq!(stats.rows_written, 25);
        assert_eq!(stats.batches, 3);
        assert_eq!(ids(&target), (1..=25).collect::<Vec<_>>());
        assert_eq!(engine.rows_transferred(), 25);
    }

    #[tokio::test]
    async fn test_exact_multiple_of_page_size() {
        let config = TransferConfig {
            page_size: 10,
            ..Default::default()
        };
        let (source, target, engine) = engine(20, config);

        engine.execute(&TableDescriptor::new("tags")).await.unwrap();

        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 10, 20]);
        assert_eq!(target.batches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_read_ahead_preserves_order() {
        let config = TransferConfig {
            page_size: 7,
            read_ahead: true,
            ..Default::default()
        };
        let (_source, target, engine) = engine(50, config);

        let stats = engine.execute(&TableDescriptor::new("tags")).await.unwrap();

        assert_eq!(stats.batches, 8);
        assert_eq!(ids(&target), (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_missing_optional_table_is_skipped() {
        let (source, target, engine) = engine(5, TransferConfig::default());
        let table = TableDescriptor::new("performer_custom_fields").optional();

        let stats = engine.execute(&table).await.unwrap();

        assert!(stats.skipped);
        assert!(source.offsets.lock().unwrap().is_empty());
        assert!(target.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repair_applied_before_write() {
        let (_source, target, engine) = engine(3, TransferConfig::default());
        let table = TableDescriptor::new("tags").with_repair(Repair::TypeTag {
            value_column: "id",
            tag_column: "type",
        });

        let stats = engine.execute(&table).await.unwrap();

        assert_eq!(stats.values_repaired, 3);
        let batches = target.batches.lock().unwrap();
        assert_eq!(batches[0].columns, vec!["id", "type"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out() {
        let source = Arc::new(Counting {
            rows: 5,
            delay: Some(Duration::from_secs(30)),
            offsets: Mutex::new(Vec::new()),
        });
        let config = TransferConfig {
            operation_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let engine = TransferEngine::new(source, Arc::new(Recording::default()), config);

        let err = engine.execute(&TableDescriptor::new("tags")).await.unwrap_err();

        assert!(matches!(err, MigrateError::Timeout { seconds: 5, .. }));
    }
}
