//! In-memory stores for driving the migration pipeline in tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use stash_pg_migrate::{Batch, MigrateError, Result, SourceReader, SqlValue, TargetWriter};

/// Source holding whole tables in memory. Records every fetch.
#[derive(Default)]
pub struct MemorySource {
    tables: HashMap<String, Batch>,
    pub fetches: Mutex<Vec<(String, usize)>>,
    pub closed: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) -> Self {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        self.tables
            .insert(name.to_string(), Batch::new(columns, rows));
        self
    }

    /// Offsets fetched for `table`, in call order.
    pub fn offsets(&self, table: &str) -> Vec<usize> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, o)| *o)
            .collect()
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.contains_key(table))
    }

    async fn read_page(&self, table: &str, limit: usize, offset: usize) -> Result<Batch> {
        self.fetches
            .lock()
            .unwrap()
            .push((table.to_string(), offset));

        let data = self
            .tables
            .get(table)
            .ok_or_else(|| MigrateError::transfer(table, "table not found in source"))?;

        let rows: Vec<Vec<SqlValue>> = data.rows.iter().skip(offset).take(limit).cloned().collect();
        if rows.is_empty() {
            return Ok(Batch::empty());
        }
        Ok(Batch::new(data.columns.clone(), rows))
    }

    async fn get_row_count(&self, table: &str) -> Result<i64> {
        Ok(self.tables.get(table).map(|b| b.len() as i64).unwrap_or(0))
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Target collecting committed batches per table.
#[derive(Default)]
pub struct MemoryTarget {
    pub tables: Mutex<HashMap<String, Batch>>,
    pub batch_sizes: Mutex<HashMap<String, Vec<usize>>>,
    pub sequence_calls: Mutex<Vec<Vec<String>>>,
    fail_on: HashSet<String>,
    no_sequence: HashSet<String>,
    pub closed: AtomicBool,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every write to `table`.
    pub fn failing_on(mut self, table: &str) -> Self {
        self.fail_on.insert(table.to_string());
        self
    }

    /// Treat `table` as having a plain integer `id` with no sequence.
    pub fn without_sequence(mut self, table: &str) -> Self {
        self.no_sequence.insert(table.to_string());
        self
    }

    pub fn rows(&self, table: &str) -> Vec<Vec<SqlValue>> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|b| b.rows.clone())
            .unwrap_or_default()
    }

    pub fn columns(&self, table: &str) -> Vec<String> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|b| b.columns.clone())
            .unwrap_or_default()
    }

    pub fn batch_sizes(&self, table: &str) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn next_id(batch: Option<&Batch>) -> i64 {
        let Some(batch) = batch else { return 1 };
        let Some(idx) = batch.column_index("id") else {
            return 1;
        };
        batch
            .rows
            .iter()
            .filter_map(|r| match r[idx] {
                SqlValue::I64(v) => Some(v),
                SqlValue::I32(v) => Some(i64::from(v)),
                _ => None,
            })
            .max()
            .map_or(1, |max| max + 1)
    }
}

#[async_trait]
impl TargetWriter for MemoryTarget {
    async fn write_batch(&self, table: &str, batch: &Batch) -> Result<u64> {
        if self.fail_on.contains(table) {
            return Err(MigrateError::Statement {
                table: table.to_string(),
                statement: "INSERT".to_string(),
                args: String::new(),
                message: "23505: duplicate key value violates unique constraint".to_string(),
            });
        }

        let mut tables = self.tables.lock().unwrap();
        let stored = tables
            .entry(table.to_string())
            .or_insert_with(|| Batch::new(batch.columns.clone(), Vec::new()));
        stored.rows.extend(batch.rows.iter().cloned());

        self.batch_sizes
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(batch.len());

        Ok(batch.len() as u64)
    }

    async fn reset_sequences(&self, tables: &[&str]) -> Result<Vec<(String, i64)>> {
        self.sequence_calls
            .lock()
            .unwrap()
            .push(tables.iter().map(|t| t.to_string()).collect());

        let stored = self.tables.lock().unwrap();
        Ok(tables
            .iter()
            .filter(|t| !self.no_sequence.contains(**t))
            .map(|t| (t.to_string(), Self::next_id(stored.get(*t))))
            .collect())
    }

    async fn get_row_count(&self, table: &str) -> Result<i64> {
        Ok(self.rows(table).len() as i64)
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// `count` rows of `(id, <parent column>)`, ids starting at 1.
pub fn numbered_rows(count: i64, parent_of: impl Fn(i64) -> SqlValue) -> Vec<Vec<SqlValue>> {
    (1..=count)
        .map(|id| vec![SqlValue::I64(id), parent_of(id)])
        .collect()
}
