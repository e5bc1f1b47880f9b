//! Migration orchestrator - main workflow coordinator.
//!
//! Opens both stores, copies every planned table in dependency order through
//! the [`TransferEngine`], resynchronizes sequences, and closes the stores on
//! every path out.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::core::catalog::MigrationPlan;
use crate::core::traits::{SourceReader, TargetWriter};
use crate::error::{MigrateError, Result};
use crate::sequence::{resync_sequences, SequenceReset};
use crate::source::SqliteReader;
use crate::target::PgWriter;
use crate::transfer::{TableStats, TransferConfig, TransferEngine};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    plan: MigrationPlan,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Tables in the plan.
    pub tables_total: usize,

    /// Optional tables absent from the source.
    pub tables_skipped: usize,

    /// Total rows read from the source.
    pub rows_read: u64,

    /// Total rows written to the target.
    pub rows_transferred: u64,

    /// Rows dropped by repair rules.
    pub rows_dropped: u64,

    /// Values rewritten by repair rules.
    pub values_repaired: u64,

    /// Average throughput (rows/second).
    pub rows_per_second: u64,

    /// Per-table statistics in migration order.
    pub tables: Vec<TableStats>,

    /// Sequence values set after the load.
    pub sequences: Vec<SequenceReset>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Row counts of one table on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCount {
    pub table: String,
    pub source_rows: i64,
    pub target_rows: i64,
}

impl TableCount {
    pub fn matches(&self) -> bool {
        self.source_rows == self.target_rows
    }
}

/// Result of comparing source and target row counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub tables: Vec<TableCount>,
}

impl ValidationReport {
    /// Tables whose counts differ.
    pub fn mismatches(&self) -> Vec<&TableCount> {
        self.tables.iter().filter(|t| !t.matches()).collect()
    }

    /// Fail with [`MigrateError::Validation`] naming every mismatched table.
    pub fn into_result(self) -> Result<Self> {
        let names: Vec<String> = self
            .mismatches()
            .iter()
            .map(|t| format!("{} (source={}, target={})", t.table, t.source_rows, t.target_rows))
            .collect();
        if names.is_empty() {
            return Ok(self);
        }
        Err(MigrateError::Validation(format!(
            "row counts differ for {}",
            names.join(", ")
        )))
    }
}

/// Result of probing both stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_error: Option<String>,
}

impl Orchestrator {
    /// Validate the configuration and open both stores.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let source = SqliteReader::open(&config.source).await?;
        let target = match PgWriter::connect(&config.target).await {
            Ok(target) => target,
            Err(e) => {
                if let Err(close_err) = source.close().await {
                    warn!("Failed to close source: {}", close_err);
                }
                return Err(e);
            }
        };

        Self::with_stores(config, Arc::new(source), Arc::new(target))
    }

    /// Build an orchestrator over already opened stores.
    pub fn with_stores(
        config: Config,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
    ) -> Result<Self> {
        let plan = MigrationPlan::from_config(&config.migration)?;
        Ok(Self {
            config,
            plan,
            source,
            target,
        })
    }

    /// Run the migration, then close both stores.
    pub async fn run(self) -> Result<MigrationResult> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            "Starting migration {}: {} tables from {} to {}, page size {}",
            run_id,
            self.plan.tables.len(),
            self.source.db_type(),
            self.target.db_type(),
            self.plan.page_size
        );

        let outcome = self.migrate().await;
        let closed = self.close().await;
        let (tables, sequences) = outcome?;
        closed?;

        let duration = start.elapsed();
        let rows_transferred: u64 = tables.iter().map(|t| t.rows_written).sum();
        let rows_per_second = if duration.as_secs_f64() > 0.0 {
            (rows_transferred as f64 / duration.as_secs_f64()) as u64
        } else {
            0
        };

        let result = MigrationResult {
            run_id,
            status: "completed".to_string(),
            duration_seconds: duration.as_secs_f64(),
            started_at,
            completed_at: Utc::now(),
            tables_total: tables.len(),
            tables_skipped: tables.iter().filter(|t| t.skipped).count(),
            rows_read: tables.iter().map(|t| t.rows_read).sum(),
            rows_transferred,
            rows_dropped: tables.iter().map(|t| t.rows_dropped).sum(),
            values_repaired: tables.iter().map(|t| t.values_repaired).sum(),
            rows_per_second,
            tables,
            sequences,
        };

        info!(
            "Migration {} finished: {} rows in {:.2}s ({} dropped)",
            result.run_id, result.rows_transferred, result.duration_seconds, result.rows_dropped
        );

        Ok(result)
    }

    async fn migrate(&self) -> Result<(Vec<TableStats>, Vec<SequenceReset>)> {
        let engine = TransferEngine::new(
            self.source.clone(),
            self.target.clone(),
            TransferConfig::from(&self.config.migration),
        );

        let mut tables = Vec::with_capacity(self.plan.tables.len());
        for table in &self.plan.tables {
            tables.push(engine.execute(table).await?);
        }

        let skipped: Vec<String> = tables
            .iter()
            .filter(|t| t.skipped)
            .map(|t| t.table.clone())
            .collect();

        let sequences = resync_sequences(
            self.target.as_ref(),
            &self.plan,
            &skipped,
            self.config.migration.operation_timeout(),
        )
        .await?;

        Ok((tables, sequences))
    }

    /// Compare source and target row counts for every planned table, then
    /// close both stores.
    pub async fn validate(self) -> Result<ValidationReport> {
        let outcome = self.count_rows().await;
        let closed = self.close().await;
        let report = outcome?;
        closed?;
        Ok(report)
    }

    async fn count_rows(&self) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        for table in &self.plan.tables {
            if table.optional && !self.source.table_exists(table.name).await? {
                continue;
            }

            let count = TableCount {
                table: table.name.to_string(),
                source_rows: self.source.get_row_count(table.name).await?,
                target_rows: self.target.get_row_count(table.name).await?,
            };

            if count.matches() {
                info!("{}: {} rows (match)", count.table, count.source_rows);
            } else {
                warn!(
                    "{}: source={} target={} (MISMATCH)",
                    count.table, count.source_rows, count.target_rows
                );
            }
            report.tables.push(count);
        }

        Ok(report)
    }

    /// Open each store independently and report whether it answers.
    pub async fn health_check(config: &Config) -> Result<HealthCheckResult> {
        config.validate()?;

        let start = Instant::now();
        let source_error = match SqliteReader::open(&config.source).await {
            Ok(source) => {
                let lookup = source.table_exists("scenes").await;
                let closed = source.close().await;
                lookup.and(closed).err().map(|e| e.to_string())
            }
            Err(e) => Some(e.to_string()),
        };
        let source_latency_ms = start.elapsed().as_millis() as u64;

        let start = Instant::now();
        let target_error = match PgWriter::connect(&config.target).await {
            Ok(target) => target.close().await.err().map(|e| e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        let target_latency_ms = start.elapsed().as_millis() as u64;

        Ok(HealthCheckResult {
            healthy: source_error.is_none() && target_error.is_none(),
            source_connected: source_error.is_none(),
            source_latency_ms,
            source_error,
            target_connected: target_error.is_none(),
            target_latency_ms,
            target_error,
        })
    }

    async fn close(&self) -> Result<()> {
        let source = self.source.close().await;
        let target = self.target.close().await;
        if let Err(e) = &source {
            warn!("Failed to close source: {}", e);
        }
        if let Err(e) = &target {
            warn!("Failed to close target: {}", e);
        }
        source.and(target)
    }
}
