//! # stash-pg-migrate
//!
//! One-time migration of a stash SQLite database into PostgreSQL.
//!
//! The destination schema must already exist. Every table is copied in
//! dependency order, page by page:
//!
//! - **Paged reads** from one consistent SQLite snapshot
//! - **Repair rules** that make source values acceptable to PostgreSQL
//! - **Per-page transactions** with multi-row INSERTs
//! - **Sequence resync** so new rows get ids past the migrated ones
//!
//! ## Example
//!
//! ```rust,no_run
//! use stash_pg_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> stash_pg_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run().await?;
//!     println!("Migrated {} rows", result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod orchestrator;
pub mod repair;
pub mod sequence;
pub mod source;
pub mod target;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use crate::core::{Batch, MigrationPlan, SourceReader, SqlValue, TableDescriptor, TargetWriter};
pub use error::{MigrateError, Result};
pub use orchestrator::{HealthCheckResult, MigrationResult, Orchestrator, ValidationReport};
pub use repair::{Repair, RepairReport, RepairRule};
pub use sequence::SequenceReset;
pub use source::SqliteReader;
pub use target::PgWriter;
pub use transfer::{TableStats, TransferConfig, TransferEngine};
