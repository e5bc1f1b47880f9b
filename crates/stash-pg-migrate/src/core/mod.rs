//! Core abstractions shared by the stores and the transfer engine.
//!
//! - [`value`]: SQL value and batch representation
//! - [`identifier`]: identifier validation and quoting
//! - [`catalog`]: the table catalog and the migration plan
//! - [`traits`]: source and target store traits

pub mod catalog;
pub mod identifier;
pub mod traits;
pub mod value;

// Re-export commonly used types for convenience
pub use catalog::{MigrationPlan, TableDescriptor, STASH_TABLES};
pub use traits::{SourceReader, TargetWriter};
pub use value::{Batch, SqlValue};
