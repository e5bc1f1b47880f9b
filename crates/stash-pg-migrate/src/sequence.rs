//! Sequence resynchronization after the bulk load.
//!
//! Rows are inserted with their original ids, which leaves each serial
//! sequence at its start value. Once every table is loaded the sequences of
//! the tables with integer surrogate keys are moved past the largest id.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::catalog::MigrationPlan;
use crate::core::traits::TargetWriter;
use crate::error::Result;
use crate::transfer::with_timeout;

/// The value a table's sequence will hand out next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReset {
    pub table: String,
    pub next_value: i64,
}

/// Reset the sequence of every planned table marked for resynchronization,
/// leaving out `skipped` tables. All resets share one transaction.
pub async fn resync_sequences(
    target: &dyn TargetWriter,
    plan: &MigrationPlan,
    skipped: &[String],
    timeout: Option<Duration>,
) -> Result<Vec<SequenceReset>> {
    let tables: Vec<&str> = plan
        .sequence_tables()
        .map(|t| t.name)
        .filter(|name| !skipped.iter().any(|s| s == name))
        .collect();

    if tables.is_empty() {
        return Ok(Vec::new());
    }

    let values = with_timeout(
        timeout,
        || "resetting sequences".to_string(),
        target.reset_sequences(&tables),
    )
    .await?;

    Ok(values
        .into_iter()
        .map(|(table, next_value)| {
            info!("Resetting sequence for {}: next id {}", table, next_value);
            SequenceReset { table, next_value }
        })
        .collect())
}
