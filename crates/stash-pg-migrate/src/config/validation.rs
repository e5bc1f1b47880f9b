//! Configuration validation.

use super::Config;
use crate::core::catalog::find_table;
use crate::error::{MigrateError, Result};
use crate::target::tls::SslMode;
use crate::target::MAX_STATEMENT_TIMEOUT_SECS;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.path.trim().is_empty() {
        return Err(MigrateError::Config("source.path is required".into()));
    }

    // Target validation
    if config.target.url.trim().is_empty() {
        return Err(MigrateError::Config("target.url is required".into()));
    }
    if config.target.connect_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "target.connect_timeout_secs must be at least 1".into(),
        ));
    }

    if let Some(secs) = config.target.statement_timeout_secs {
        if secs > MAX_STATEMENT_TIMEOUT_SECS {
            return Err(MigrateError::Config(format!(
                "target.statement_timeout_secs must be at most {}",
                MAX_STATEMENT_TIMEOUT_SECS
            )));
        }
    }

    if let Some(mode) = &config.target.ssl_mode {
        SslMode::parse(mode)?;
    }

    // Migration config validation
    if config.migration.page_size == 0 {
        return Err(MigrateError::Config(
            "migration.page_size must be at least 1".into(),
        ));
    }

    for name in config
        .migration
        .include_tables
        .iter()
        .chain(&config.migration.exclude_tables)
    {
        if find_table(name).is_none() {
            return Err(MigrateError::Config(format!("unknown table '{}'", name)));
        }
    }

    Ok(())
}
