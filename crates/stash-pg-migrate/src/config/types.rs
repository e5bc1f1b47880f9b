//! Configuration type definitions.

use serde::{Deserialize, Serialize};

use crate::core::catalog::DEFAULT_PAGE_SIZE;

/// Root configuration structure.
///
/// Every section has defaults so a config file may carry only the parts it
/// cares about; connection parameters missing from the file are supplied by
/// CLI flags or prompted for on stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Source database (SQLite) configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Target database (PostgreSQL) configuration.
    #[serde(default)]
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Source database (SQLite) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Path to the SQLite database file.
    #[serde(default)]
    pub path: String,

    /// How long SQLite waits on a locked database before failing (default: 50ms).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Connection string, either a `postgres://` URL or `key=value` pairs.
    #[serde(default)]
    pub url: String,

    /// Seconds to wait for the TCP connection (default: 30).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Server-side `statement_timeout` for the session. Unset leaves the
    /// server default in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_timeout_secs: Option<u64>,

    /// TLS mode: disable, prefer, require, verify-ca or verify-full.
    /// Unset takes `sslmode` from the connection string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            statement_timeout_secs: None,
            ssl_mode: None,
        }
    }
}

impl std::fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConfig")
            .field("url", &super::redact_connection_string(&self.url))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows fetched per page and written per transaction (default: 1000).
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Overlap fetching the next page with writing the current one.
    #[serde(default)]
    pub read_ahead: bool,

    /// Upper bound for a single fetch, write or sequence reset in seconds.
    /// Zero disables the limit (default: 300).
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Tables to migrate. Empty means the whole catalog.
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to leave out.
    #[serde(default)]
    pub exclude_tables: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            read_ahead: false,
            operation_timeout_secs: default_operation_timeout_secs(),
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
        }
    }
}

impl MigrationConfig {
    /// The per-operation limit, or `None` when disabled.
    pub fn operation_timeout(&self) -> Option<std::time::Duration> {
        match self.operation_timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}

// Default value functions for serde
fn default_busy_timeout_ms() -> u64 {
    50
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_operation_timeout_secs() -> u64 {
    300
}
