//! Identifier validation and quoting for generated SQL.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! statement the migration builds splices them in as quoted identifiers.
//! SQLite and PostgreSQL share the standard double-quote syntax.

use crate::error::{MigrateError, Result};

/// PostgreSQL truncates identifiers beyond this many bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier before it is spliced into SQL.
///
/// Rejects empty names, names containing null bytes and names longer than
/// PostgreSQL's identifier limit.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote an identifier with double quotes, doubling embedded quotes.
///
/// ```ignore
/// assert_eq!(quote_ident("tags")?, "\"tags\"");
/// assert_eq!(quote_ident("odd\"name")?, "\"odd\"\"name\"");
/// ```
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
