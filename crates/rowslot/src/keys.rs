//! Key layout for rows and for the persisted schema record.

use crate::error::{Result, RowSlotError};
use crate::schema::{Row, Schema};

/// Prefix of the per-table schema record key.
const SCHEMA_KEY_PREFIX: &str = "_spark";

/// Derives the store key `<table>:<id>` for one row.
///
/// With a key column the id is that column's string form; otherwise it is a
/// fresh 128-bit random token rendered as 32 hex characters.
pub fn derive_key(
    row: &Row,
    schema: &Schema,
    key_column: Option<&str>,
    table: &str,
) -> Result<String> {
    let id = match key_column {
        Some(column) => {
            let idx = schema.index_of(column).ok_or_else(|| {
                RowSlotError::config(format!(
                    "key column '{column}' is not present in the written rows"
                ))
            })?;
            row.get(idx)
                .and_then(|value| value.to_field_string())
                .ok_or_else(|| {
                    RowSlotError::config(format!("key column '{column}' is null or missing"))
                })?
        }
        None => random_id(),
    };
    Ok(format!("{table}:{id}"))
}

/// Random, separator-free row id.
pub fn random_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Glob enumerating every row key of `table`.
pub fn table_pattern(table: &str) -> String {
    format!("{table}:*")
}

/// Key holding the serialized schema of `table`.
pub fn schema_key(table: &str) -> String {
    format!("{SCHEMA_KEY_PREFIX}:{table}:schema")
}
