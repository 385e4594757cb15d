//! Error taxonomy for the rowslot data-access engine.
//!
//! Every variant is fatal for the operation that raised it. Nothing in this
//! crate retries or salvages partial results; callers decide whether to
//! refresh topology and rerun the whole operation.

use thiserror::Error;

/// Errors surfaced by rowslot operations.
#[derive(Debug, Error)]
pub enum RowSlotError {
    /// Table identity, option values, or per-row key material are invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No persisted schema exists and the caller neither declared one nor
    /// enabled inference.
    #[error(
        "schema for table '{table}' not found; declare a schema explicitly or set infer.schema=true"
    )]
    SchemaNotFound { table: String },

    /// Inference was requested but nothing matched the key pattern, or the
    /// sampled row had no decodable value.
    #[error("cannot infer schema: no rows found for keys matching '{pattern}'")]
    EmptyTable { pattern: String },

    /// Cluster topology has no node owning the key's hash slot.
    #[error("no cluster node owns slot {slot} for key '{key}'; topology is stale or unreachable")]
    Routing { key: String, slot: u16 },

    /// A stored value cannot be coerced to its declared column type.
    #[error("column '{column}' value '{value}' cannot be read as {expected}")]
    SchemaMismatch {
        column: String,
        value: String,
        expected: String,
    },

    /// A node returned an error reply or a reply of an unexpected shape.
    #[error("protocol error from {node}: {message}")]
    Protocol { node: String, message: String },

    /// Schema descriptor or blob payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Connection failures and timeouts.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RowSlotError {
    /// Shorthand for [`RowSlotError::Configuration`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Shorthand for [`RowSlotError::Protocol`].
    pub fn protocol(node: impl ToString, message: impl Into<String>) -> Self {
        Self::Protocol {
            node: node.to_string(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for RowSlotError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("schema json: {err}"))
    }
}

impl From<bincode::Error> for RowSlotError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(format!("row blob: {err}"))
    }
}

/// Result type for rowslot operations.
pub type Result<T> = std::result::Result<T, RowSlotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_not_found_names_table_and_remedies() {
        let msg = RowSlotError::SchemaNotFound {
            table: "person".to_string(),
        }
        .to_string();
        assert!(msg.contains("'person'"));
        assert!(msg.contains("infer.schema"));
    }
}
