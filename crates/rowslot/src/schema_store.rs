//! Persisted and inferred table schemas.
//!
//! The schema of a named table lives as JSON under
//! [`schema_key`](crate::keys::schema_key), on whichever node owns that key.
//! Saves overwrite; there is no merge with a previously stored schema.

use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::codec::{codec_for, ReadSpec};
use crate::config::EncodingModel;
use crate::error::{Result, RowSlotError};
use crate::keys::schema_key;
use crate::resp::{frame_bytes, is_nil, Command};
use crate::schema::{schema_from_sample, Schema, SchemaRef};

/// Stores `schema` for `table`, replacing any previous record, and hands the
/// saved schema back.
pub async fn save_schema(
    client: &ClusterClient,
    table: &str,
    schema: SchemaRef,
) -> Result<SchemaRef> {
    let key = schema_key(table);
    let payload = serde_json::to_vec(schema.as_ref())?;
    client
        .run_for_key(&key, Command::new("SET").arg(&key).arg_bytes(payload))
        .await?;
    debug!(table, fields = schema.len(), "saved table schema");
    Ok(schema)
}

/// Loads the schema persisted for `table`.
pub async fn load_schema(client: &ClusterClient, table: &str) -> Result<Schema> {
    let key = schema_key(table);
    let reply = client.run_for_key(&key, Command::new("GET").arg(&key)).await?;
    if is_nil(&reply) {
        return Err(RowSlotError::SchemaNotFound {
            table: table.to_string(),
        });
    }
    let payload = frame_bytes(&reply).ok_or_else(|| {
        RowSlotError::Serialization(format!("schema record '{key}' is not a string value"))
    })?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Derives a schema from the first key matching `pattern`.
pub async fn infer_schema(
    client: &ClusterClient,
    pattern: &str,
    model: EncodingModel,
) -> Result<Schema> {
    let empty = || RowSlotError::EmptyTable {
        pattern: pattern.to_string(),
    };
    let keys = client.scan_keys(pattern).await?;
    let first = keys.first().ok_or_else(empty)?;

    let codec = codec_for(model);
    let spec = ReadSpec::sample();
    let addr = client.route(first)?.addr();
    let reply = client
        .run_batch(&addr, vec![codec.read_command(first, &spec)])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| RowSlotError::protocol(&addr, "missing sample reply"))?;
    let decoded = codec.decode_reply(&addr, &reply, &spec)?.ok_or_else(empty)?;
    if decoded.row.values().iter().all(|value| value.is_null()) {
        return Err(empty());
    }

    let schema = schema_from_sample(&decoded.columns, &decoded.row);
    info!(pattern, sample_key = %first, fields = schema.len(), "inferred table schema");
    Ok(schema)
}
