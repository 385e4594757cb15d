//! Row encodings.
//!
//! Two interchangeable strategies sit behind [`RowCodec`]:
//! - [`HashCodec`] stores each row as a hash with one field per non-null
//!   column, values rendered as strings and parsed back by declared type.
//! - [`BinaryCodec`] stores each row as one string value holding a bincode
//!   [`BlobRecord`] (column names plus typed values).
//!
//! The strategy is picked once per table from [`EncodingModel`].

use redis_protocol::resp2::types::BytesFrame;
use serde::{Deserialize, Serialize};

use crate::config::EncodingModel;
use crate::error::{Result, RowSlotError};
use crate::resp::{frame_bytes, frame_string, is_nil, Command};
use crate::schema::{infer_value, Row, Schema, Value};

/// How a read should be issued and decoded.
#[derive(Debug, Clone, Copy)]
pub struct ReadSpec<'a> {
    /// Target schema for decoded rows; `None` decodes whatever is stored,
    /// inferring types, and is only used to sample a row for inference.
    pub schema: Option<&'a Schema>,
    /// `true` when `schema` is a column subset the caller asked for.
    pub partial: bool,
    /// Fall back to type inference when a value does not fit its column.
    pub infer: bool,
}

impl<'a> ReadSpec<'a> {
    pub fn full(schema: &'a Schema, infer: bool) -> Self {
        Self {
            schema: Some(schema),
            partial: false,
            infer,
        }
    }

    pub fn columns(schema: &'a Schema, infer: bool) -> Self {
        Self {
            schema: Some(schema),
            partial: true,
            infer,
        }
    }

    pub fn sample() -> Self {
        Self {
            schema: None,
            partial: false,
            infer: true,
        }
    }
}

/// One decoded row with the column names its values line up with.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRow {
    pub columns: Vec<String>,
    pub row: Row,
}

/// Encoding strategy for one table.
pub trait RowCodec: Send + Sync {
    fn model(&self) -> EncodingModel;

    /// Commands that store `row` under `key`, including expiry when `ttl > 0`.
    fn write_commands(&self, key: &str, row: &Row, schema: &Schema, ttl: u64) -> Result<Vec<Command>>;

    /// Command reading `key` back.
    fn read_command(&self, key: &str, spec: &ReadSpec<'_>) -> Command;

    /// Decodes the reply to [`RowCodec::read_command`].
    ///
    /// Returns `Ok(None)` when the reply shows the key no longer exists.
    /// Column-subset hash reads cannot tell, and decode such keys as nulls.
    fn decode_reply(
        &self,
        node: &str,
        reply: &BytesFrame,
        spec: &ReadSpec<'_>,
    ) -> Result<Option<DecodedRow>>;
}

/// Picks the codec for `model`.
pub fn codec_for(model: EncodingModel) -> &'static dyn RowCodec {
    match model {
        EncodingModel::Hash => &HashCodec,
        EncodingModel::Binary => &BinaryCodec,
    }
}

/// Flat field-map strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashCodec;

/// Single serialized blob strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl RowCodec for HashCodec {
    fn model(&self) -> EncodingModel {
        EncodingModel::Hash
    }

    fn write_commands(&self, key: &str, row: &Row, schema: &Schema, ttl: u64) -> Result<Vec<Command>> {
        let fields = encode_fields(row, schema);
        // A hash cannot be empty, so an all-null row stores nothing.
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut hset = Command::new("HSET").arg(key);
        for (name, value) in fields {
            hset = hset.arg(name).arg(value);
        }
        let mut commands = vec![hset];
        if ttl > 0 {
            commands.push(Command::new("EXPIRE").arg(key).arg_int(ttl));
        }
        Ok(commands)
    }

    fn read_command(&self, key: &str, spec: &ReadSpec<'_>) -> Command {
        match spec.schema {
            Some(schema) if spec.partial && !schema.is_empty() => {
                let mut hmget = Command::new("HMGET").arg(key);
                for field in schema.fields() {
                    hmget = hmget.arg(&field.name);
                }
                hmget
            }
            _ => Command::new("HGETALL").arg(key),
        }
    }

    fn decode_reply(
        &self,
        node: &str,
        reply: &BytesFrame,
        spec: &ReadSpec<'_>,
    ) -> Result<Option<DecodedRow>> {
        let BytesFrame::Array(items) = reply else {
            return Err(RowSlotError::protocol(node, "expected array reply for hash read"));
        };

        let pairs = match spec.schema {
            Some(schema) if spec.partial && !schema.is_empty() => {
                if items.len() != schema.len() {
                    return Err(RowSlotError::protocol(
                        node,
                        format!(
                            "HMGET returned {} values for {} fields",
                            items.len(),
                            schema.len()
                        ),
                    ));
                }
                // Nulls are never stored, so an all-nil reply is a row whose
                // requested columns are all null.
                let mut pairs = Vec::with_capacity(items.len());
                for (field, item) in schema.fields().iter().zip(items) {
                    if let Some(value) = frame_string(item) {
                        pairs.push((field.name.clone(), value));
                    }
                }
                pairs
            }
            _ => {
                if items.is_empty() {
                    return Ok(None);
                }
                if items.len() % 2 != 0 {
                    return Err(RowSlotError::protocol(node, "HGETALL returned odd item count"));
                }
                let mut pairs = Vec::with_capacity(items.len() / 2);
                for chunk in items.chunks(2) {
                    let name = frame_string(&chunk[0])
                        .ok_or_else(|| RowSlotError::protocol(node, "non-string hash field name"))?;
                    let value = frame_string(&chunk[1])
                        .ok_or_else(|| RowSlotError::protocol(node, "non-string hash field value"))?;
                    pairs.push((name, value));
                }
                pairs
            }
        };

        decode_fields(pairs, spec).map(Some)
    }
}

impl RowCodec for BinaryCodec {
    fn model(&self) -> EncodingModel {
        EncodingModel::Binary
    }

    fn write_commands(&self, key: &str, row: &Row, schema: &Schema, ttl: u64) -> Result<Vec<Command>> {
        let payload = encode_blob(row, schema)?;
        let mut set = Command::new("SET").arg(key).arg_bytes(payload);
        if ttl > 0 {
            set = set.arg("EX").arg_int(ttl);
        }
        Ok(vec![set])
    }

    fn read_command(&self, key: &str, _spec: &ReadSpec<'_>) -> Command {
        // The blob is always read whole; projection happens after decode.
        Command::new("GET").arg(key)
    }

    fn decode_reply(
        &self,
        node: &str,
        reply: &BytesFrame,
        spec: &ReadSpec<'_>,
    ) -> Result<Option<DecodedRow>> {
        if is_nil(reply) {
            return Ok(None);
        }
        let payload = frame_bytes(reply)
            .ok_or_else(|| RowSlotError::protocol(node, "expected bulk string reply for blob read"))?;
        decode_blob(&payload, spec).map(Some)
    }
}

/// Name/string pairs for every non-null column, in schema order.
pub fn encode_fields(row: &Row, schema: &Schema) -> Vec<(String, String)> {
    schema
        .fields()
        .iter()
        .zip(row.values())
        .filter_map(|(field, value)| {
            value
                .to_field_string()
                .map(|text| (field.name.clone(), text))
        })
        .collect()
}

/// Rebuilds a row from stored name/string pairs.
///
/// Columns of the target schema with no stored entry decode as null. Without
/// a target schema every stored field is returned with an inferred type.
pub fn decode_fields(pairs: Vec<(String, String)>, spec: &ReadSpec<'_>) -> Result<DecodedRow> {
    let Some(schema) = spec.schema else {
        let (columns, values): (Vec<_>, Vec<_>) = pairs
            .into_iter()
            .map(|(name, raw)| {
                let value = infer_value(&raw);
                (name, value)
            })
            .unzip();
        return Ok(DecodedRow {
            columns,
            row: Row::new(values),
        });
    };

    let mut values = Vec::with_capacity(schema.len());
    for field in schema.fields() {
        let raw = pairs
            .iter()
            .find(|(name, _)| name == &field.name)
            .map(|(_, raw)| raw.as_str());
        let value = match raw {
            None => Value::Null,
            Some(raw) => match Value::parse_as(raw, field.data_type) {
                Some(value) => value,
                None if spec.infer => infer_value(raw),
                None => {
                    return Err(RowSlotError::SchemaMismatch {
                        column: field.name.clone(),
                        value: raw.to_string(),
                        expected: field.data_type.to_string(),
                    })
                }
            },
        };
        values.push(value);
    }
    Ok(DecodedRow {
        columns: schema.field_names().into_iter().map(str::to_string).collect(),
        row: Row::new(values),
    })
}

/// Serialized form of one row in the binary model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

pub fn encode_blob(row: &Row, schema: &Schema) -> Result<Vec<u8>> {
    let record = BlobRecord {
        columns: schema.field_names().into_iter().map(str::to_string).collect(),
        values: row.values().to_vec(),
    };
    Ok(bincode::serialize(&record)?)
}

/// Decodes a whole blob, then lines values up with the target schema.
pub fn decode_blob(payload: &[u8], spec: &ReadSpec<'_>) -> Result<DecodedRow> {
    let record: BlobRecord = bincode::deserialize(payload)?;
    if record.columns.len() != record.values.len() {
        return Err(RowSlotError::Serialization(format!(
            "row blob has {} columns but {} values",
            record.columns.len(),
            record.values.len()
        )));
    }

    let Some(schema) = spec.schema else {
        return Ok(DecodedRow {
            columns: record.columns,
            row: Row::new(record.values),
        });
    };

    let mut values = Vec::with_capacity(schema.len());
    for field in schema.fields() {
        let stored = record
            .columns
            .iter()
            .position(|name| name == &field.name)
            .map(|idx| record.values[idx].clone())
            .unwrap_or(Value::Null);
        let value = match stored.clone().cast_to(field.data_type) {
            Some(value) => value,
            None if spec.infer => stored,
            None => {
                return Err(RowSlotError::SchemaMismatch {
                    column: field.name.clone(),
                    value: stored.to_string(),
                    expected: field.data_type.to_string(),
                })
            }
        };
        values.push(value);
    }
    Ok(DecodedRow {
        columns: schema.field_names().into_iter().map(str::to_string).collect(),
        row: Row::new(values),
    })
}
