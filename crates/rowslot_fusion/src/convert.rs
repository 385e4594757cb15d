//! Conversions between rowslot rows and Arrow record batches.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use datafusion::arrow::array::{
    ArrayRef, BooleanBuilder, Float32Builder, Float64Builder, Int32Builder, Int64Builder,
    StringBuilder,
};
use datafusion::arrow::datatypes::{
    DataType as ArrowType, Field as ArrowField, Schema as ArrowSchema, SchemaRef as ArrowSchemaRef,
};
use datafusion::arrow::record_batch::{RecordBatch, RecordBatchOptions};
use datafusion::common::ScalarValue;
use rowslot::{DataType, Field, Row, Schema, Value};

pub fn arrow_type(data_type: DataType) -> ArrowType {
    match data_type {
        DataType::Int32 => ArrowType::Int32,
        DataType::Int64 => ArrowType::Int64,
        DataType::Float32 => ArrowType::Float32,
        DataType::Float64 => ArrowType::Float64,
        DataType::Boolean => ArrowType::Boolean,
        DataType::Utf8 => ArrowType::Utf8,
    }
}

pub fn arrow_schema(schema: &Schema) -> ArrowSchemaRef {
    Arc::new(ArrowSchema::new(
        schema
            .fields()
            .iter()
            .map(|field| ArrowField::new(&field.name, arrow_type(field.data_type), field.nullable))
            .collect::<Vec<_>>(),
    ))
}

/// Rowslot schema for an Arrow schema; only the six stored types map.
pub fn rowslot_schema(schema: &ArrowSchema) -> Result<Schema> {
    let mut fields = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let data_type = match field.data_type() {
            ArrowType::Int32 => DataType::Int32,
            ArrowType::Int64 => DataType::Int64,
            ArrowType::Float32 => DataType::Float32,
            ArrowType::Float64 => DataType::Float64,
            ArrowType::Boolean => DataType::Boolean,
            ArrowType::Utf8 | ArrowType::LargeUtf8 | ArrowType::Utf8View => DataType::Utf8,
            other => {
                return Err(anyhow!(
                    "column '{}' has unsupported type {other}",
                    field.name()
                ))
            }
        };
        fields.push(Field {
            name: field.name().clone(),
            data_type,
            nullable: field.is_nullable(),
        });
    }
    Ok(Schema::new(fields))
}

/// Builds one batch from rows laid out in `schema` order.
///
/// A schema without columns produces a batch that only carries the row count.
pub fn rows_to_batch(schema: ArrowSchemaRef, rows: &[Row]) -> Result<RecordBatch> {
    if schema.fields().is_empty() {
        let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
        return Ok(RecordBatch::try_new_with_options(schema, Vec::new(), &options)?);
    }

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (idx, field) in schema.fields().iter().enumerate() {
        let cells = rows.iter().map(|row| row.get(idx).cloned().unwrap_or(Value::Null));
        let array: ArrayRef = match field.data_type() {
            ArrowType::Int32 => {
                let mut builder = Int32Builder::with_capacity(rows.len());
                for cell in cells {
                    match coerce(cell, DataType::Int32, field.name())? {
                        Value::Int32(v) => builder.append_value(v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ArrowType::Int64 => {
                let mut builder = Int64Builder::with_capacity(rows.len());
                for cell in cells {
                    match coerce(cell, DataType::Int64, field.name())? {
                        Value::Int64(v) => builder.append_value(v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ArrowType::Float32 => {
                let mut builder = Float32Builder::with_capacity(rows.len());
                for cell in cells {
                    match coerce(cell, DataType::Float32, field.name())? {
                        Value::Float32(v) => builder.append_value(v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ArrowType::Float64 => {
                let mut builder = Float64Builder::with_capacity(rows.len());
                for cell in cells {
                    match coerce(cell, DataType::Float64, field.name())? {
                        Value::Float64(v) => builder.append_value(v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ArrowType::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(rows.len());
                for cell in cells {
                    match coerce(cell, DataType::Boolean, field.name())? {
                        Value::Boolean(v) => builder.append_value(v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            ArrowType::Utf8 => {
                let mut builder = StringBuilder::new();
                for cell in cells {
                    match coerce(cell, DataType::Utf8, field.name())? {
                        Value::Utf8(v) => builder.append_value(v),
                        _ => builder.append_null(),
                    }
                }
                Arc::new(builder.finish())
            }
            other => return Err(anyhow!("cannot build column of type {other}")),
        };
        arrays.push(array);
    }
    Ok(RecordBatch::try_new(schema, arrays)?)
}

// Values read with inference on may not match the declared column type; a
// text column still renders them, anything else is an error.
fn coerce(value: Value, data_type: DataType, column: &str) -> Result<Value> {
    let shown = value.to_string();
    value
        .cast_to(data_type)
        .ok_or_else(|| anyhow!("column '{column}' value '{shown}' is not {data_type}"))
}

/// Rows of `batch`, lined up with `schema` by column name.
pub fn batch_to_rows(batch: &RecordBatch, schema: &Schema) -> Result<Vec<Row>> {
    let batch_schema = batch.schema();
    let mut inputs = Vec::with_capacity(schema.len());
    for field in schema.fields() {
        inputs.push(batch_schema.index_of(&field.name).ok());
    }

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row_idx in 0..batch.num_rows() {
        let mut values = Vec::with_capacity(schema.len());
        for (field, input) in schema.fields().iter().zip(&inputs) {
            let Some(input) = input else {
                values.push(Value::Null);
                continue;
            };
            let scalar = ScalarValue::try_from_array(batch.column(*input).as_ref(), row_idx)?;
            values.push(coerce(scalar_to_value(scalar)?, field.data_type, &field.name)?);
        }
        rows.push(Row::new(values));
    }
    Ok(rows)
}

fn scalar_to_value(scalar: ScalarValue) -> Result<Value> {
    Ok(match scalar {
        ScalarValue::Null => Value::Null,
        ScalarValue::Int32(v) => v.map_or(Value::Null, Value::Int32),
        ScalarValue::Int64(v) => v.map_or(Value::Null, Value::Int64),
        ScalarValue::Float32(v) => v.map_or(Value::Null, Value::Float32),
        ScalarValue::Float64(v) => v.map_or(Value::Null, Value::Float64),
        ScalarValue::Boolean(v) => v.map_or(Value::Null, Value::Boolean),
        ScalarValue::Utf8(v) | ScalarValue::LargeUtf8(v) | ScalarValue::Utf8View(v) => {
            v.map_or(Value::Null, Value::Utf8)
        }
        other => return Err(anyhow!("unsupported insert value {other:?}")),
    })
}
