//! Row and schema model shared by the codecs, the schema store, and the
//! relation engine.
//!
//! A [`Schema`] is an ordered list of named, typed fields. A [`Row`] is the
//! positional list of values conforming to some schema; rows never carry
//! their own field names, so a [`RowSet`] pairs them with the schema they
//! were produced under.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RowSlotError};

/// Shared schema handle.
pub type SchemaRef = Arc<Schema>;

/// Scalar column types that survive a store round-trip losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    Utf8,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Boolean => "boolean",
            Self::Utf8 => "utf8",
        };
        f.write_str(name)
    }
}

/// One named column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    /// Builds a nullable field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// Ordered list of fields describing every row of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the position of `name`, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|field| field.name.as_str()).collect()
    }

    /// Restricts the schema to `columns`, in the requested order.
    pub fn project(&self, columns: &[String]) -> Result<Schema> {
        let mut fields = Vec::with_capacity(columns.len());
        for column in columns {
            let idx = self.index_of(column).ok_or_else(|| {
                RowSlotError::config(format!("column '{column}' is not part of the table schema"))
            })?;
            fields.push(self.fields[idx].clone());
        }
        Ok(Schema { fields })
    }
}

/// One scalar cell. `Null` stands for an absent field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Boolean(bool),
    Utf8(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Type of a non-null value.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::Int32(_) => Some(DataType::Int32),
            Self::Int64(_) => Some(DataType::Int64),
            Self::Float32(_) => Some(DataType::Float32),
            Self::Float64(_) => Some(DataType::Float64),
            Self::Boolean(_) => Some(DataType::Boolean),
            Self::Utf8(_) => Some(DataType::Utf8),
        }
    }

    /// String form used for flat-map fields and derived key ids.
    ///
    /// Returns `None` for nulls, which are never written.
    pub fn to_field_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Int32(v) => Some(v.to_string()),
            Self::Int64(v) => Some(v.to_string()),
            Self::Float32(v) => Some(v.to_string()),
            Self::Float64(v) => Some(v.to_string()),
            Self::Boolean(v) => Some(v.to_string()),
            Self::Utf8(v) => Some(v.clone()),
        }
    }

    /// Parses a stored string as `data_type`.
    pub fn parse_as(raw: &str, data_type: DataType) -> Option<Value> {
        match data_type {
            DataType::Int32 => raw.parse().ok().map(Value::Int32),
            DataType::Int64 => raw.parse().ok().map(Value::Int64),
            DataType::Float32 => raw.parse().ok().map(Value::Float32),
            DataType::Float64 => raw.parse().ok().map(Value::Float64),
            DataType::Boolean => raw.parse().ok().map(Value::Boolean),
            DataType::Utf8 => Some(Value::Utf8(raw.to_string())),
        }
    }

    /// Converts an already-typed value into `data_type` without loss.
    ///
    /// Widening between integer and float widths is accepted; anything that
    /// would change the value's meaning is not.
    pub fn cast_to(self, data_type: DataType) -> Option<Value> {
        match (self, data_type) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Int32(v), DataType::Int32) => Some(Value::Int32(v)),
            (Value::Int32(v), DataType::Int64) => Some(Value::Int64(v.into())),
            (Value::Int64(v), DataType::Int64) => Some(Value::Int64(v)),
            (Value::Int64(v), DataType::Int32) => i32::try_from(v).ok().map(Value::Int32),
            (Value::Float32(v), DataType::Float32) => Some(Value::Float32(v)),
            (Value::Float32(v), DataType::Float64) => Some(Value::Float64(v.into())),
            (Value::Float64(v), DataType::Float64) => Some(Value::Float64(v)),
            (Value::Int32(v), DataType::Float64) => Some(Value::Float64(v.into())),
            (Value::Boolean(v), DataType::Boolean) => Some(Value::Boolean(v)),
            (Value::Utf8(v), DataType::Utf8) => Some(Value::Utf8(v)),
            (other, DataType::Utf8) => other.to_field_string().map(Value::Utf8),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_field_string() {
            Some(text) => f.write_str(&text),
            None => f.write_str("null"),
        }
    }
}

/// Infers the narrowest type for a stored string.
///
/// Precedence is integer, then float, then boolean, then string.
pub fn infer_type(raw: &str) -> DataType {
    if raw.parse::<i64>().is_ok() {
        DataType::Int64
    } else if looks_decimal(raw) && raw.parse::<f64>().is_ok() {
        DataType::Float64
    } else if raw == "true" || raw == "false" {
        DataType::Boolean
    } else {
        DataType::Utf8
    }
}

/// Parses a stored string using [`infer_type`].
pub fn infer_value(raw: &str) -> Value {
    let data_type = infer_type(raw);
    Value::parse_as(raw, data_type).unwrap_or_else(|| Value::Utf8(raw.to_string()))
}

/// Rejects `inf`, `NaN`, and friends, which `f64::from_str` accepts.
fn looks_decimal(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
}

/// Positional values of one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Row with zero columns, used when a scan projects nothing.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Rows paired with the schema they conform to.
#[derive(Debug, Clone)]
pub struct RowSet {
    pub schema: SchemaRef,
    pub rows: Vec<Row>,
}

impl RowSet {
    /// Validates that every row has one value per schema field.
    pub fn try_new(schema: SchemaRef, rows: Vec<Row>) -> Result<Self> {
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != schema.len())
        {
            return Err(RowSlotError::config(format!(
                "row {idx} has {} values but schema has {} fields",
                row.len(),
                schema.len()
            )));
        }
        Ok(Self { schema, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Derives a schema from one decoded sample.
pub fn schema_from_sample(names: &[String], row: &Row) -> Schema {
    let fields = names
        .iter()
        .zip(row.values())
        .map(|(name, value)| Field::new(name.clone(), value.data_type().unwrap_or(DataType::Utf8)))
        .collect();
    Schema { fields }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_type_prefers_integer_then_float_then_boolean() {
        assert_eq!(infer_type("42"), DataType::Int64);
        assert_eq!(infer_type("-7"), DataType::Int64);
        assert_eq!(infer_type("4.25"), DataType::Float64);
        assert_eq!(infer_type("1e3"), DataType::Float64);
        assert_eq!(infer_type("true"), DataType::Boolean);
        assert_eq!(infer_type("false"), DataType::Boolean);
        assert_eq!(infer_type("True"), DataType::Utf8);
        assert_eq!(infer_type("NaN"), DataType::Utf8);
        assert_eq!(infer_type("inf"), DataType::Utf8);
        assert_eq!(infer_type(""), DataType::Utf8);
        assert_eq!(infer_type("alice"), DataType::Utf8);
    }

    #[test]
    fn infer_value_parses_with_inferred_type() {
        assert_eq!(infer_value("12"), Value::Int64(12));
        assert_eq!(infer_value("0.5"), Value::Float64(0.5));
        assert_eq!(infer_value("true"), Value::Boolean(true));
        assert_eq!(infer_value("x1"), Value::Utf8("x1".to_string()));
    }

    #[test]
    fn cast_widens_but_rejects_lossy_conversions() {
        assert_eq!(Value::Int32(3).cast_to(DataType::Int64), Some(Value::Int64(3)));
        assert_eq!(Value::Int64(3).cast_to(DataType::Int32), Some(Value::Int32(3)));
        assert_eq!(Value::Int64(i64::MAX).cast_to(DataType::Int32), None);
        assert_eq!(Value::Boolean(true).cast_to(DataType::Int64), None);
        assert_eq!(
            Value::Int64(9).cast_to(DataType::Utf8),
            Some(Value::Utf8("9".to_string()))
        );
    }

    #[test]
    fn project_keeps_requested_order_and_rejects_unknown_columns() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64),
            Field::new("name", DataType::Utf8),
            Field::new("score", DataType::Float64),
        ]);
        let projected = schema
            .project(&["score".to_string(), "id".to_string()])
            .expect("projection should succeed");
        assert_eq!(projected.field_names(), vec!["score", "id"]);

        let err = schema
            .project(&["missing".to_string()])
            .expect_err("unknown column should fail");
        assert!(matches!(err, RowSlotError::Configuration(_)));
    }

    #[test]
    fn row_set_rejects_ragged_rows() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64)]));
        let err = RowSet::try_new(
            schema,
            vec![Row::new(vec![Value::Int64(1), Value::Null])],
        )
        .expect_err("ragged row should fail");
        assert!(err.to_string().contains("row 0"));
    }

    #[test]
    fn schema_json_is_stable() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Utf8),
            Field::new("age", DataType::Int32),
        ]);
        let json = serde_json::to_string(&schema).expect("encode schema");
        assert_eq!(
            json,
            r#"{"fields":[{"name":"id","data_type":"utf8","nullable":true},{"name":"age","data_type":"int32","nullable":true}]}"#
        );
        let back: Schema = serde_json::from_str(&json).expect("decode schema");
        assert_eq!(back, schema);
    }
}
