use std::sync::Arc;

use apache_avro::types::Value;
use arrow::array::{Array, ArrayRef, AsArray, Int32Array, ListArray};
use arrow::buffer::OffsetBuffer;
use arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    UInt16Type, UInt32Type, UInt8Type,
};
use arrow::error::ArrowError;

use crate::avro::writer::EncodeError;

/// One materialized column.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Fixed typed array.
    Array(ArrayRef),
    /// Generic per-row values, for leaf types with no typed array form.
    Values(Vec<Value>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Array(array) => array.len(),
            Column::Values(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Column::Array(array) => Some(array),
            Column::Values(_) => None,
        }
    }

    pub fn as_values(&self) -> Option<&[Value]> {
        match self {
            Column::Array(_) => None,
            Column::Values(values) => Some(values),
        }
    }

    /// Normalize to one Avro value per row. Typed nulls become `Value::Null`.
    pub fn into_values(self) -> Result<Vec<Value>, EncodeError> {
        match self {
            Column::Values(values) => Ok(values),
            Column::Array(array) => array_values(array.as_ref()),
        }
    }
}

impl From<ArrayRef> for Column {
    fn from(array: ArrayRef) -> Self {
        Column::Array(array)
    }
}

impl From<Vec<Value>> for Column {
    fn from(values: Vec<Value>) -> Self {
        Column::Values(values)
    }
}

fn collect<T>(iter: impl Iterator<Item = Option<T>>, f: impl Fn(T) -> Value) -> Vec<Value> {
    iter.map(|v| v.map(&f).unwrap_or(Value::Null)).collect()
}

fn array_values(array: &dyn Array) -> Result<Vec<Value>, EncodeError> {
    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; array.len()],
        DataType::Boolean => collect(array.as_boolean().iter(), Value::Boolean),
        DataType::Int8 => collect(array.as_primitive::<Int8Type>().iter(), |v| {
            Value::Int(v.into())
        }),
        DataType::Int16 => collect(array.as_primitive::<Int16Type>().iter(), |v| {
            Value::Int(v.into())
        }),
        DataType::Int32 => collect(array.as_primitive::<Int32Type>().iter(), Value::Int),
        DataType::Int64 => collect(array.as_primitive::<Int64Type>().iter(), Value::Long),
        DataType::UInt8 => collect(array.as_primitive::<UInt8Type>().iter(), |v| {
            Value::Int(v.into())
        }),
        DataType::UInt16 => collect(array.as_primitive::<UInt16Type>().iter(), |v| {
            Value::Int(v.into())
        }),
        DataType::UInt32 => collect(array.as_primitive::<UInt32Type>().iter(), |v| {
            Value::Long(v.into())
        }),
        DataType::Float32 => collect(array.as_primitive::<Float32Type>().iter(), Value::Float),
        DataType::Float64 => collect(array.as_primitive::<Float64Type>().iter(), Value::Double),
        DataType::Utf8 => collect(array.as_string::<i32>().iter(), |v| {
            Value::String(v.to_string())
        }),
        DataType::LargeUtf8 => collect(array.as_string::<i64>().iter(), |v| {
            Value::String(v.to_string())
        }),
        DataType::Binary => collect(array.as_binary::<i32>().iter(), |v| Value::Bytes(v.to_vec())),
        DataType::LargeBinary => collect(array.as_binary::<i64>().iter(), |v| {
            Value::Bytes(v.to_vec())
        }),
        DataType::List(_) => list_values(array.as_list::<i32>().iter())?,
        DataType::LargeList(_) => list_values(array.as_list::<i64>().iter())?,
        other => return Err(EncodeError::UnsupportedArrowType(other.clone())),
    };
    Ok(values)
}

fn list_values(rows: impl Iterator<Item = Option<ArrayRef>>) -> Result<Vec<Value>, EncodeError> {
    rows.map(|row| match row {
        Some(items) => Ok(Value::Array(array_values(items.as_ref())?)),
        None => Ok(Value::Null),
    })
    .collect()
}

/// Splice a flattened repeated column back into one list per source record.
///
/// `group_lengths` must sum to the length of `values`.
pub fn regroup(values: ArrayRef, group_lengths: &Int32Array) -> Result<ListArray, ArrowError> {
    let mut lengths = Vec::with_capacity(group_lengths.len());
    let mut total = 0usize;
    for length in group_lengths.iter() {
        let length = usize::try_from(length.unwrap_or(0)).map_err(|_| {
            ArrowError::InvalidArgumentError("negative group length".to_string())
        })?;
        total += length;
        lengths.push(length);
    }
    if total != values.len() {
        return Err(ArrowError::InvalidArgumentError(format!(
            "group lengths sum to {total} but the column has {} values",
            values.len()
        )));
    }

    let field = Arc::new(Field::new("item", values.data_type().clone(), true));
    ListArray::try_new(field, OffsetBuffer::from_lengths(lengths), values, None)
}
