use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Float32Builder, Float64Builder, Int32Array,
    Int32Builder, Int64Builder, StringBuilder,
};
use std::sync::Arc;

use apache_avro::types::Value;

use crate::avro::reader::DecodeError;
use crate::avro::schema::{strip_union, value_kind, LeafField, LeafType};
use crate::columnar::Column;

/// How absent values in fixed-width numeric columns are materialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NullPolicy {
    /// Booleans become `false`, floats become `f32::MAX`, and a null int,
    /// long or double is a decode error. Strings and bytes keep their nulls.
    #[default]
    Sentinel,
    /// Every column keeps nulls in its validity bitmap.
    Validity,
}

/// A dynamic builder that appends decoded Avro values to one typed array.
enum LeafBuilder {
    Boolean(BooleanBuilder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    Float32(Float32Builder),
    Float64(Float64Builder),
    Binary(BinaryBuilder),
    String(StringBuilder),
    /// Pass-through for leaf types with no fixed array form.
    Values(Vec<Value>),
}

impl LeafBuilder {
    fn new(leaf_type: LeafType) -> Self {
        match leaf_type {
            LeafType::Boolean => LeafBuilder::Boolean(BooleanBuilder::new()),
            LeafType::Int => LeafBuilder::Int32(Int32Builder::new()),
            LeafType::Long => LeafBuilder::Int64(Int64Builder::new()),
            LeafType::Float => LeafBuilder::Float32(Float32Builder::new()),
            LeafType::Double => LeafBuilder::Float64(Float64Builder::new()),
            LeafType::Bytes => LeafBuilder::Binary(BinaryBuilder::new()),
            LeafType::String => LeafBuilder::String(StringBuilder::new()),
            LeafType::Other(_) => LeafBuilder::Values(Vec::new()),
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            LeafBuilder::Boolean(_) => "boolean",
            LeafBuilder::Int32(_) => "int",
            LeafBuilder::Int64(_) => "long",
            LeafBuilder::Float32(_) => "float",
            LeafBuilder::Float64(_) => "double",
            LeafBuilder::Binary(_) => "bytes",
            LeafBuilder::String(_) => "string",
            LeafBuilder::Values(_) => "any",
        }
    }

    /// Append one value, already stripped of its union wrapper.
    fn append(
        &mut self,
        field: &str,
        value: &Value,
        policy: NullPolicy,
    ) -> Result<(), DecodeError> {
        match (self, value) {
            (LeafBuilder::Values(values), v) => values.push(v.clone()),
            (LeafBuilder::Boolean(b), Value::Boolean(v)) => b.append_value(*v),
            (LeafBuilder::Int32(b), Value::Int(v)) => b.append_value(*v),
            (LeafBuilder::Int64(b), Value::Long(v)) => b.append_value(*v),
            (LeafBuilder::Float32(b), Value::Float(v)) => b.append_value(*v),
            (LeafBuilder::Float64(b), Value::Double(v)) => b.append_value(*v),
            (LeafBuilder::Binary(b), Value::Bytes(v)) => b.append_value(v),
            (LeafBuilder::String(b), Value::String(v) | Value::Enum(_, v)) => b.append_value(v),
            (builder, Value::Null) => builder.append_null(field, policy)?,
            (builder, other) => {
                return Err(DecodeError::TypeMismatch {
                    field: field.to_string(),
                    expected: builder.expected().to_string(),
                    got: value_kind(other),
                })
            }
        }
        Ok(())
    }

    fn append_null(&mut self, field: &str, policy: NullPolicy) -> Result<(), DecodeError> {
        let unexpected = || DecodeError::UnexpectedNull {
            field: field.to_string(),
        };
        match (self, policy) {
            (LeafBuilder::Values(values), _) => values.push(Value::Null),
            (LeafBuilder::Binary(b), _) => b.append_null(),
            (LeafBuilder::String(b), _) => b.append_null(),
            (LeafBuilder::Boolean(b), NullPolicy::Validity) => b.append_null(),
            (LeafBuilder::Int32(b), NullPolicy::Validity) => b.append_null(),
            (LeafBuilder::Int64(b), NullPolicy::Validity) => b.append_null(),
            (LeafBuilder::Float32(b), NullPolicy::Validity) => b.append_null(),
            (LeafBuilder::Float64(b), NullPolicy::Validity) => b.append_null(),
            (LeafBuilder::Boolean(b), NullPolicy::Sentinel) => b.append_value(false),
            (LeafBuilder::Float32(b), NullPolicy::Sentinel) => b.append_value(f32::MAX),
            (
                LeafBuilder::Int32(_) | LeafBuilder::Int64(_) | LeafBuilder::Float64(_),
                NullPolicy::Sentinel,
            ) => return Err(unexpected()),
        }
        Ok(())
    }

    fn finish(self) -> Column {
        let array: ArrayRef = match self {
            LeafBuilder::Values(values) => return Column::Values(values),
            LeafBuilder::Boolean(mut b) => Arc::new(b.finish()),
            LeafBuilder::Int32(mut b) => Arc::new(b.finish()),
            LeafBuilder::Int64(mut b) => Arc::new(b.finish()),
            LeafBuilder::Float32(mut b) => Arc::new(b.finish()),
            LeafBuilder::Float64(mut b) => Arc::new(b.finish()),
            LeafBuilder::Binary(mut b) => Arc::new(b.finish()),
            LeafBuilder::String(mut b) => Arc::new(b.finish()),
        };
        Column::Array(array)
    }
}

/// Accumulates one leaf field across rows.
///
/// Repeated fields also record one group length per row: the number of
/// elements that row contributed.
pub struct ColumnBuffer {
    field: String,
    values: LeafBuilder,
    group_lengths: Option<Int32Builder>,
    policy: NullPolicy,
}

impl ColumnBuffer {
    pub fn new(field: &LeafField, policy: NullPolicy) -> Self {
        Self {
            field: field.qualified_name(),
            values: LeafBuilder::new(field.leaf_type),
            group_lengths: field.repeated.then(Int32Builder::new),
            policy,
        }
    }

    /// Append the single value of a non-repeated field. `None` is treated
    /// as null.
    pub fn append(&mut self, value: Option<&Value>) -> Result<(), DecodeError> {
        let value = value.map(strip_union).unwrap_or(&Value::Null);
        self.values.append(&self.field, value, self.policy)
    }

    /// Append every element of an array-valued field and record its length.
    /// A null array contributes no elements.
    pub fn append_repeated(&mut self, value: Option<&Value>) -> Result<(), DecodeError> {
        let count = match value.map(strip_union) {
            None | Some(Value::Null) => 0,
            Some(Value::Array(items)) => {
                for item in items {
                    self.values
                        .append(&self.field, strip_union(item), self.policy)?;
                }
                items.len()
            }
            Some(other) => {
                return Err(DecodeError::ExpectedArray {
                    field: self.field.clone(),
                    got: value_kind(other),
                })
            }
        };
        if let Some(lengths) = &mut self.group_lengths {
            lengths.append_value(count as i32);
        }
        Ok(())
    }

    /// Convert the buffered values to their final column, plus the group
    /// lengths for repeated fields.
    pub fn finish(self) -> (Column, Option<Int32Array>) {
        let lengths = self.group_lengths.map(|mut b| b.finish());
        (self.values.finish(), lengths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apache_avro::Schema;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Float32Type, Int32Type, Int64Type};

    use crate::avro::schema::flatten;

    fn field(type_json: &str) -> LeafField {
        let schema = Schema::parse_str(&format!(
            r#"{{"type":"record","name":"r","fields":[{{"name":"f","type":{type_json}}}]}}"#
        ))
        .unwrap();
        flatten(&schema).unwrap().remove(0)
    }

    fn array(column: &Column) -> &ArrayRef {
        column.as_array().expect("typed column")
    }

    mod scalars {
        use super::*;

        #[test]
        fn test_int_column() {
            let mut buffer = ColumnBuffer::new(&field(r#""int""#), NullPolicy::Sentinel);
            buffer.append(Some(&Value::Int(1))).unwrap();
            buffer.append(Some(&Value::Int(2))).unwrap();
            let (column, lengths) = buffer.finish();
            assert!(lengths.is_none());
            let values = array(&column).as_primitive::<Int32Type>();
            assert_eq!(values.values().to_vec(), vec![1, 2]);
        }

        #[test]
        fn test_union_wrapped_values_are_unwrapped() {
            let mut buffer = ColumnBuffer::new(&field(r#"["null","long"]"#), NullPolicy::Sentinel);
            buffer
                .append(Some(&Value::Union(1, Box::new(Value::Long(9)))))
                .unwrap();
            let (column, _) = buffer.finish();
            assert_eq!(array(&column).as_primitive::<Int64Type>().value(0), 9);
        }

        #[test]
        fn test_enum_symbol_becomes_string() {
            let mut buffer = ColumnBuffer::new(
                &field(r#"{"type":"enum","name":"E","symbols":["A","B"]}"#),
                NullPolicy::Sentinel,
            );
            buffer.append(Some(&Value::Enum(1, "B".into()))).unwrap();
            let (column, _) = buffer.finish();
            assert_eq!(array(&column).as_string::<i32>().value(0), "B");
        }

        #[test]
        fn test_type_mismatch() {
            let mut buffer = ColumnBuffer::new(&field(r#""int""#), NullPolicy::Sentinel);
            let err = buffer.append(Some(&Value::String("x".into()))).unwrap_err();
            assert!(matches!(err, DecodeError::TypeMismatch { .. }));
        }

        #[test]
        fn test_other_types_pass_through() {
            let mut buffer = ColumnBuffer::new(
                &field(r#"{"type":"map","values":"int"}"#),
                NullPolicy::Sentinel,
            );
            let map = Value::Map(Default::default());
            buffer.append(Some(&map)).unwrap();
            let (column, _) = buffer.finish();
            assert_eq!(column, Column::Values(vec![map]));
        }
    }

    mod nulls {
        use super::*;

        #[test]
        fn test_sentinel_defaults() {
            let mut flag = ColumnBuffer::new(&field(r#"["null","boolean"]"#), NullPolicy::Sentinel);
            flag.append(None).unwrap();
            let (column, _) = flag.finish();
            let flags = array(&column).as_boolean();
            assert_eq!(flags.null_count(), 0);
            assert!(!flags.value(0));

            let mut real = ColumnBuffer::new(&field(r#"["null","float"]"#), NullPolicy::Sentinel);
            real.append(Some(&Value::Union(0, Box::new(Value::Null))))
                .unwrap();
            let (column, _) = real.finish();
            assert_eq!(array(&column).as_primitive::<Float32Type>().value(0), f32::MAX);
        }

        #[test]
        fn test_sentinel_rejects_null_int() {
            for type_json in [r#"["null","int"]"#, r#"["null","long"]"#, r#"["null","double"]"#] {
                let mut buffer = ColumnBuffer::new(&field(type_json), NullPolicy::Sentinel);
                assert!(matches!(
                    buffer.append(None),
                    Err(DecodeError::UnexpectedNull { .. })
                ));
            }
        }

        #[test]
        fn test_sentinel_keeps_string_nulls() {
            let mut buffer =
                ColumnBuffer::new(&field(r#"["null","string"]"#), NullPolicy::Sentinel);
            buffer.append(None).unwrap();
            let (column, _) = buffer.finish();
            assert!(array(&column).is_null(0));
        }

        #[test]
        fn test_validity_keeps_nulls() {
            let mut buffer = ColumnBuffer::new(&field(r#"["null","int"]"#), NullPolicy::Validity);
            buffer.append(Some(&Value::Int(3))).unwrap();
            buffer.append(None).unwrap();
            let (column, _) = buffer.finish();
            let values = array(&column);
            assert_eq!(values.len(), 2);
            assert!(values.is_valid(0));
            assert!(values.is_null(1));
        }
    }

    mod repeated {
        use super::*;

        #[test]
        fn test_group_lengths_sum_to_element_count() {
            let mut buffer = ColumnBuffer::new(
                &field(r#"{"type":"array","items":"string"}"#),
                NullPolicy::Sentinel,
            );
            buffer
                .append_repeated(Some(&Value::Array(vec![
                    Value::String("a".into()),
                    Value::String("b".into()),
                ])))
                .unwrap();
            buffer.append_repeated(Some(&Value::Array(vec![]))).unwrap();
            buffer.append_repeated(None).unwrap();

            let (column, lengths) = buffer.finish();
            let lengths = lengths.expect("repeated field has group lengths");
            assert_eq!(lengths.values().to_vec(), vec![2, 0, 0]);
            assert_eq!(column.len(), 2);
        }

        #[test]
        fn test_nullable_elements() {
            let mut buffer = ColumnBuffer::new(
                &field(r#"{"type":"array","items":["null","double"]}"#),
                NullPolicy::Validity,
            );
            buffer
                .append_repeated(Some(&Value::Array(vec![
                    Value::Union(1, Box::new(Value::Double(1.5))),
                    Value::Union(0, Box::new(Value::Null)),
                ])))
                .unwrap();
            let (column, _) = buffer.finish();
            assert_eq!(array(&column).null_count(), 1);
        }

        #[test]
        fn test_scalar_where_array_expected() {
            let mut buffer = ColumnBuffer::new(
                &field(r#"{"type":"array","items":"int"}"#),
                NullPolicy::Sentinel,
            );
            assert!(matches!(
                buffer.append_repeated(Some(&Value::Int(1))),
                Err(DecodeError::ExpectedArray { .. })
            ));
        }
    }
}
