//! Flattening of Avro record schemas into ordered leaf field descriptors.
//!
//! Every leaf column the reader materializes comes from one `LeafField`.
//! Unions resolve to their first non-null branch, enums read as strings,
//! arrays mark the field as repeated, and nested records are flattened in
//! place without a name prefix.

use std::collections::{HashMap, HashSet};

use apache_avro::schema::{RecordSchema, SchemaKind};
use apache_avro::types::Value;
use apache_avro::Schema;
use thiserror::Error;
use tracing::debug;

use crate::avro::reader::DecodeError;

/// Errors that can occur while parsing or flattening a schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to parse schema: {0}")]
    Parse(#[from] apache_avro::Error),

    #[error("invalid schema JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stream header has no avro.schema entry")]
    Missing,

    #[error("top-level schema must be a record, got {0:?}")]
    NotARecord(SchemaKind),

    #[error("unresolved named type: {0}")]
    UnresolvedReference(String),

    #[error("recursive record cannot be flattened: {0}")]
    RecursiveRecord(String),
}

/// Resolved in-memory type of a leaf column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafType {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    /// Strings and enum symbols.
    String,
    /// Anything else (fixed, map, nested arrays, logical types). Values are
    /// passed through without conversion.
    Other(SchemaKind),
}

impl LeafType {
    fn of(kind: SchemaKind) -> Self {
        match kind {
            SchemaKind::Boolean => LeafType::Boolean,
            SchemaKind::Int => LeafType::Int,
            SchemaKind::Long => LeafType::Long,
            SchemaKind::Float => LeafType::Float,
            SchemaKind::Double => LeafType::Double,
            SchemaKind::Bytes => LeafType::Bytes,
            SchemaKind::String | SchemaKind::Enum => LeafType::String,
            other => LeafType::Other(other),
        }
    }
}

/// One flattened leaf column of a record schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafField {
    /// Short field name, as declared.
    pub name: String,
    pub leaf_type: LeafType,
    /// True when the field is an array; one group length is recorded per row.
    pub repeated: bool,
    /// Field names from the root record down to this leaf.
    path: Vec<String>,
    /// Field positions matching `path`.
    positions: Vec<usize>,
}

impl LeafField {
    /// Dotted path from the root record, e.g. `location.lat`.
    pub fn qualified_name(&self) -> String {
        self.path.join(".")
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Locate this leaf's value inside a decoded row.
    ///
    /// Returns `None` when an enclosing nullable record is null.
    pub(crate) fn extract<'v>(&self, row: &'v Value) -> Result<Option<&'v Value>, DecodeError> {
        let mut current = row;
        for (name, &position) in self.path.iter().zip(&self.positions) {
            match strip_union(current) {
                Value::Record(fields) => match fields.get(position) {
                    Some((_, value)) => current = value,
                    None => {
                        return Err(DecodeError::TypeMismatch {
                            field: self.qualified_name(),
                            expected: format!("record with field {name}"),
                            got: format!("{} fields", fields.len()),
                        })
                    }
                },
                Value::Null => return Ok(None),
                other => {
                    return Err(DecodeError::TypeMismatch {
                        field: self.qualified_name(),
                        expected: "record".to_string(),
                        got: value_kind(other),
                    })
                }
            }
        }
        Ok(Some(strip_union(current)))
    }
}

/// Unwrap a union value to the branch value it carries.
pub(crate) fn strip_union(value: &Value) -> &Value {
    match value {
        Value::Union(_, inner) => strip_union(inner),
        other => other,
    }
}

pub(crate) fn value_kind(value: &Value) -> String {
    format!("{:?}", SchemaKind::from(value))
}

/// Flatten a record schema into its leaf fields, in declaration order.
///
/// Union fields with no non-null branch are dropped.
pub fn flatten(schema: &Schema) -> Result<Vec<LeafField>, SchemaError> {
    let Schema::Record(record) = schema else {
        return Err(SchemaError::NotARecord(SchemaKind::from(schema)));
    };

    let mut walker = Walker::default();
    walker.collect_names(schema);
    walker.visit_record(record, &mut Vec::new(), &mut Vec::new())?;
    Ok(walker.leaves)
}

#[derive(Default)]
struct Walker<'s> {
    names: HashMap<String, &'s Schema>,
    active: HashSet<String>,
    leaves: Vec<LeafField>,
}

impl<'s> Walker<'s> {
    /// Register every named definition so `Ref`s can be followed.
    fn collect_names(&mut self, schema: &'s Schema) {
        match schema {
            Schema::Record(record) => {
                if self.names.insert(record.name.fullname(None), schema).is_none() {
                    for field in &record.fields {
                        self.collect_names(&field.schema);
                    }
                }
            }
            Schema::Enum(e) => {
                self.names.insert(e.name.fullname(None), schema);
            }
            Schema::Fixed(f) => {
                self.names.insert(f.name.fullname(None), schema);
            }
            Schema::Array(array) => self.collect_names(&array.items),
            Schema::Map(map) => self.collect_names(&map.types),
            Schema::Union(union) => {
                for variant in union.variants() {
                    self.collect_names(variant);
                }
            }
            _ => {}
        }
    }

    fn resolve(&self, schema: &'s Schema) -> Result<&'s Schema, SchemaError> {
        match schema {
            Schema::Ref { name } => {
                let fullname = name.fullname(None);
                self.names
                    .get(&fullname)
                    .copied()
                    .ok_or(SchemaError::UnresolvedReference(fullname))
            }
            other => Ok(other),
        }
    }

    /// First non-null branch of a union, following references.
    fn union_branch(&self, schema: &'s Schema) -> Result<Option<&'s Schema>, SchemaError> {
        let Schema::Union(union) = schema else {
            return Ok(Some(schema));
        };
        for variant in union.variants() {
            let variant = self.resolve(variant)?;
            if !matches!(variant, Schema::Null) {
                return Ok(Some(variant));
            }
        }
        Ok(None)
    }

    fn visit_record(
        &mut self,
        record: &'s RecordSchema,
        path: &mut Vec<String>,
        positions: &mut Vec<usize>,
    ) -> Result<(), SchemaError> {
        let fullname = record.name.fullname(None);
        if !self.active.insert(fullname.clone()) {
            return Err(SchemaError::RecursiveRecord(fullname));
        }

        for (position, field) in record.fields.iter().enumerate() {
            let declared = self.resolve(&field.schema)?;
            let Some(effective) = self.union_branch(declared)? else {
                debug!(field = %field.name, "dropping union field with no non-null branch");
                continue;
            };

            path.push(field.name.clone());
            positions.push(position);
            match effective {
                Schema::Record(nested) => self.visit_record(nested, path, positions)?,
                Schema::Array(array) => {
                    let element = self.element_type(&array.items)?;
                    self.push_leaf(&field.name, element, true, path, positions);
                }
                other => {
                    let leaf = LeafType::of(SchemaKind::from(other));
                    self.push_leaf(&field.name, leaf, false, path, positions);
                }
            }
            path.pop();
            positions.pop();
        }

        self.active.remove(&fullname);
        Ok(())
    }

    fn element_type(&self, items: &'s Schema) -> Result<LeafType, SchemaError> {
        let items = self.resolve(items)?;
        Ok(match self.union_branch(items)? {
            Some(branch) => LeafType::of(SchemaKind::from(branch)),
            None => LeafType::Other(SchemaKind::Null),
        })
    }

    fn push_leaf(
        &mut self,
        name: &str,
        leaf_type: LeafType,
        repeated: bool,
        path: &[String],
        positions: &[usize],
    ) {
        self.leaves.push(LeafField {
            name: name.to_string(),
            leaf_type,
            repeated,
            path: path.to_vec(),
            positions: positions.to_vec(),
        });
    }
}
