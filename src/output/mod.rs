//! Export of decoded batches to Arrow record batches and columnar files.

pub mod parquet;

use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch};
use arrow::datatypes::{Field, Schema, SchemaRef};
use thiserror::Error;
use tracing::warn;

use crate::avro::ReadBatch;
use crate::columnar::{regroup, Column};

pub use self::parquet::ParquetWriter;

/// Errors that can occur during output operations.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] ::parquet::errors::ParquetError),

    #[error("batch has no columns with an Arrow representation")]
    NoColumns,
}

/// Convert a read batch into an Arrow record batch.
///
/// Repeated fields become list columns. Pass-through columns are skipped.
/// Columns are named by their qualified path so nested fields never clash.
pub fn to_record_batch(batch: &ReadBatch) -> Result<RecordBatch, OutputError> {
    let mut fields = Vec::with_capacity(batch.fields.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(batch.fields.len());

    for ((field, column), lengths) in batch
        .fields
        .iter()
        .zip(&batch.columns)
        .zip(&batch.group_lengths)
    {
        let values = match column {
            Column::Array(values) => values.clone(),
            Column::Values(_) => {
                warn!(field = %field.qualified_name(), "skipping column with no Arrow type");
                continue;
            }
        };
        let array: ArrayRef = match lengths {
            Some(lengths) => Arc::new(regroup(values, lengths)?),
            None => values,
        };
        fields.push(Field::new(field.qualified_name(), array.data_type().clone(), true));
        arrays.push(array);
    }

    if arrays.is_empty() {
        return Err(OutputError::NoColumns);
    }
    let schema: SchemaRef = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, arrays)?)
}
