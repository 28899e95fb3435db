//! Bridge between Avro object container files and Arrow columns.
//!
//! Reading flattens the record schema into leaf fields and materializes one
//! typed column per field, with a parallel group-length array for array
//! fields. Writing takes columns plus field names and emits one record per
//! row.
//!
//! ```no_run
//! use avrocol::{read_records, RecordLimit};
//!
//! let batch = read_records("events.avro", None, RecordLimit::All)?;
//! for (name, column) in batch.field_names().iter().zip(&batch.columns) {
//!     println!("{name}: {} values", column.len());
//! }
//! # Ok::<(), avrocol::ReadError>(())
//! ```

pub mod avro;
pub mod columnar;
pub mod output;
pub mod storage;

use std::collections::BTreeMap;

pub use avro::{
    LeafField, LeafType, ReadBatch, ReadError, ReadOptions, RecordLimit, RecordStreamReader,
    RecordStreamWriter, SeekMode, WriteError, WriteMode, WriteOptions,
};
pub use columnar::{Column, NullPolicy};
pub use storage::Storage;

/// Read records from a local stream in one call, starting at the first
/// block boundary at or after `offset`.
pub fn read_records(
    source: &str,
    offset: Option<u64>,
    limit: RecordLimit,
) -> Result<ReadBatch, ReadError> {
    RecordStreamReader::default().read(source, offset, limit)
}

/// Write columns to a local stream in one call.
pub fn write_records(
    destination: &str,
    keys: &[&str],
    columns: Vec<Column>,
    schema_text: &str,
    options: &WriteOptions,
) -> Result<u64, WriteError> {
    RecordStreamWriter::default().write(destination, keys, columns, schema_text, options)
}

/// Pretty-printed schema of a local stream.
pub fn schema_text(source: &str) -> Result<String, ReadError> {
    avro::schema_text(&Storage::default(), source)
}

/// Header metadata of a local stream.
pub fn metadata(source: &str) -> Result<BTreeMap<String, String>, ReadError> {
    avro::metadata(&Storage::default(), source)
}
