//! Column-to-record writer.
//!
//! Each [`RecordStreamWriter::write`] call owns one complete output session:
//! it opens the destination, writes (or binds to) the header, assembles one
//! record per row from the columns, and closes the output on every path.

use std::io::{self, Write};

use apache_avro::schema::SchemaKind;
use apache_avro::types::Value;
use apache_avro::{to_avro_datum, Schema};
use arrow::datatypes::DataType;
use thiserror::Error;
use tracing::debug;

use crate::avro::codec::{Codec, CodecKind};
use crate::avro::container::{write_block, Header, SyncMarker};
use crate::avro::reader::{probe_header, ReadError};
use crate::avro::schema::SchemaError;
use crate::columnar::Column;
use crate::storage::{OutputMode, Storage};

/// Errors raised while assembling or encoding records.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode record: {0}")]
    Avro(#[from] apache_avro::Error),

    #[error("unsupported column type: {0}")]
    UnsupportedArrowType(DataType),

    #[error("{keys} field keys but {columns} columns")]
    FieldCountMismatch { keys: usize, columns: usize },

    #[error("column '{field}' has {got} rows, expected {expected}")]
    RowCountMismatch {
        field: String,
        expected: usize,
        got: usize,
    },

    #[error("field '{0}' is not in the record schema")]
    UnknownField(String),

    #[error("field '{field}': {value} does not fit in {target}")]
    LossyValue {
        field: String,
        value: String,
        target: &'static str,
    },

    #[error("invalid {codec} level {level}")]
    InvalidCodecLevel { codec: &'static str, level: i32 },

    #[error("metadata key '{0}' is reserved")]
    ReservedMetadataKey(String),
}

/// A write failed. The output is still closed.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("cannot append to existing stream: {0}")]
    Append(#[from] ReadError),
}

/// Whether a write creates a new stream or extends an existing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate the destination.
    #[default]
    Create,
    /// Append blocks to an existing stream, reusing its schema, codec and
    /// sync marker. The supplied schema text, codec and metadata are ignored.
    Append,
}

/// Options for a [`RecordStreamWriter::write`] call.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Codec name. Unrecognized names fall back to snappy.
    pub codec: String,
    /// Level for deflate (-1..=9) and xz (0..=9).
    pub codec_level: i32,
    /// User metadata written into the header.
    pub metadata: Vec<(String, String)>,
    pub mode: WriteMode,
    /// Close a block after every record.
    pub sync_every_record: bool,
    /// Approximate uncompressed block size in bytes.
    pub sync_interval: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            codec: "snappy".to_string(),
            codec_level: 6,
            metadata: Vec::new(),
            mode: WriteMode::Create,
            sync_every_record: false,
            sync_interval: 64_000,
        }
    }
}

impl WriteOptions {
    /// Options for appending to an existing stream.
    pub fn append() -> Self {
        Self {
            mode: WriteMode::Append,
            ..Default::default()
        }
    }
}

/// Buffers encoded records and emits them as blocks.
pub struct BlockWriter {
    out: Box<dyn Write + Send>,
    codec: Codec,
    sync: SyncMarker,
    buffer: Vec<u8>,
    pending: u64,
    sync_interval: usize,
}

impl BlockWriter {
    pub fn new(out: Box<dyn Write + Send>, header: &Header, sync_interval: usize) -> Self {
        Self {
            out,
            codec: header.codec,
            sync: header.sync,
            buffer: Vec::new(),
            pending: 0,
            sync_interval,
        }
    }

    /// Buffer one encoded record, writing a block once the buffer reaches
    /// the sync interval.
    pub fn append(&mut self, datum: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(datum);
        self.pending += 1;
        if self.buffer.len() >= self.sync_interval {
            self.flush()?;
        }
        Ok(())
    }

    /// Write any buffered records as a block and flush the output.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.pending > 0 {
            write_block(&mut *self.out, &self.codec, &self.sync, self.pending, &self.buffer)?;
            self.buffer.clear();
            self.pending = 0;
        }
        self.out.flush()
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Writes columns as records to a stream.
#[derive(Debug, Clone, Default)]
pub struct RecordStreamWriter {
    storage: Storage,
}

impl RecordStreamWriter {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Write one record per row. Row `j` takes element `j` of every column,
    /// set on the field named by the matching key. Returns the number of
    /// records written.
    pub fn write(
        &self,
        locator: &str,
        keys: &[&str],
        columns: Vec<Column>,
        schema_text: &str,
        options: &WriteOptions,
    ) -> Result<u64, WriteError> {
        let rows = check_shape(keys, &columns)?;

        let header = match options.mode {
            WriteMode::Create => {
                let schema = Schema::parse_str(schema_text).map_err(SchemaError::from)?;
                let codec = CodecKind::from_name(&options.codec).with_level(options.codec_level)?;
                Header::create(schema_text, schema, codec, &options.metadata)?
            }
            WriteMode::Append => {
                let header = probe_header(&self.storage, locator)?;
                debug!(locator, codec = header.codec.name(), "appending with existing header");
                header
            }
        };
        check_keys(&header.schema, keys)?;

        let out = match options.mode {
            WriteMode::Create => {
                let mut out = self.storage.open_output(locator, OutputMode::Create)?;
                out.write_all(&header.to_bytes()?)?;
                out
            }
            WriteMode::Append => self.storage.open_output(locator, OutputMode::Append)?,
        };

        let mut blocks = BlockWriter::new(out, &header, options.sync_interval);
        let written = encode_rows(&mut blocks, &header.schema, keys, columns, rows, options);
        let closed = blocks.finish();
        let written = written?;
        closed?;

        debug!(locator, records = written, "wrote records");
        Ok(written)
    }
}

/// Row count shared by every column.
fn check_shape(keys: &[&str], columns: &[Column]) -> Result<usize, EncodeError> {
    if keys.len() != columns.len() {
        return Err(EncodeError::FieldCountMismatch {
            keys: keys.len(),
            columns: columns.len(),
        });
    }
    let rows = columns.first().map_or(0, Column::len);
    for (key, column) in keys.iter().zip(columns) {
        if column.len() != rows {
            return Err(EncodeError::RowCountMismatch {
                field: key.to_string(),
                expected: rows,
                got: column.len(),
            });
        }
    }
    Ok(rows)
}

fn check_keys(schema: &Schema, keys: &[&str]) -> Result<(), WriteError> {
    let Schema::Record(record) = schema else {
        return Err(SchemaError::NotARecord(SchemaKind::from(schema)).into());
    };
    match keys.iter().find(|key| !record.lookup.contains_key(**key)) {
        Some(key) => Err(EncodeError::UnknownField(key.to_string()).into()),
        None => Ok(()),
    }
}

fn encode_rows(
    blocks: &mut BlockWriter,
    schema: &Schema,
    keys: &[&str],
    columns: Vec<Column>,
    rows: usize,
    options: &WriteOptions,
) -> Result<u64, WriteError> {
    let mut columns = columns
        .into_iter()
        .map(|column| column.into_values().map(Vec::into_iter))
        .collect::<Result<Vec<_>, _>>()?;

    for _ in 0..rows {
        let fields: Vec<(String, Value)> = keys
            .iter()
            .zip(columns.iter_mut())
            .map(|(key, values)| (key.to_string(), values.next().unwrap_or(Value::Null)))
            .collect();
        for (key, value) in &fields {
            if let Some(field) = record_field(schema, key) {
                check_lossless(key, value, field)?;
            }
        }
        let record = Value::Record(fields)
            .resolve(schema)
            .map_err(EncodeError::from)?;
        let datum = to_avro_datum(schema, record).map_err(EncodeError::from)?;
        blocks.append(&datum)?;
        if options.sync_every_record {
            blocks.flush()?;
        }
    }
    Ok(rows as u64)
}

fn record_field<'a>(schema: &'a Schema, name: &str) -> Option<&'a Schema> {
    let Schema::Record(record) = schema else {
        return None;
    };
    record.lookup.get(name).map(|&i| &record.fields[i].schema)
}

/// Reject values that `Value::resolve` would narrow with a lossy cast.
fn check_lossless(key: &str, value: &Value, schema: &Schema) -> Result<(), EncodeError> {
    let lossy = |target| EncodeError::LossyValue {
        field: key.to_string(),
        value: format!("{value:?}"),
        target,
    };
    match (value, schema) {
        (Value::Long(n), Schema::Int) if i32::try_from(*n).is_err() => Err(lossy("int")),
        (Value::Int(n), Schema::Float) if (*n as f32) as i64 != i64::from(*n) => {
            Err(lossy("float"))
        }
        (Value::Long(n), Schema::Float) if (*n as f32) as i128 != i128::from(*n) => {
            Err(lossy("float"))
        }
        (Value::Long(n), Schema::Double) if (*n as f64) as i128 != i128::from(*n) => {
            Err(lossy("double"))
        }
        (Value::Double(d), Schema::Float) if !d.is_nan() && f64::from(*d as f32) != *d => {
            Err(lossy("float"))
        }
        (Value::Union(index, inner), Schema::Union(union)) => {
            match union.variants().get(*index as usize) {
                Some(branch) => check_lossless(key, inner, branch),
                None => Ok(()),
            }
        }
        (_, Schema::Union(union)) => {
            // Same branch choice as `Value::resolve`: exact kind first, then the
            // first branch the value resolves against.
            let kind = SchemaKind::from(value);
            let variants = union.variants();
            let branch = variants
                .iter()
                .find(|branch| SchemaKind::from(*branch) == kind)
                .or_else(|| variants.iter().find(|branch| value.clone().resolve(branch).is_ok()));
            match branch {
                Some(branch) => check_lossless(key, value, branch),
                None => Ok(()),
            }
        }
        (Value::Array(items), Schema::Array(array)) => items
            .iter()
            .try_for_each(|item| check_lossless(key, item, &array.items)),
        (Value::Map(entries), Schema::Map(map)) => entries
            .values()
            .try_for_each(|entry| check_lossless(key, entry, &map.types)),
        (Value::Record(fields), Schema::Record(_)) => fields.iter().try_for_each(|(name, field)| {
            match record_field(schema, name) {
                Some(inner) => check_lossless(key, field, inner),
                None => Ok(()),
            }
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;

    use crate::avro::container::CODEC_KEY;
    use crate::avro::reader::{metadata, ReadOptions, RecordLimit, RecordStreamReader};
    use crate::storage::MemoryBackend;

    const SCHEMA: &str = r#"{"type":"record","name":"r","fields":[
        {"name":"id","type":"long"},
        {"name":"name","type":["null","string"]}
    ]}"#;
    const DEST: &str = "mem://out.avro";

    fn storage() -> (Storage, Arc<MemoryBackend>) {
        let memory = Arc::new(MemoryBackend::new());
        (Storage::new().with_backend("mem", memory.clone()), memory)
    }

    fn columns(ids: &[i64]) -> Vec<Column> {
        vec![
            Column::Values(ids.iter().map(|&i| Value::Long(i)).collect()),
            Column::Values(ids.iter().map(|i| Value::String(format!("n{i}"))).collect()),
        ]
    }

    fn read_ids(storage: &Storage) -> Vec<Value> {
        let mut reader = RecordStreamReader::new(storage.clone(), ReadOptions::default());
        let batch = reader.read(DEST, None, RecordLimit::All).unwrap();
        batch.columns[0].clone().into_values().unwrap()
    }

    mod create {
        use super::*;

        #[test]
        fn test_write_then_read() {
            let (storage, _) = storage();
            let writer = RecordStreamWriter::new(storage.clone());
            let written = writer
                .write(DEST, &["id", "name"], columns(&[1, 2, 3]), SCHEMA, &WriteOptions::default())
                .unwrap();
            assert_eq!(written, 3);
            assert_eq!(
                read_ids(&storage),
                vec![Value::Long(1), Value::Long(2), Value::Long(3)]
            );
        }

        #[test]
        fn test_metadata_and_codec_in_header() {
            let (storage, _) = storage();
            let options = WriteOptions {
                codec: "deflate".to_string(),
                codec_level: -1,
                metadata: vec![("origin".to_string(), "unit-test".to_string())],
                ..Default::default()
            };
            RecordStreamWriter::new(storage.clone())
                .write(DEST, &["id", "name"], columns(&[1]), SCHEMA, &options)
                .unwrap();

            let meta = metadata(&storage, DEST).unwrap();
            assert_eq!(meta["origin"], "unit-test");
            assert_eq!(meta[CODEC_KEY], "deflate");
        }

        #[test]
        fn test_sync_every_record_writes_one_block_per_row() {
            let (storage, memory) = storage();
            let writer = RecordStreamWriter::new(storage.clone());
            let options = WriteOptions {
                codec: "null".to_string(),
                ..Default::default()
            };
            writer
                .write(DEST, &["id", "name"], columns(&[1, 2, 3]), SCHEMA, &options)
                .unwrap();
            let batched = memory.get(DEST).unwrap().len();

            let options = WriteOptions {
                sync_every_record: true,
                ..options
            };
            writer
                .write(DEST, &["id", "name"], columns(&[1, 2, 3]), SCHEMA, &options)
                .unwrap();
            let synced = memory.get(DEST).unwrap().len();

            // Two extra blocks, each with a count, a size and a sync marker.
            assert_eq!(synced - batched, 2 * (1 + 1 + 16));
            assert_eq!(read_ids(&storage).len(), 3);
        }

        #[test]
        fn test_empty_columns_write_header_only() {
            let (storage, _) = storage();
            let written = RecordStreamWriter::new(storage.clone())
                .write(
                    DEST,
                    &["id", "name"],
                    vec![Column::Values(vec![]), Column::Values(vec![])],
                    SCHEMA,
                    &WriteOptions::default(),
                )
                .unwrap();
            assert_eq!(written, 0);
            assert!(read_ids(&storage).is_empty());
        }
    }

    mod append {
        use super::*;

        #[test]
        fn test_append_extends_stream() {
            let (storage, _) = storage();
            let writer = RecordStreamWriter::new(storage.clone());
            writer
                .write(DEST, &["id", "name"], columns(&[1]), SCHEMA, &WriteOptions::default())
                .unwrap();
            writer
                .write(DEST, &["id", "name"], columns(&[2, 3]), "", &WriteOptions::append())
                .unwrap();
            assert_eq!(
                read_ids(&storage),
                vec![Value::Long(1), Value::Long(2), Value::Long(3)]
            );
        }

        #[test]
        fn test_append_keeps_original_codec() {
            let (storage, _) = storage();
            let writer = RecordStreamWriter::new(storage.clone());
            let options = WriteOptions {
                codec: "bzip2".to_string(),
                ..Default::default()
            };
            writer
                .write(DEST, &["id", "name"], columns(&[1]), SCHEMA, &options)
                .unwrap();
            let options = WriteOptions {
                codec: "xz".to_string(),
                ..WriteOptions::append()
            };
            writer
                .write(DEST, &["id", "name"], columns(&[2]), SCHEMA, &options)
                .unwrap();

            assert_eq!(metadata(&storage, DEST).unwrap()[CODEC_KEY], "bzip2");
            assert_eq!(read_ids(&storage).len(), 2);
        }

        #[test]
        fn test_append_to_missing_stream() {
            let (storage, _) = storage();
            let result = RecordStreamWriter::new(storage).write(
                DEST,
                &["id", "name"],
                columns(&[1]),
                SCHEMA,
                &WriteOptions::append(),
            );
            assert!(matches!(result, Err(WriteError::Append(ReadError::Io(_)))));
        }
    }

    mod errors {
        use super::*;

        fn write(
            keys: &[&str],
            columns: Vec<Column>,
            options: &WriteOptions,
        ) -> Result<u64, WriteError> {
            let (storage, _) = storage();
            RecordStreamWriter::new(storage).write(DEST, keys, columns, SCHEMA, options)
        }

        #[test]
        fn test_row_count_mismatch() {
            let columns = vec![
                Column::Values(vec![Value::Long(1), Value::Long(2)]),
                Column::Values(vec![Value::Null]),
            ];
            assert!(matches!(
                write(&["id", "name"], columns, &WriteOptions::default()),
                Err(WriteError::Encode(EncodeError::RowCountMismatch { .. }))
            ));
        }

        #[test]
        fn test_key_count_mismatch() {
            assert!(matches!(
                write(&["id"], columns(&[1]), &WriteOptions::default()),
                Err(WriteError::Encode(EncodeError::FieldCountMismatch { .. }))
            ));
        }

        #[test]
        fn test_unknown_field() {
            assert!(matches!(
                write(&["id", "nickname"], columns(&[1]), &WriteOptions::default()),
                Err(WriteError::Encode(EncodeError::UnknownField(_)))
            ));
        }

        #[test]
        fn test_invalid_codec_level() {
            let options = WriteOptions {
                codec: "xz".to_string(),
                codec_level: 12,
                ..Default::default()
            };
            assert!(matches!(
                write(&["id", "name"], columns(&[1]), &options),
                Err(WriteError::Encode(EncodeError::InvalidCodecLevel { .. }))
            ));
        }

        #[test]
        fn test_value_not_matching_schema() {
            let columns = vec![
                Column::Values(vec![Value::String("one".into())]),
                Column::Values(vec![Value::Null]),
            ];
            assert!(matches!(
                write(&["id", "name"], columns, &WriteOptions::default()),
                Err(WriteError::Encode(EncodeError::Avro(_)))
            ));
        }

        #[test]
        fn test_wide_long_into_int_field() {
            let (storage, memory) = storage();
            let schema = r#"{"type":"record","name":"r","fields":[{"name":"n","type":"int"}]}"#;
            let columns = vec![Column::Array(Arc::new(Int64Array::from(vec![
                1i64 << 40,
                5_000_000_000,
            ])))];
            let result = RecordStreamWriter::new(storage).write(
                DEST,
                &["n"],
                columns,
                schema,
                &WriteOptions::default(),
            );
            match result {
                Err(WriteError::Encode(EncodeError::LossyValue { field, target, .. })) => {
                    assert_eq!(field, "n");
                    assert_eq!(target, "int");
                }
                other => panic!("expected LossyValue, got {other:?}"),
            }
            // Header only: the rejected rows never reach a block.
            let stored = memory.get(DEST).unwrap();
            let header = Header::read(&mut std::io::Cursor::new(&stored)).unwrap();
            assert_eq!(header.data_offset, stored.len() as u64);
        }

        #[test]
        fn test_long_that_fits_into_int_field() {
            let (storage, _) = storage();
            let schema = r#"{"type":"record","name":"r","fields":[{"name":"n","type":"int"}]}"#;
            let columns = vec![Column::Array(Arc::new(Int64Array::from(vec![-7i64, 42])))];
            let written = RecordStreamWriter::new(storage.clone())
                .write(DEST, &["n"], columns, schema, &WriteOptions::default())
                .unwrap();
            assert_eq!(written, 2);
            assert_eq!(read_ids(&storage), vec![Value::Int(-7), Value::Int(42)]);
        }

        #[test]
        fn test_wide_long_into_nullable_int_field() {
            let (storage, _) = storage();
            let schema = r#"{"type":"record","name":"r","fields":[
                {"name":"n","type":["null","int"]}
            ]}"#;
            let result = RecordStreamWriter::new(storage).write(
                DEST,
                &["n"],
                vec![Column::Values(vec![Value::Null, Value::Long(i64::MAX)])],
                schema,
                &WriteOptions::default(),
            );
            assert!(matches!(
                result,
                Err(WriteError::Encode(EncodeError::LossyValue { target: "int", .. }))
            ));
        }

        #[test]
        fn test_imprecise_double_into_float_field() {
            let (storage, _) = storage();
            let schema = r#"{"type":"record","name":"r","fields":[
                {"name":"x","type":{"type":"array","items":"float"}}
            ]}"#;
            let rows = vec![
                Value::Array(vec![Value::Double(1.5)]),
                Value::Array(vec![Value::Double(1e300)]),
            ];
            let result = RecordStreamWriter::new(storage).write(
                DEST,
                &["x"],
                vec![Column::Values(rows)],
                schema,
                &WriteOptions::default(),
            );
            assert!(matches!(
                result,
                Err(WriteError::Encode(EncodeError::LossyValue { target: "float", .. }))
            ));
        }

        #[test]
        fn test_malformed_schema() {
            let (storage, _) = storage();
            let result = RecordStreamWriter::new(storage).write(
                DEST,
                &["id"],
                vec![Column::Values(vec![Value::Long(1)])],
                "{not json",
                &WriteOptions::default(),
            );
            assert!(matches!(result, Err(WriteError::Schema(_))));
        }
    }
}
