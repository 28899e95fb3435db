//! Avro object container files: schema flattening, block codecs, framing,
//! and the columnar reader and writer built on them.

pub mod codec;
pub mod container;
pub mod reader;
pub mod schema;
pub mod writer;

pub use codec::{Codec, CodecKind};
pub use container::Header;
pub use reader::{
    metadata, schema_text, DecodeError, ReadBatch, ReadError, ReadOptions, RecordLimit,
    RecordStreamReader, SeekMode, Session,
};
pub use schema::{flatten, LeafField, LeafType, SchemaError};
pub use writer::{
    BlockWriter, EncodeError, RecordStreamWriter, WriteError, WriteMode, WriteOptions,
};
