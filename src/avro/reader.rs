//! Resumable, position-aware reader that materializes records as columns.
//!
//! A [`RecordStreamReader`] keeps at most one live [`Session`] per reader.
//! Calls with a finite [`RecordLimit`] leave the session open so the next
//! call against the same locator continues where the previous one stopped;
//! [`RecordLimit::All`] drains the stream and closes it.

use std::collections::BTreeMap;
use std::io::{self, BufReader, Cursor, Seek, SeekFrom};

use apache_avro::from_avro_datum;
use apache_avro::types::Value;
use arrow::array::Int32Array;
use thiserror::Error;
use tracing::debug;

use crate::avro::container::{find_sync, read_block, Header};
use crate::avro::schema::{flatten, LeafField, SchemaError};
use crate::columnar::{Column, ColumnBuffer, NullPolicy};
use crate::storage::{SeekableInput, Storage};

/// Errors raised while decoding a record stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not an object container file (magic {0:?})")]
    BadMagic([u8; 4]),

    #[error("invalid header metadata: {0}")]
    InvalidMetadata(String),

    #[error("unsupported codec '{0}'")]
    UnsupportedCodec(String),

    #[error("invalid block header: count {count}, size {size}")]
    InvalidBlock { count: i64, size: i64 },

    #[error("block is not followed by the stream's sync marker")]
    SyncMismatch,

    #[error("{codec} decompression failed: {message}")]
    Codec { codec: &'static str, message: String },

    #[error("snappy checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("failed to decode record: {0}")]
    Datum(#[from] apache_avro::Error),

    #[error("field {field}: expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("field {field}: unexpected null in a non-nullable column")]
    UnexpectedNull { field: String },

    #[error("field {field}: expected an array, got {got}")]
    ExpectedArray { field: String, got: String },
}

/// A read failed. Nothing decoded by the failing call is returned.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// How an explicit seek position is applied to an open stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SeekMode {
    /// Seek to the position verbatim. It must be a block boundary.
    #[default]
    Exact,
    /// Move to the first block boundary at or after the position.
    Sync,
}

/// Options for a [`RecordStreamReader`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub seek_mode: SeekMode,
    pub null_policy: NullPolicy,
}

/// Upper bound on the records decoded by one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLimit {
    Count(u64),
    /// Drain the stream and close the session.
    All,
}

impl RecordLimit {
    fn allows(self, consumed: u64) -> bool {
        match self {
            RecordLimit::Count(n) => consumed < n,
            RecordLimit::All => true,
        }
    }
}

/// Columns decoded by one read call.
#[derive(Debug, Clone)]
pub struct ReadBatch {
    /// Leaf fields in declaration order.
    pub fields: Vec<LeafField>,
    /// One column per field.
    pub columns: Vec<Column>,
    /// Per-record element counts, present only for repeated fields.
    pub group_lengths: Vec<Option<Int32Array>>,
    /// Records consumed by this call.
    pub records: u64,
    /// True when no unread records remain.
    pub exhausted: bool,
    /// Block boundary holding the next unread record. Passing it back as the
    /// seek position of the next call continues without skipping or
    /// repeating records.
    pub position: u64,
}

impl ReadBatch {
    /// Short field names, as declared.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Column for a field, looked up by qualified name first, then by the
    /// first matching short name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        let index = self
            .fields
            .iter()
            .position(|f| f.qualified_name() == name)
            .or_else(|| self.fields.iter().position(|f| f.name == name))?;
        self.columns.get(index)
    }

    /// Group lengths of a repeated field, looked up like [`ReadBatch::column`].
    pub fn group_lengths(&self, name: &str) -> Option<&Int32Array> {
        let index = self
            .fields
            .iter()
            .position(|f| f.qualified_name() == name)
            .or_else(|| self.fields.iter().position(|f| f.name == name))?;
        self.group_lengths.get(index)?.as_ref()
    }
}

/// Read only the header of a stream.
pub(crate) fn probe_header(storage: &Storage, locator: &str) -> Result<Header, ReadError> {
    let mut input = BufReader::new(storage.open_input(locator)?);
    Header::read(&mut input)
}

/// Schema text stored in a stream's header, pretty-printed.
pub fn schema_text(storage: &Storage, locator: &str) -> Result<String, ReadError> {
    let header = probe_header(storage, locator)?;
    let text = header.schema_json().ok_or(SchemaError::Missing)?;
    let json: serde_json::Value = serde_json::from_str(text).map_err(SchemaError::from)?;
    Ok(serde_json::to_string_pretty(&json).map_err(SchemaError::from)?)
}

/// All header metadata of a stream, including the reserved `avro.*` keys.
pub fn metadata(storage: &Storage, locator: &str) -> Result<BTreeMap<String, String>, ReadError> {
    Ok(probe_header(storage, locator)?.metadata_strings())
}

/// The block currently being decoded.
struct OpenBlock {
    data: Cursor<Vec<u8>>,
    remaining: u64,
}

/// A live decode cursor over one stream.
pub struct Session {
    locator: String,
    header: Header,
    fields: Vec<LeafField>,
    input: BufReader<Box<dyn SeekableInput>>,
    block: Option<OpenBlock>,
    /// Offset where the current block starts.
    block_offset: u64,
    /// Offset just past the current block.
    next_offset: u64,
}

impl Session {
    /// Open a stream in two phases: probe the header on a throwaway input,
    /// then position a fresh input at the first block.
    pub fn open(storage: &Storage, locator: &str) -> Result<Self, ReadError> {
        let header = probe_header(storage, locator)?;
        let fields = flatten(&header.schema)?;

        let mut input = BufReader::new(storage.open_input(locator)?);
        input.seek(SeekFrom::Start(header.data_offset))?;
        debug!(locator, fields = fields.len(), codec = header.codec.name(), "opened session");

        let offset = header.data_offset;
        Ok(Self {
            locator: locator.to_string(),
            header,
            fields,
            input,
            block: None,
            block_offset: offset,
            next_offset: offset,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn fields(&self) -> &[LeafField] {
        &self.fields
    }

    /// Offset of the block boundary holding the next unread record.
    pub fn position(&self) -> u64 {
        match &self.block {
            Some(block) if block.remaining > 0 => self.block_offset,
            _ => self.next_offset,
        }
    }

    /// Move to the first block boundary at or after `position`.
    pub fn sync(&mut self, position: u64) -> Result<(), ReadError> {
        let target = if position <= self.header.data_offset {
            self.header.data_offset
        } else {
            find_sync(&mut self.input, &self.header.sync, position)?
        };
        self.jump(target)
    }

    /// Move to `position` verbatim, clamped to the first block.
    pub fn seek(&mut self, position: u64) -> Result<(), ReadError> {
        self.jump(position.max(self.header.data_offset))
    }

    fn jump(&mut self, target: u64) -> Result<(), ReadError> {
        self.input.seek(SeekFrom::Start(target))?;
        self.block = None;
        self.block_offset = target;
        self.next_offset = target;
        debug!(locator = %self.locator, target, "repositioned session");
        Ok(())
    }

    /// True if another record can be decoded, loading the next non-empty
    /// block when the current one is used up.
    pub fn has_next(&mut self) -> Result<bool, ReadError> {
        if matches!(&self.block, Some(block) if block.remaining > 0) {
            return Ok(true);
        }
        loop {
            let offset = self.next_offset;
            let Some(block) = read_block(&mut self.input, &self.header)? else {
                self.block = None;
                return Ok(false);
            };
            self.block_offset = offset;
            self.next_offset = self.input.stream_position()?;
            if block.count > 0 {
                self.block = Some(OpenBlock {
                    data: Cursor::new(block.data),
                    remaining: block.count,
                });
                return Ok(true);
            }
        }
    }

    /// Decode the next record. Callers check [`Session::has_next`] first.
    fn next_row(&mut self) -> Result<Value, ReadError> {
        let block = match &mut self.block {
            Some(block) if block.remaining > 0 => block,
            _ => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        };
        let row = from_avro_datum(&self.header.schema, &mut block.data, None)
            .map_err(DecodeError::from)?;
        block.remaining -= 1;
        Ok(row)
    }
}

/// Reads record streams into columns, keeping one resumable session.
#[derive(Default)]
pub struct RecordStreamReader {
    storage: Storage,
    options: ReadOptions,
    session: Option<Session>,
}

impl RecordStreamReader {
    pub fn new(storage: Storage, options: ReadOptions) -> Self {
        Self {
            storage,
            options,
            session: None,
        }
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    /// Decode up to `limit` records from `locator` into columns.
    ///
    /// With no live session for `locator` (or one that is used up), the
    /// stream is opened and synchronized to `seek` (default 0). With a live
    /// session, `seek` repositions within it according to the configured
    /// [`SeekMode`]; `None` or the session's current position continues
    /// where the previous call stopped.
    ///
    /// On error the session is closed and nothing is returned.
    pub fn read(
        &mut self,
        locator: &str,
        seek: Option<u64>,
        limit: RecordLimit,
    ) -> Result<ReadBatch, ReadError> {
        let result = self.read_inner(locator, seek, limit);
        if result.is_err() || limit == RecordLimit::All {
            self.close();
        }
        result
    }

    fn read_inner(
        &mut self,
        locator: &str,
        seek: Option<u64>,
        limit: RecordLimit,
    ) -> Result<ReadBatch, ReadError> {
        let policy = self.options.null_policy;
        let session = self.session_for(locator, seek)?;

        let mut buffers: Vec<ColumnBuffer> = session
            .fields
            .iter()
            .map(|field| ColumnBuffer::new(field, policy))
            .collect();

        let mut records = 0u64;
        while limit.allows(records) && session.has_next()? {
            let row = session.next_row()?;
            for (field, buffer) in session.fields.iter().zip(&mut buffers) {
                let value = field.extract(&row)?;
                if field.repeated {
                    buffer.append_repeated(value)?;
                } else {
                    buffer.append(value)?;
                }
            }
            records += 1;
        }
        let exhausted = !session.has_next()?;

        let (columns, group_lengths): (Vec<_>, Vec<_>) =
            buffers.into_iter().map(ColumnBuffer::finish).unzip();
        debug!(locator, records, exhausted, "read batch");
        Ok(ReadBatch {
            fields: session.fields.clone(),
            columns,
            group_lengths,
            records,
            exhausted,
            position: session.position(),
        })
    }

    /// Reuse the live session when it belongs to `locator` and has unread
    /// records; otherwise open a new one.
    fn session_for(&mut self, locator: &str, seek: Option<u64>) -> Result<&mut Session, ReadError> {
        let live = match self.session.take() {
            Some(mut session) if session.locator == locator => {
                if session.has_next()? {
                    Some(session)
                } else {
                    debug!(locator, "session used up, reopening");
                    None
                }
            }
            Some(session) => {
                debug!(from = %session.locator, to = locator, "switching session");
                None
            }
            None => None,
        };

        let session = match live {
            Some(mut session) => {
                if let Some(position) = seek.filter(|&p| p != session.position()) {
                    match self.options.seek_mode {
                        SeekMode::Exact => session.seek(position)?,
                        SeekMode::Sync => session.sync(position)?,
                    }
                }
                session
            }
            None => {
                let mut session = Session::open(&self.storage, locator)?;
                session.sync(seek.unwrap_or(0))?;
                session
            }
        };
        Ok(self.session.insert(session))
    }

    /// True while a session is open.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the live session still has unread records.
    pub fn has_remaining(&mut self) -> Result<bool, ReadError> {
        match &mut self.session {
            Some(session) => session.has_next(),
            None => Ok(false),
        }
    }

    /// Position of the live session, if any.
    pub fn position(&self) -> Option<u64> {
        self.session.as_ref().map(Session::position)
    }

    /// Release the live session and its input.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(locator = %session.locator, "closed session");
        }
    }
}
