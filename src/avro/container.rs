//! Object container file framing.
//!
//! ```text
//! header: "Obj\x01" | metadata map<bytes> | sync[16]
//! block:  count:long | size:long | payload[size] | sync[16]
//! ```
//!
//! Datum encoding inside a block payload is handled by `apache-avro`; this
//! module only deals with the header, block boundaries and sync markers.

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use apache_avro::Schema;
use tracing::trace;

use crate::avro::codec::Codec;
use crate::avro::reader::{DecodeError, ReadError};
use crate::avro::schema::SchemaError;
use crate::avro::writer::{EncodeError, WriteError};

pub const MAGIC: [u8; 4] = *b"Obj\x01";
pub const SYNC_SIZE: usize = 16;
pub const SCHEMA_KEY: &str = "avro.schema";
pub const CODEC_KEY: &str = "avro.codec";
const RESERVED_PREFIX: &str = "avro.";

const SCAN_CHUNK: usize = 64 * 1024;

pub type SyncMarker = [u8; SYNC_SIZE];

/// Parsed stream header.
#[derive(Debug, Clone)]
pub struct Header {
    pub schema: Schema,
    pub codec: Codec,
    /// All metadata entries, including the reserved `avro.*` keys.
    pub metadata: BTreeMap<String, Vec<u8>>,
    pub sync: SyncMarker,
    /// Offset of the first block.
    pub data_offset: u64,
}

impl Header {
    /// Build the header for a new stream.
    pub fn create(
        schema_text: &str,
        schema: Schema,
        codec: Codec,
        user_metadata: &[(String, String)],
    ) -> Result<Self, WriteError> {
        let mut metadata = BTreeMap::new();
        for (key, value) in user_metadata {
            if key.starts_with(RESERVED_PREFIX) {
                return Err(EncodeError::ReservedMetadataKey(key.clone()).into());
            }
            metadata.insert(key.clone(), value.clone().into_bytes());
        }

        // Store the caller's schema compacted but otherwise untouched.
        let compact = serde_json::from_str::<serde_json::Value>(schema_text)
            .map_err(SchemaError::from)?
            .to_string();
        metadata.insert(SCHEMA_KEY.to_string(), compact.into_bytes());
        metadata.insert(CODEC_KEY.to_string(), codec.name().as_bytes().to_vec());

        Ok(Self {
            schema,
            codec,
            metadata,
            sync: rand::random(),
            data_offset: 0,
        })
    }

    /// Read a header from the start of a stream, leaving the input positioned
    /// at the first block.
    pub fn read<R: Read + Seek>(input: &mut R) -> Result<Self, ReadError> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(DecodeError::BadMagic(magic).into());
        }

        let mut metadata = BTreeMap::new();
        loop {
            let mut count = read_long(input)?;
            if count == 0 {
                break;
            }
            if count < 0 {
                count = -count;
                // Block byte size, unused here.
                read_long(input)?;
            }
            for _ in 0..count {
                let key = String::from_utf8(read_metadata_bytes(input)?)
                    .map_err(|e| DecodeError::InvalidMetadata(e.to_string()))?;
                let value = read_metadata_bytes(input)?;
                metadata.insert(key, value);
            }
        }

        let mut sync = [0u8; SYNC_SIZE];
        input.read_exact(&mut sync)?;
        let data_offset = input.stream_position()?;

        let schema_bytes = metadata.get(SCHEMA_KEY).ok_or(SchemaError::Missing)?;
        let schema_text = std::str::from_utf8(schema_bytes)
            .map_err(|e| DecodeError::InvalidMetadata(e.to_string()))?;
        let schema = Schema::parse_str(schema_text).map_err(SchemaError::from)?;

        let codec_name = metadata
            .get(CODEC_KEY)
            .map(|v| String::from_utf8_lossy(v).into_owned());
        let codec = Codec::from_header(codec_name.as_deref())?;

        Ok(Self {
            schema,
            codec,
            metadata,
            sync,
            data_offset,
        })
    }

    /// Encode this header.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_all(&MAGIC)?;
        if !self.metadata.is_empty() {
            write_long(&mut out, self.metadata.len() as i64)?;
            for (key, value) in &self.metadata {
                write_bytes(&mut out, key.as_bytes())?;
                write_bytes(&mut out, value)?;
            }
        }
        write_long(&mut out, 0)?;
        out.write_all(&self.sync)?;
        Ok(out)
    }

    /// Schema JSON exactly as stored in the header.
    pub fn schema_json(&self) -> Option<&str> {
        self.metadata
            .get(SCHEMA_KEY)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Metadata values decoded as UTF-8 strings.
    pub fn metadata_strings(&self) -> BTreeMap<String, String> {
        self.metadata
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect()
    }
}

/// A decompressed block, not yet decoded into records.
#[derive(Debug)]
pub struct Block {
    pub count: u64,
    pub data: Vec<u8>,
}

/// Read the next block. Returns `None` at a clean end of stream.
pub fn read_block<R: Read>(input: &mut R, header: &Header) -> Result<Option<Block>, ReadError> {
    let Some(count) = read_long_or_eof(input)? else {
        return Ok(None);
    };
    let size = read_long(input)?;
    if count < 0 || size < 0 {
        return Err(DecodeError::InvalidBlock { count, size }.into());
    }

    // Bounded by the bytes actually present.
    let mut payload = Vec::new();
    input.by_ref().take(size as u64).read_to_end(&mut payload)?;
    if payload.len() as u64 != size as u64 {
        return Err(DecodeError::InvalidBlock { count, size }.into());
    }
    let mut marker = [0u8; SYNC_SIZE];
    input.read_exact(&mut marker)?;
    if marker != header.sync {
        return Err(DecodeError::SyncMismatch.into());
    }

    trace!(count, size, "read block");
    let data = header.codec.decompress(&payload)?;
    Ok(Some(Block {
        count: count as u64,
        data,
    }))
}

/// Write one block of already-encoded records.
pub fn write_block<W: Write + ?Sized>(
    out: &mut W,
    codec: &Codec,
    sync: &SyncMarker,
    count: u64,
    data: &[u8],
) -> io::Result<()> {
    let payload = codec.compress(data)?;
    write_long(out, count as i64)?;
    write_long(out, payload.len() as i64)?;
    out.write_all(&payload)?;
    out.write_all(sync)?;
    trace!(count, size = payload.len(), "wrote block");
    Ok(())
}

/// Find the first block boundary at or after `position`.
///
/// Scans for the sync marker starting early enough that a marker ending
/// exactly at `position` is found. Returns the end of the input when no
/// further marker exists, including when `position` is past the end.
pub fn find_sync<R: Read + Seek>(
    input: &mut R,
    sync: &SyncMarker,
    position: u64,
) -> io::Result<u64> {
    let end = input.seek(SeekFrom::End(0))?;
    let mut window_start = position.saturating_sub(SYNC_SIZE as u64).min(end);
    input.seek(SeekFrom::Start(window_start))?;

    let mut window: Vec<u8> = Vec::with_capacity(SCAN_CHUNK + SYNC_SIZE);
    let mut chunk = vec![0u8; SCAN_CHUNK];
    loop {
        let n = input.read(&mut chunk)?;
        if n == 0 {
            return Ok(window_start + window.len() as u64);
        }
        window.extend_from_slice(&chunk[..n]);
        if let Some(i) = window.windows(SYNC_SIZE).position(|w| w == sync.as_slice()) {
            return Ok(window_start + (i + SYNC_SIZE) as u64);
        }
        let keep = window.len().min(SYNC_SIZE - 1);
        let consumed = window.len() - keep;
        window.drain(..consumed);
        window_start += consumed as u64;
    }
}

/// Write a zigzag varint long.
pub fn write_long<W: Write + ?Sized>(out: &mut W, value: i64) -> io::Result<()> {
    let mut zz = ((value << 1) ^ (value >> 63)) as u64;
    let mut buf = [0u8; 10];
    let mut i = 0;
    while zz & !0x7F != 0 {
        buf[i] = ((zz & 0x7F) as u8) | 0x80;
        i += 1;
        zz >>= 7;
    }
    buf[i] = zz as u8;
    out.write_all(&buf[..=i])
}

fn write_bytes<W: Write + ?Sized>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_long(out, bytes.len() as i64)?;
    out.write_all(bytes)
}

/// Read a zigzag varint long.
pub fn read_long<R: Read + ?Sized>(input: &mut R) -> io::Result<i64> {
    read_long_or_eof(input)?.ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
}

/// Like [`read_long`], but a clean end of input before the first byte
/// yields `None`.
fn read_long_or_eof<R: Read + ?Sized>(input: &mut R) -> io::Result<Option<i64>> {
    let mut value: u64 = 0;
    let mut shift = 0;
    let mut byte = [0u8; 1];
    loop {
        match input.read(&mut byte) {
            Ok(0) if shift == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        value |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflows i64"));
        }
    }
    Ok(Some((value >> 1) as i64 ^ -((value & 1) as i64)))
}

/// Read a length-prefixed metadata key or value.
fn read_metadata_bytes<R: Read>(input: &mut R) -> Result<Vec<u8>, ReadError> {
    let len = read_long(input)?;
    let len = u64::try_from(len)
        .map_err(|_| DecodeError::InvalidMetadata(format!("negative length {len}")))?;
    let mut buf = Vec::new();
    input.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(DecodeError::InvalidMetadata(format!(
            "length {len} runs past the end of the header"
        ))
        .into());
    }
    Ok(buf)
}
