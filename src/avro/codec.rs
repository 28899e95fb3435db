//! Block compression codecs for object container files.
//!
//! - Snappy via the `snap` crate, followed by a big-endian CRC-32 of the
//!   uncompressed block.
//! - Deflate (raw, no zlib header) via `flate2`.
//! - Xz via `xz2`, bzip2 via `bzip2`.

use std::io::{Read, Write};

use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::debug;

use crate::avro::reader::DecodeError;
use crate::avro::writer::EncodeError;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Deflate level used when the caller passes -1.
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

/// Codec family selected by name, before a level is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Null,
    Snappy,
    Deflate,
    Xz,
    Bzip2,
}

impl CodecKind {
    /// Resolve a user-supplied codec name. Never fails: unknown names fall
    /// back to snappy.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "none" | "null" => CodecKind::Null,
            "snappy" => CodecKind::Snappy,
            "deflate" => CodecKind::Deflate,
            "xz" => CodecKind::Xz,
            "bzip2" => CodecKind::Bzip2,
            other => {
                debug!(codec = other, "unrecognized codec name, using snappy");
                CodecKind::Snappy
            }
        }
    }

    /// Attach a compression level. Only deflate and xz look at it.
    pub fn with_level(self, level: i32) -> Result<Codec, EncodeError> {
        let invalid = || EncodeError::InvalidCodecLevel {
            codec: self.name(),
            level,
        };
        Ok(match self {
            CodecKind::Null => Codec::Null,
            CodecKind::Snappy => Codec::Snappy,
            CodecKind::Bzip2 => Codec::Bzip2,
            CodecKind::Deflate => match level {
                -1 => Codec::Deflate(DEFAULT_DEFLATE_LEVEL),
                0..=9 => Codec::Deflate(level as u32),
                _ => return Err(invalid()),
            },
            CodecKind::Xz => match level {
                0..=9 => Codec::Xz(level as u32),
                _ => return Err(invalid()),
            },
        })
    }

    /// Name stored under `avro.codec`.
    pub fn name(self) -> &'static str {
        match self {
            CodecKind::Null => "null",
            CodecKind::Snappy => "snappy",
            CodecKind::Deflate => "deflate",
            CodecKind::Xz => "xz",
            CodecKind::Bzip2 => "bzip2",
        }
    }
}

/// A concrete codec, including its level where one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Null,
    Snappy,
    Deflate(u32),
    Xz(u32),
    Bzip2,
}

impl Codec {
    /// Codec named in a stream header. A missing entry means `null`.
    pub fn from_header(name: Option<&str>) -> Result<Self, DecodeError> {
        match name {
            None | Some("null") => Ok(Codec::Null),
            Some("snappy") => Ok(Codec::Snappy),
            Some("deflate") => Ok(Codec::Deflate(DEFAULT_DEFLATE_LEVEL)),
            Some("xz") => Ok(Codec::Xz(6)),
            Some("bzip2") => Ok(Codec::Bzip2),
            Some(other) => Err(DecodeError::UnsupportedCodec(other.to_string())),
        }
    }

    pub fn kind(&self) -> CodecKind {
        match self {
            Codec::Null => CodecKind::Null,
            Codec::Snappy => CodecKind::Snappy,
            Codec::Deflate(_) => CodecKind::Deflate,
            Codec::Xz(_) => CodecKind::Xz,
            Codec::Bzip2 => CodecKind::Bzip2,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Compress one block payload.
    pub fn compress(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Codec::Null => Ok(input.to_vec()),
            Codec::Snappy => {
                let mut out = snap::raw::Encoder::new()
                    .compress_vec(input)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                out.extend_from_slice(&CRC32.checksum(input).to_be_bytes());
                Ok(out)
            }
            Codec::Deflate(level) => {
                let mut encoder = flate2::write::DeflateEncoder::new(
                    Vec::with_capacity(input.len()),
                    flate2::Compression::new(*level),
                );
                encoder.write_all(input)?;
                encoder.finish()
            }
            Codec::Xz(level) => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), *level);
                encoder.write_all(input)?;
                encoder.finish()
            }
            Codec::Bzip2 => {
                let mut encoder =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
                encoder.write_all(input)?;
                encoder.finish()
            }
        }
    }

    /// Decompress one block payload.
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let codec_error = |e: std::io::Error| DecodeError::Codec {
            codec: self.name(),
            message: e.to_string(),
        };
        match self {
            Codec::Null => Ok(input.to_vec()),
            Codec::Snappy => {
                if input.len() < 4 {
                    return Err(DecodeError::Codec {
                        codec: "snappy",
                        message: format!("block of {} bytes has no checksum", input.len()),
                    });
                }
                let (payload, trailer) = input.split_at(input.len() - 4);
                let out = snap::raw::Decoder::new()
                    .decompress_vec(payload)
                    .map_err(|e| DecodeError::Codec {
                        codec: "snappy",
                        message: e.to_string(),
                    })?;
                let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
                let actual = CRC32.checksum(&out);
                if expected != actual {
                    return Err(DecodeError::ChecksumMismatch { expected, actual });
                }
                Ok(out)
            }
            Codec::Deflate(_) => {
                let mut out = Vec::new();
                flate2::read::DeflateDecoder::new(input)
                    .read_to_end(&mut out)
                    .map_err(codec_error)?;
                Ok(out)
            }
            Codec::Xz(_) => {
                let mut out = Vec::new();
                xz2::read::XzDecoder::new(input)
                    .read_to_end(&mut out)
                    .map_err(codec_error)?;
                Ok(out)
            }
            Codec::Bzip2 => {
                let mut out = Vec::new();
                bzip2::read::BzDecoder::new(input)
                    .read_to_end(&mut out)
                    .map_err(codec_error)?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog "
            .iter()
            .copied()
            .cycle()
            .take(4096)
            .collect()
    }

    mod names {
        use super::*;

        #[test]
        fn test_known_names() {
            assert_eq!(CodecKind::from_name("none"), CodecKind::Null);
            assert_eq!(CodecKind::from_name("SNAPPY"), CodecKind::Snappy);
            assert_eq!(CodecKind::from_name("Deflate"), CodecKind::Deflate);
            assert_eq!(CodecKind::from_name("xz"), CodecKind::Xz);
            assert_eq!(CodecKind::from_name("bzip2"), CodecKind::Bzip2);
        }

        #[test]
        fn test_unknown_name_falls_back_to_snappy() {
            assert_eq!(CodecKind::from_name("foo"), CodecKind::Snappy);
            assert_eq!(
                CodecKind::from_name("foo").with_level(6).unwrap(),
                CodecKind::from_name("snappy").with_level(6).unwrap()
            );
        }

        #[test]
        fn test_levels() {
            assert_eq!(CodecKind::Deflate.with_level(-1).unwrap(), Codec::Deflate(6));
            assert_eq!(CodecKind::Deflate.with_level(9).unwrap(), Codec::Deflate(9));
            assert!(CodecKind::Deflate.with_level(10).is_err());
            assert!(CodecKind::Xz.with_level(-1).is_err());
            // Level is ignored where it does not apply.
            assert_eq!(CodecKind::Snappy.with_level(42).unwrap(), Codec::Snappy);
        }

        #[test]
        fn test_header_names() {
            assert_eq!(Codec::from_header(None).unwrap(), Codec::Null);
            assert_eq!(Codec::from_header(Some("bzip2")).unwrap(), Codec::Bzip2);
            assert!(matches!(
                Codec::from_header(Some("zstandard")),
                Err(DecodeError::UnsupportedCodec(_))
            ));
        }
    }

    mod roundtrip {
        use super::*;

        #[test]
        fn test_every_codec_restores_input() {
            let input = sample();
            for codec in [
                Codec::Null,
                Codec::Snappy,
                Codec::Deflate(1),
                Codec::Xz(3),
                Codec::Bzip2,
            ] {
                let packed = codec.compress(&input).unwrap();
                assert_eq!(codec.decompress(&packed).unwrap(), input, "{codec:?}");
            }
        }

        #[test]
        fn test_snappy_checksum_is_verified() {
            let mut packed = Codec::Snappy.compress(&sample()).unwrap();
            let last = packed.len() - 1;
            packed[last] ^= 0xFF;
            assert!(matches!(
                Codec::Snappy.decompress(&packed),
                Err(DecodeError::ChecksumMismatch { .. })
            ));
        }

        #[test]
        fn test_truncated_snappy_block() {
            assert!(Codec::Snappy.decompress(&[1, 2]).is_err());
        }
    }
}
