//! Parquet output format implementation.

use std::fs::File;
use std::path::Path;

use arrow::datatypes::SchemaRef;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use super::{to_record_batch, OutputError};
use crate::avro::ReadBatch;

/// Writes successive read batches into one Parquet file.
///
/// The Arrow schema is taken from the first batch written.
pub struct ParquetWriter {
    file: Option<File>,
    writer: Option<ArrowWriter<File>>,
    rows: usize,
}

impl ParquetWriter {
    /// Create the output file.
    pub fn create(path: &Path) -> Result<Self, OutputError> {
        Ok(Self {
            file: Some(File::create(path)?),
            writer: None,
            rows: 0,
        })
    }

    fn writer_for(&mut self, schema: SchemaRef) -> Result<&mut ArrowWriter<File>, OutputError> {
        if let Some(file) = self.file.take() {
            let props = WriterProperties::builder()
                .set_compression(Compression::ZSTD(Default::default()))
                .build();
            self.writer = Some(ArrowWriter::try_new(file, schema, Some(props))?);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("parquet writer already closed").into())
    }

    /// Write one batch. Empty batches are skipped.
    pub fn write_batch(&mut self, batch: &ReadBatch) -> Result<(), OutputError> {
        if batch.records == 0 {
            return Ok(());
        }
        let record_batch = to_record_batch(batch)?;
        self.writer_for(record_batch.schema())?.write(&record_batch)?;
        self.rows += record_batch.num_rows();
        Ok(())
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Finish writing. Returns the number of rows written. When nothing was
    /// written the output file is left empty.
    pub fn finish(self) -> Result<usize, OutputError> {
        if let Some(writer) = self.writer {
            writer.close()?;
        }
        Ok(self.rows)
    }
}
