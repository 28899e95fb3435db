//! Local filesystem backend.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::{OutputMode, SeekableInput, StorageBackend};

/// Opens plain paths and `file://` URIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

fn local_path(locator: &str) -> &Path {
    Path::new(locator.strip_prefix("file://").unwrap_or(locator))
}

impl StorageBackend for LocalBackend {
    fn open_input(&self, locator: &str) -> io::Result<Box<dyn SeekableInput>> {
        Ok(Box::new(File::open(local_path(locator))?))
    }

    fn open_output(&self, locator: &str, mode: OutputMode) -> io::Result<Box<dyn Write + Send>> {
        let path = local_path(locator);
        let file = match mode {
            OutputMode::Create => File::create(path)?,
            OutputMode::Append => OpenOptions::new().append(true).open(path)?,
        };
        Ok(Box::new(BufWriter::new(file)))
    }
}
