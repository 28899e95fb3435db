//! In-memory backend, keyed by the full locator string.

use std::collections::HashMap;
use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{OutputMode, SeekableInput, StorageBackend};

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Stores streams in process memory. Inputs are snapshots taken at open time.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    files: Files,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, locator: &str, data: Vec<u8>) {
        lock(&self.files).insert(locator.to_string(), data);
    }

    pub fn get(&self, locator: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(locator).cloned()
    }
}

fn lock(files: &Files) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
    files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn not_found(locator: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{locator} does not exist"))
}

impl StorageBackend for MemoryBackend {
    fn open_input(&self, locator: &str) -> io::Result<Box<dyn SeekableInput>> {
        let data = self.get(locator).ok_or_else(|| not_found(locator))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_output(&self, locator: &str, mode: OutputMode) -> io::Result<Box<dyn Write + Send>> {
        let mut files = lock(&self.files);
        match mode {
            OutputMode::Create => {
                files.insert(locator.to_string(), Vec::new());
            }
            OutputMode::Append if !files.contains_key(locator) => return Err(not_found(locator)),
            OutputMode::Append => {}
        }
        Ok(Box::new(MemoryOutput {
            locator: locator.to_string(),
            files: self.files.clone(),
        }))
    }
}

/// Write-through output into the shared map.
struct MemoryOutput {
    locator: String,
    files: Files,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.files)
            .entry(self.locator.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
