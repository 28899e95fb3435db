//! Storage abstraction for opening record streams by locator.
//!
//! A locator is either a plain path, a `file://` URI, or a URI whose scheme
//! has a backend registered with [`Storage::with_backend`] (for example a
//! distributed filesystem under `hdfs://`).

pub mod local;
pub mod memory;

use std::collections::HashMap;
use std::io::{self, Read, Seek, Write};
use std::sync::Arc;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

/// Random-access input a record stream can be decoded from.
pub trait SeekableInput: Read + Seek + Send {}

impl<T: Read + Seek + Send> SeekableInput for T {}

/// How an output stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Create or truncate.
    Create,
    /// Append to an existing stream.
    Append,
}

/// A storage backend able to open inputs and outputs for its locators.
pub trait StorageBackend: Send + Sync {
    /// Open a seekable input positioned at the start.
    fn open_input(&self, locator: &str) -> io::Result<Box<dyn SeekableInput>>;

    /// Open an output stream.
    fn open_output(&self, locator: &str, mode: OutputMode) -> io::Result<Box<dyn Write + Send>>;
}

/// Scheme-based dispatch over storage backends.
#[derive(Clone)]
pub struct Storage {
    local: Arc<dyn StorageBackend>,
    schemes: HashMap<String, Arc<dyn StorageBackend>>,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            local: Arc::new(LocalBackend),
            schemes: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.schemes.keys().collect();
        schemes.sort();
        f.debug_struct("Storage").field("schemes", &schemes).finish()
    }
}

impl Storage {
    /// Storage with only the local filesystem backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend for locators of the form `scheme://...`.
    pub fn with_backend(mut self, scheme: &str, backend: Arc<dyn StorageBackend>) -> Self {
        self.schemes.insert(scheme.to_ascii_lowercase(), backend);
        self
    }

    pub fn open_input(&self, locator: &str) -> io::Result<Box<dyn SeekableInput>> {
        self.backend_for(locator)?.open_input(locator)
    }

    pub fn open_output(
        &self,
        locator: &str,
        mode: OutputMode,
    ) -> io::Result<Box<dyn Write + Send>> {
        self.backend_for(locator)?.open_output(locator, mode)
    }

    fn backend_for(&self, locator: &str) -> io::Result<&dyn StorageBackend> {
        match scheme_of(locator) {
            None | Some("file") => Ok(self.local.as_ref()),
            Some(scheme) => self
                .schemes
                .get(&scheme.to_ascii_lowercase())
                .map(|b| b.as_ref())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("no storage backend registered for scheme '{scheme}'"),
                    )
                }),
        }
    }
}

/// URI scheme of a locator, if it has one.
pub fn scheme_of(locator: &str) -> Option<&str> {
    let (scheme, _) = locator.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}
