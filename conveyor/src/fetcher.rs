//! The fetcher seam: given a fetch key, produce a byte stream.

pub mod file;

use std::io;
use std::io::Read;
use std::path::Path;

use crate::metadata::Metadata;
use crate::parser::ParseContext;
use crate::temp;
use crate::tuple::FetchKey;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The underlying store reports the object absent. Terminal for the
    /// tuple; never retried.
    #[error("object not found: {0}")]
    NotFound(String),
    /// Any other read failure. The orchestrator owns the retry policy.
    #[error("fetch failed: {0}")]
    Fetch(#[from] io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Fetches bytes for a key. Instances are process-wide singletons per
/// config id and must be safe for concurrent calls from any worker.
pub trait Fetcher: Send + Sync {
    /// Fetch the named bytes. The fetcher may annotate `metadata` with
    /// server-side attributes. The returned stream is read-once and is
    /// released by dropping it.
    fn fetch(
        &self,
        key: &FetchKey,
        metadata: &mut Metadata,
        ctx: &ParseContext,
    ) -> Result<FetchStream, Error>;
}

/// A read-once byte stream handed from fetcher to parser.
///
/// Spooled streams are backed by a scoped temp file whose deletion is tied
/// to this value's drop; `path()` exposes the backing file so oversized
/// bodies can be passed to a child process by reference.
pub struct FetchStream {
    inner: Box<dyn Read + Send>,
    spooled: Option<temp::ScopedFile>,
}

impl std::fmt::Debug for FetchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchStream")
            .field("spooled", &self.spooled.is_some())
            .finish()
    }
}

impl FetchStream {
    pub fn from_reader(reader: Box<dyn Read + Send>) -> Self {
        Self {
            inner: reader,
            spooled: None,
        }
    }

    /// A stream backed by a scoped temp file.
    pub fn from_spooled(file: temp::ScopedFile) -> Result<Self, Error> {
        let reader = file.reopen()?;
        Ok(Self {
            inner: Box::new(reader),
            spooled: Some(file),
        })
    }

    /// Path of the backing file, when the stream is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.spooled.as_ref().map(temp::ScopedFile::path)
    }

    /// Drain the stream into memory.
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.inner.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for FetchStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}
