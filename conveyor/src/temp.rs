//! Scoped temporary-file discipline.
//!
//! Spooled streams and oversized parse bodies live in a per-run directory.
//! Files are deleted when their stream is dropped, the directory when the
//! run ends. A startup sweep removes directories left behind by crashed
//! runs once they are older than the retention window.

use std::fs;
use std::io;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::{NamedTempFile, TempDir};

/// Prefix of run-scoped directories, used by the crash-recovery sweep.
pub const RUN_DIR_PREFIX: &str = "conveyor-run-";

/// A per-run temporary directory. Dropping it removes the directory and
/// everything in it.
pub struct RunDir {
    dir: TempDir,
}

impl RunDir {
    /// Create a fresh run directory under `base`.
    pub fn create(base: &Path) -> io::Result<Self> {
        fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new()
            .prefix(RUN_DIR_PREFIX)
            .tempdir_in(base)?;

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy the reader into a new scoped file. The file is deleted when the
    /// returned handle is dropped.
    pub fn spool(&self, reader: &mut dyn Read) -> io::Result<ScopedFile> {
        let mut file = NamedTempFile::new_in(self.dir.path())?;
        io::copy(reader, &mut file)?;
        file.flush()?;

        Ok(ScopedFile { file })
    }

    /// Write the given bytes into a new scoped file.
    pub fn write(&self, bytes: &[u8]) -> io::Result<ScopedFile> {
        self.spool(&mut io::Cursor::new(bytes))
    }

    /// Remove the directory now rather than on drop.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()?;
        Ok(())
    }
}

/// A temporary file scoped to a run directory; deleted on drop.
pub struct ScopedFile {
    file: NamedTempFile,
}

impl ScopedFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Open an independent read handle positioned at the start.
    pub fn reopen(&self) -> io::Result<fs::File> {
        Ok(self.file.reopen()?)
    }
}

/// Remove stale run directories under `base` older than `retention`.
/// Returns the number of directories removed.
pub fn sweep(base: &Path, retention: Duration) -> io::Result<usize> {
    let mut removed = 0;
    let entries = match fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let now = SystemTime::now();

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(RUN_DIR_PREFIX) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_dir() {
            continue;
        }
        let age = now
            .duration_since(metadata.modified()?)
            .unwrap_or_default();
        if age >= retention {
            log::debug!(target: "temp", "Removing stale run directory {}..", entry.path().display());
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Resolve the temp base directory: the configured path, or the system
/// temp directory.
pub fn base_dir(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir)
}
