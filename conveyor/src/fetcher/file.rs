//! File-system fetcher.

use std::fs;
use std::io;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fetcher::{Error, FetchStream, Fetcher};
use crate::metadata::{names, Metadata};
use crate::parser::ParseContext;
use crate::temp::RunDir;
use crate::tuple::FetchKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    /// Directory fetch keys are resolved under.
    pub base_path: PathBuf,
    /// Copy the object to a scoped temp file before parsing. Enables
    /// seeking and pass-by-path to child processes.
    #[serde(default)]
    pub spool_to_temp: bool,
    /// Annotate metadata with file attributes (size, modified time).
    #[serde(default)]
    pub extract_file_metadata: bool,
}

/// Fetches objects from the local file system, rooted at a base path.
pub struct FileFetcher {
    options: Options,
    temp: Arc<RunDir>,
}

impl FileFetcher {
    pub fn new(options: Options, temp: Arc<RunDir>) -> Self {
        Self { options, temp }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, Error> {
        let base = self
            .options
            .base_path
            .canonicalize()
            .map_err(|_| Error::NotFound(self.options.base_path.display().to_string()))?;
        let path = base.join(key);
        let path = path
            .canonicalize()
            .map_err(|_| Error::NotFound(key.to_owned()))?;

        if !path.starts_with(&base) {
            return Err(Error::Fetch(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("key `{key}` escapes the fetcher base path"),
            )));
        }
        Ok(path)
    }
}

impl Fetcher for FileFetcher {
    fn fetch(
        &self,
        key: &FetchKey,
        metadata: &mut Metadata,
        _ctx: &ParseContext,
    ) -> Result<FetchStream, Error> {
        let path = self.resolve(&key.key)?;
        let mut file = fs::File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(key.key.clone())
            } else {
                Error::Fetch(e)
            }
        })?;

        if !metadata.contains(names::RESOURCE_NAME) {
            if let Some(name) = path.file_name() {
                metadata.add(names::RESOURCE_NAME, name.to_string_lossy());
            }
        }

        let attrs = file.metadata().map_err(Error::Fetch)?;
        let length = match key.range {
            Some(range) => {
                file.seek(SeekFrom::Start(range.start))?;
                range.len().min(attrs.len().saturating_sub(range.start))
            }
            None => attrs.len(),
        };

        if self.options.extract_file_metadata {
            metadata.add(names::CONTENT_LENGTH, length.to_string());
            if let Ok(modified) = attrs.modified() {
                let modified: chrono::DateTime<chrono::Utc> = modified.into();
                metadata.add(names::MODIFIED, modified.to_rfc3339());
            }
        }

        let mut reader = file.take(length);
        if self.options.spool_to_temp {
            let spooled = self.temp.spool(&mut reader).map_err(Error::Fetch)?;
            FetchStream::from_spooled(spooled)
        } else {
            Ok(FetchStream::from_reader(Box::new(reader)))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Arc<RunDir>) {
        let dir = tempfile::tempdir().unwrap();
        let temp = Arc::new(RunDir::create(dir.path().join("tmp").as_path()).unwrap());
        (dir, temp)
    }

    #[test]
    fn test_fetch_whole_file() {
        let (dir, temp) = fixture();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let fetcher = FileFetcher::new(
            Options {
                base_path: dir.path().to_path_buf(),
                spool_to_temp: false,
                extract_file_metadata: true,
            },
            temp,
        );
        let mut metadata = Metadata::new();
        let key = FetchKey::new("fs", "a.txt");
        let stream = fetcher
            .fetch(&key, &mut metadata, &ParseContext::default())
            .unwrap();

        assert_eq!(stream.into_bytes().unwrap(), b"hello");
        assert_eq!(metadata.get(names::RESOURCE_NAME), Some("a.txt"));
        assert_eq!(metadata.get(names::CONTENT_LENGTH), Some("5"));
    }

    #[test]
    fn test_fetch_byte_range() {
        let (dir, temp) = fixture();
        fs::write(dir.path().join("r.txt"), b"0123456789").unwrap();

        let fetcher = FileFetcher::new(
            Options {
                base_path: dir.path().to_path_buf(),
                spool_to_temp: false,
                extract_file_metadata: false,
            },
            temp,
        );
        let key = FetchKey::new("fs", "r.txt").with_range(2, 5);
        let stream = fetcher
            .fetch(&key, &mut Metadata::new(), &ParseContext::default())
            .unwrap();

        // Inclusive on both ends.
        assert_eq!(stream.into_bytes().unwrap(), b"2345");
    }

    #[test]
    fn test_spooled_stream_has_path() {
        let (dir, temp) = fixture();
        fs::write(dir.path().join("s.txt"), b"spool me").unwrap();

        let fetcher = FileFetcher::new(
            Options {
                base_path: dir.path().to_path_buf(),
                spool_to_temp: true,
                extract_file_metadata: false,
            },
            temp,
        );
        let key = FetchKey::new("fs", "s.txt");
        let stream = fetcher
            .fetch(&key, &mut Metadata::new(), &ParseContext::default())
            .unwrap();
        let path = stream.path().unwrap().to_path_buf();

        assert!(path.exists());
        assert_eq!(stream.into_bytes().unwrap(), b"spool me");
    }

    #[test]
    fn test_not_found() {
        let (dir, temp) = fixture();
        let fetcher = FileFetcher::new(
            Options {
                base_path: dir.path().to_path_buf(),
                spool_to_temp: false,
                extract_file_metadata: false,
            },
            temp,
        );
        let key = FetchKey::new("fs", "missing.txt");
        let err = fetcher
            .fetch(&key, &mut Metadata::new(), &ParseContext::default())
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[test]
    fn test_traversal_rejected() {
        let (dir, temp) = fixture();
        let inner = dir.path().join("inner");
        fs::create_dir(&inner).unwrap();
        fs::write(dir.path().join("secret.txt"), b"no").unwrap();

        let fetcher = FileFetcher::new(
            Options {
                base_path: inner,
                spool_to_temp: false,
                extract_file_metadata: false,
            },
            temp,
        );
        let key = FetchKey::new("fs", "../secret.txt");
        let err = fetcher
            .fetch(&key, &mut Metadata::new(), &ParseContext::default())
            .unwrap_err();

        assert!(!err.is_not_found());
    }
}
