//! Directory-walk source.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::source::{Error, TupleSource};
use crate::status::TotalCount;
use crate::tuple::{EmitKey, FetchEmitTuple, FetchKey, OnParseError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    /// Directory to walk.
    pub base_path: PathBuf,
    /// Fetcher the produced fetch keys are routed to.
    pub fetcher_id: String,
    /// Emitter the produced emit keys are routed to.
    pub emitter_id: String,
    /// Appended to each relative path to form the emit key.
    #[serde(default = "default_suffix")]
    pub suffix: String,
    #[serde(default)]
    pub on_parse_error: OnParseError,
}

fn default_suffix() -> String {
    ".json".to_owned()
}

/// Walks a directory tree in sorted order, producing one tuple per file.
/// The fetch key is the path relative to the base; the emit key is the
/// same path with the configured suffix appended.
pub struct WalkSource {
    options: Options,
    queue: VecDeque<String>,
    total: u64,
}

impl WalkSource {
    pub fn open(options: Options) -> Result<Self, Error> {
        let mut paths = Vec::new();
        collect(&options.base_path, &options.base_path, &mut paths)?;
        paths.sort();

        let total = paths.len() as u64;
        Ok(Self {
            options,
            queue: paths.into(),
            total,
        })
    }
}

fn collect(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect(base, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(base) {
            out.push(rel.to_string_lossy().into_owned());
        }
    }
    Ok(())
}

impl TupleSource for WalkSource {
    fn next_tuple(&mut self) -> Result<Option<FetchEmitTuple>, Error> {
        let Some(rel) = self.queue.pop_front() else {
            return Ok(None);
        };
        let mut tuple = FetchEmitTuple::new(
            rel.clone(),
            FetchKey::new(&self.options.fetcher_id, &rel),
            EmitKey::new(
                &self.options.emitter_id,
                format!("{rel}{}", self.options.suffix),
            ),
        );
        tuple.on_parse_error = self.options.on_parse_error;

        Ok(Some(tuple))
    }

    fn total_count(&self) -> TotalCount {
        if self.queue.is_empty() {
            TotalCount::completed(self.total)
        } else {
            TotalCount::in_progress(self.total)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_walk_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"c").unwrap();

        let mut source = WalkSource::open(Options {
            base_path: dir.path().to_path_buf(),
            fetcher_id: "fs".to_owned(),
            emitter_id: "out".to_owned(),
            suffix: ".json".to_owned(),
            on_parse_error: OnParseError::Emit,
        })
        .unwrap();

        assert_eq!(source.total_count(), TotalCount::in_progress(3));

        let mut seen = Vec::new();
        while let Some(t) = source.next_tuple().unwrap() {
            assert_eq!(t.fetch_key.fetcher_id, "fs");
            assert_eq!(t.emit_key.key, format!("{}.json", t.fetch_key.key));
            seen.push(t.id);
        }
        assert_eq!(seen, vec!["a.txt", "b.txt", "sub/c.txt"]);
        assert_eq!(source.total_count(), TotalCount::completed(3));
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = WalkSource::open(Options {
            base_path: dir.path().to_path_buf(),
            fetcher_id: "fs".to_owned(),
            emitter_id: "out".to_owned(),
            suffix: ".json".to_owned(),
            on_parse_error: OnParseError::Emit,
        })
        .unwrap();

        assert!(source.next_tuple().unwrap().is_none());
    }
}
