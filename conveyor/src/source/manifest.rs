//! JSON-lines manifest source.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::source::{Error, TupleSource};
use crate::status::TotalCount;
use crate::tuple::FetchEmitTuple;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    /// Path of the manifest file, one JSON tuple per line.
    pub path: PathBuf,
}

/// Reads tuples from a JSON-lines manifest, one [`FetchEmitTuple`] per
/// line. Blank lines and `#` comments are skipped. The line count gives
/// the total-count upper bound.
pub struct ManifestSource {
    reader: BufReader<fs::File>,
    produced: u64,
    total: u64,
    done: bool,
}

impl ManifestSource {
    pub fn open(options: Options) -> Result<Self, Error> {
        // Pre-count lines for progress reporting, then rewind by reopening.
        let counting = BufReader::new(fs::File::open(&options.path)?);
        let total = counting
            .lines()
            .filter(|l| match l {
                Ok(l) => is_tuple_line(l),
                Err(_) => true,
            })
            .count() as u64;

        let reader = BufReader::new(fs::File::open(&options.path)?);
        Ok(Self {
            reader,
            produced: 0,
            total,
            done: false,
        })
    }
}

fn is_tuple_line(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && !line.starts_with('#')
}

impl TupleSource for ManifestSource {
    fn next_tuple(&mut self) -> Result<Option<FetchEmitTuple>, Error> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                self.done = true;
                return Ok(None);
            }
            if !is_tuple_line(&line) {
                continue;
            }
            let tuple: FetchEmitTuple = serde_json::from_str(line.trim())
                .map_err(|e| Error::Malformed(format!("line {}: {e}", self.produced + 1)))?;
            self.produced += 1;

            return Ok(Some(tuple));
        }
    }

    fn total_count(&self) -> TotalCount {
        if self.done {
            TotalCount::completed(self.produced)
        } else {
            TotalCount::in_progress(self.total)
        }
    }
}
