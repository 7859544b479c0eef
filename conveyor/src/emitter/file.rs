//! File-system emitter: one JSON document per emit key.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, PathBuf};

use serde::{Deserialize, Serialize};

use crate::emitter::{
    apply_aliases, apply_strategy, AttachmentStrategy, EmitRecord, Emitter, Error,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    /// Directory emit keys are resolved under.
    pub base_path: PathBuf,
    #[serde(default)]
    pub attachment_strategy: AttachmentStrategy,
    /// Field renames applied to every record before writing.
    #[serde(default)]
    pub field_aliases: BTreeMap<String, String>,
    #[serde(default = "default_pretty")]
    pub pretty: bool,
}

fn default_pretty() -> bool {
    true
}

/// Writes each emission as a JSON array of records under the base path.
pub struct FileEmitter {
    options: Options,
}

impl FileEmitter {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, Error> {
        let rel = PathBuf::from(key);
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(Error::Permanent(format!(
                "emit key `{key}` escapes the emitter base path"
            )));
        }
        Ok(self.options.base_path.join(rel))
    }
}

fn classify(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
            Error::Retryable(e.to_string())
        }
        _ => Error::Permanent(e.to_string()),
    }
}

impl Emitter for FileEmitter {
    fn emit_batch(&self, batch: &[EmitRecord]) -> Result<(), Error> {
        for record in batch {
            if record.metadata.is_empty() {
                return Err(Error::Empty(record.key.key.clone()));
            }
            let mut rows = apply_strategy(
                self.options.attachment_strategy,
                &record.container_id,
                &record.metadata,
            );
            for row in &mut rows {
                apply_aliases(&self.options.field_aliases, row);
            }

            let path = self.resolve(&record.key.key)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(classify)?;
            }
            let json = if self.options.pretty {
                serde_json::to_string_pretty(&rows)
            } else {
                serde_json::to_string(&rows)
            }
            .map_err(|e| Error::Permanent(e.to_string()))?;

            fs::write(&path, json + "\n").map_err(classify)?;
            log::trace!(target: "emitter", "Wrote {} record(s) to {}", rows.len(), path.display());
        }
        Ok(())
    }
}
