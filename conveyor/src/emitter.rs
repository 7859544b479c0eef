//! The emitter seam: write parsed metadata to a sink.

pub mod file;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metadata::{names, Metadata};
use crate::parser::ParseContext;
use crate::tuple::EmitKey;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A non-empty metadata list is required.
    #[error("empty metadata list for key `{0}`")]
    Empty(String),
    /// A transient sink failure; the orchestrator retries these.
    #[error("retryable emit failure: {0}")]
    Retryable(String),
    /// A permanent sink failure, eg. schema mismatch or authorization.
    #[error("permanent emit failure: {0}")]
    Permanent(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retryable(_))
    }
}

/// How an emitter maps a container plus embedded records onto its sink.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttachmentStrategy {
    /// Only the container is written; children are dropped.
    Skip,
    /// Children's content is concatenated onto the container's content;
    /// a single record is written.
    ConcatenateContent,
    /// All records are written, each child carrying a reference to the
    /// container's id; the sink's routing key for children is the
    /// container id.
    #[default]
    ParentChild,
    /// All records are written as independent rows; children carry a
    /// `parent` field only.
    SeparateDocuments,
}

/// One emission: a key, the id of the container record, and the parsed
/// metadata list (container first).
#[derive(Debug, Clone)]
pub struct EmitRecord {
    pub key: EmitKey,
    pub container_id: String,
    pub metadata: Vec<Metadata>,
}

impl EmitRecord {
    pub fn new(key: EmitKey, container_id: impl Into<String>, metadata: Vec<Metadata>) -> Self {
        Self {
            key,
            container_id: container_id.into(),
            metadata,
        }
    }
}

/// Writes batches of records to a sink. Instances are process-wide
/// singletons per config id and must be safe for concurrent calls.
pub trait Emitter: Send + Sync {
    /// Emit a single metadata list.
    fn emit(
        &self,
        key: &EmitKey,
        metadata: &[Metadata],
        _ctx: &ParseContext,
    ) -> Result<(), Error> {
        let container_id = metadata
            .first()
            .and_then(|m| m.get(names::RECORD_ID))
            .unwrap_or(&key.key)
            .to_owned();
        self.emit_batch(&[EmitRecord::new(key.clone(), container_id, metadata.to_vec())])
    }

    /// Emit a batch of records. Within the batch, a container precedes
    /// its children.
    fn emit_batch(&self, batch: &[EmitRecord]) -> Result<(), Error>;
}

/// Rewrite field names according to the configured alias map. This is the
/// configuration artefact for sinks that expect legacy or Dublin-Core
/// style names.
pub fn apply_aliases(aliases: &BTreeMap<String, String>, metadata: &mut Metadata) {
    for (from, to) in aliases {
        metadata.rename(from, to);
    }
}

/// Apply an attachment strategy to a parsed record list, producing the
/// records actually written to the sink. The container always comes
/// first.
pub fn apply_strategy(
    strategy: AttachmentStrategy,
    container_id: &str,
    records: &[Metadata],
) -> Vec<Metadata> {
    let Some((container, children)) = records.split_first() else {
        return Vec::new();
    };
    match strategy {
        AttachmentStrategy::Skip => {
            let mut container = container.clone();
            container.set(names::RECORD_ID, container_id);
            vec![container]
        }
        AttachmentStrategy::ConcatenateContent => {
            let mut container = container.clone();
            let mut content: Vec<String> =
                container.values(names::CONTENT).to_vec();
            for child in children {
                content.extend(child.values(names::CONTENT).iter().cloned());
            }
            container.set(names::RECORD_ID, container_id);
            container.set(names::CONTENT, content.join("\n"));
            vec![container]
        }
        AttachmentStrategy::ParentChild => {
            let mut out = Vec::with_capacity(records.len());
            let mut container = container.clone();
            container.set(names::RECORD_ID, container_id);
            // The container references itself; children reference it.
            container.set(names::PARENT_ID, container_id);
            out.push(container);

            for (ix, child) in children.iter().enumerate() {
                let mut child = child.clone();
                child.set(names::RECORD_ID, format!("{container_id}/{}", ix + 1));
                child.set(names::PARENT_ID, container_id);
                out.push(child);
            }
            out
        }
        AttachmentStrategy::SeparateDocuments => {
            let mut out = Vec::with_capacity(records.len());
            let mut container = container.clone();
            container.set(names::RECORD_ID, container_id);
            out.push(container);

            for child in children {
                let mut child = child.clone();
                child.set(names::PARENT, container_id);
                out.push(child);
            }
            out
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn records() -> Vec<Metadata> {
        let mut container = Metadata::new();
        container.add(names::CONTENT, "root");
        let mut a = Metadata::new();
        a.add(names::CONTENT, "child a");
        let mut b = Metadata::new();
        b.add(names::CONTENT, "child b");
        vec![container, a, b]
    }

    #[test]
    fn test_skip_drops_children() {
        let out = apply_strategy(AttachmentStrategy::Skip, "t-1", &records());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get(names::CONTENT), Some("root"));
    }

    #[test]
    fn test_concatenate_content() {
        let out = apply_strategy(AttachmentStrategy::ConcatenateContent, "t-1", &records());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get(names::CONTENT), Some("root\nchild a\nchild b"));
    }

    #[test]
    fn test_parent_child_references() {
        let out = apply_strategy(AttachmentStrategy::ParentChild, "t-1", &records());
        assert_eq!(out.len(), 3);
        // The container points to itself; every child points to it.
        assert_eq!(out[0].get(names::PARENT_ID), Some("t-1"));
        assert_eq!(out[0].get(names::RECORD_ID), Some("t-1"));
        for child in &out[1..] {
            assert_eq!(child.get(names::PARENT_ID), Some("t-1"));
        }
    }

    #[test]
    fn test_separate_documents_parent_field() {
        let out = apply_strategy(AttachmentStrategy::SeparateDocuments, "t-1", &records());
        assert_eq!(out.len(), 3);
        assert!(!out[0].contains(names::PARENT));
        for child in &out[1..] {
            assert_eq!(child.get(names::PARENT), Some("t-1"));
            assert!(!child.contains(names::PARENT_ID));
        }
    }

    #[test]
    fn test_aliases() {
        let mut metadata = Metadata::new();
        metadata.add("content", "x");
        let aliases = BTreeMap::from([("content".to_owned(), "dc:description".to_owned())]);

        apply_aliases(&aliases, &mut metadata);
        assert_eq!(metadata.get("dc:description"), Some("x"));
    }
}
