//! Units of work flowing through the pipeline.

use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// An inclusive byte range within a source object, for sources where a
/// single object holds many logical documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end offset.
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Names the bytes to retrieve and the fetcher to retrieve them with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchKey {
    /// Id of the fetcher instance to use.
    pub fetcher_id: String,
    /// Opaque key, interpreted by the fetcher.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ByteRange>,
}

impl FetchKey {
    pub fn new(fetcher_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            fetcher_id: fetcher_id.into(),
            key: key.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.range = Some(ByteRange { start, end });
        self
    }
}

/// Names the destination row or object and the emitter to write it with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitKey {
    /// Id of the emitter instance to use.
    pub emitter_id: String,
    /// Opaque key, interpreted by the emitter.
    pub key: String,
}

impl EmitKey {
    pub fn new(emitter_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            emitter_id: emitter_id.into(),
            key: key.into(),
        }
    }
}

/// What to do with a tuple whose parse fails but yields partial output.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnParseError {
    /// Drop the tuple, reporting the parse failure.
    Skip,
    /// Emit whatever metadata was accumulated, plus the failure.
    #[default]
    Emit,
}

/// One unit of work: fetch these bytes, parse them, emit the result there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEmitTuple {
    /// Globally unique within a run; carries through to the reporter.
    pub id: String,
    pub fetch_key: FetchKey,
    pub emit_key: EmitKey,
    /// User-supplied metadata, merged into the container record.
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub on_parse_error: OnParseError,
}

impl FetchEmitTuple {
    pub fn new(id: impl Into<String>, fetch_key: FetchKey, emit_key: EmitKey) -> Self {
        Self {
            id: id.into(),
            fetch_key,
            emit_key,
            metadata: Metadata::new(),
            on_parse_error: OnParseError::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_byte_range_len() {
        assert_eq!(ByteRange { start: 0, end: 0 }.len(), 1);
        assert_eq!(ByteRange { start: 3, end: 9 }.len(), 7);
    }

    #[test]
    fn test_tuple_json() {
        let json = r#"{
            "id": "t-1",
            "fetchKey": { "fetcherId": "fs", "key": "a.txt" },
            "emitKey": { "emitterId": "out", "key": "a.txt.json" }
        }"#;
        let t: FetchEmitTuple = serde_json::from_str(json).unwrap();

        assert_eq!(t.id, "t-1");
        assert_eq!(t.fetch_key.fetcher_id, "fs");
        assert_eq!(t.on_parse_error, OnParseError::Emit);
        assert!(t.metadata.is_empty());
    }
}
