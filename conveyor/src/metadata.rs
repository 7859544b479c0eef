//! Document metadata.
//!
//! A [`Metadata`] is an ordered multi-map from field names to string values.
//! A successful parse produces a list of these: index 0 is the container
//! document, later indices are embedded children discovered during parsing.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Well-known field names.
pub mod names {
    /// Extracted text content.
    pub const CONTENT: &str = "content";
    /// Detected or declared media type.
    pub const CONTENT_TYPE: &str = "content-type";
    /// Size of the fetched object, in bytes.
    pub const CONTENT_LENGTH: &str = "content-length";
    /// Detected character set for text streams.
    pub const CHARSET: &str = "charset";
    /// Name of the source object, eg. a file name or archive entry name.
    pub const RESOURCE_NAME: &str = "resource-name";
    /// Identifier of this record within its emit batch.
    pub const RECORD_ID: &str = "record-id";
    /// Identifier of the container record, set on embedded children.
    pub const PARENT_ID: &str = "parent-id";
    /// Parent reference written by the separate-documents strategy.
    pub const PARENT: &str = "parent";
    /// Recursion depth at which an embedded document was found.
    pub const EMBEDDED_DEPTH: &str = "embedded-depth";
    /// Disposition of an embedded document, eg. when it was skipped.
    pub const EMBEDDED_RESOURCE_TYPE: &str = "embedded-resource-type";
    /// Message of a parse failure that was emitted rather than dropped.
    pub const PARSE_ERROR: &str = "parse-error";
    /// Last-modified time reported by the object source.
    pub const MODIFIED: &str = "modified";
}

/// Marker value for children that were skipped because the embedded
/// recursion bound was reached.
pub const SKIPPED_DEEP_EMBEDDED: &str = "SKIPPED_DEEP_EMBEDDED";

/// An ordered multi-map of field names to values.
///
/// Field order is the order of first insertion; values within a field
/// preserve append order. [`Metadata::add`] appends, [`Metadata::set`]
/// is the explicit overwrite.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Vec<String>)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of a field, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, vs)| vs.first().map(String::as_str))
    }

    /// All values of a field, in append order.
    pub fn values(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, vs)| vs.as_slice())
            .unwrap_or_default()
    }

    /// Append a value to a field.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, vs)) => vs.push(value.into()),
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    /// Replace all values of a field with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, vs)) => {
                vs.clear();
                vs.push(value.into());
            }
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    /// Remove a field, returning its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        let ix = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(ix).1)
    }

    /// Rename a field, keeping its position and values. No-op if absent.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some((n, _)) = self.entries.iter_mut().find(|(n, _)| n == from) {
            *n = to.to_owned();
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Number of distinct field names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(n, vs)| (n.as_str(), vs.as_slice()))
    }

    /// Merge another metadata into this one, appending values.
    pub fn extend(&mut self, other: &Metadata) {
        for (name, values) in other.iter() {
            for value in values {
                self.add(name, value);
            }
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut m = Metadata::new();
        for (n, v) in iter {
            m.add(n, v);
        }
        m
    }
}

impl Serialize for Metadata {
    /// Single-valued fields serialize as plain strings, multi-valued fields
    /// as arrays, in insertion order.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            if let [value] = values.as_slice() {
                map.serialize_entry(name, value)?;
            } else {
                map.serialize_entry(name, values)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Value {
            One(String),
            Many(Vec<String>),
        }

        struct MetadataVisitor;

        impl<'de> Visitor<'de> for MetadataVisitor {
            type Value = Metadata;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of strings to strings or string arrays")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Metadata, A::Error> {
                let mut metadata = Metadata::new();
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    match value {
                        Value::One(v) => metadata.add(&name, v),
                        Value::Many(vs) => {
                            for v in vs {
                                metadata.add(&name, v);
                            }
                        }
                    }
                }
                Ok(metadata)
            }
        }
        deserializer.deserialize_map(MetadataVisitor)
    }
}
