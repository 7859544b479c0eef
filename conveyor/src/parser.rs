//! The parser interface and composite dispatch.
//!
//! Parsers are capability providers: they declare which media types they
//! support and produce metadata from a byte stream. The composite parser
//! dispatches on the detected media type and drives embedded-document
//! recursion with an explicit, bounded depth.

pub mod bundle;
pub mod sleep;
pub mod text;

use std::fmt;
use std::io;
use std::io::Read;

use nonempty::NonEmpty;

use crate::detect::{DetectorChain, MediaType};
use crate::metadata::{names, Metadata, SKIPPED_DEEP_EMBEDDED};

/// Default bound on embedded-document recursion.
pub const DEFAULT_MAX_EMBEDDED_DEPTH: usize = 20;

/// How many leading bytes detectors get to look at.
const DETECT_HEAD: usize = 8192;

/// What went wrong during a parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input is recognized but malformed.
    Corrupt,
    /// No parser supports the input's media type.
    Unsupported,
    /// The input is encrypted and cannot be read.
    Encrypted,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Corrupt => f.write_str("corrupt"),
            ErrorKind::Unsupported => f.write_str("unsupported"),
            ErrorKind::Encrypted => f.write_str("encrypted"),
            ErrorKind::Other => f.write_str("other"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} parse error: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corrupt, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn encrypted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Encrypted, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::other(e.to_string())
    }
}

/// Request-scoped parse state. The recursion depth is an explicit counter
/// on this value; descending past the bound is not possible.
#[derive(Debug, Clone)]
pub struct ParseContext {
    max_embedded_depth: usize,
    depth: usize,
}

impl Default for ParseContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EMBEDDED_DEPTH)
    }
}

impl ParseContext {
    pub fn new(max_embedded_depth: usize) -> Self {
        Self {
            max_embedded_depth,
            depth: 0,
        }
    }

    /// Current recursion depth; the container document is at depth 0.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_embedded_depth(&self) -> usize {
        self.max_embedded_depth
    }

    /// Context for an embedded child, or `None` when the bound is reached.
    pub fn descend(&self) -> Option<ParseContext> {
        if self.depth >= self.max_embedded_depth {
            return None;
        }
        Some(Self {
            max_embedded_depth: self.max_embedded_depth,
            depth: self.depth + 1,
        })
    }
}

/// Receives embedded documents discovered by a container parser.
pub trait EmbeddedSink {
    /// Hand over an embedded document. `metadata` is the seed metadata the
    /// container knows about the child, eg. its entry name.
    fn embedded(
        &mut self,
        input: &mut dyn Read,
        metadata: Metadata,
        ctx: &ParseContext,
    ) -> Result<(), Error>;
}

/// A capability provider: supports some media types, parses a stream into
/// the given metadata record, and hands embedded documents to the sink.
pub trait Parser: Send + Sync {
    fn supports(&self, media_type: &MediaType) -> bool;

    fn parse(
        &self,
        input: &mut dyn Read,
        metadata: &mut Metadata,
        ctx: &ParseContext,
        embedded: &mut dyn EmbeddedSink,
    ) -> Result<(), Error>;
}

/// The result of parsing one document tree.
///
/// `records` always holds at least the container record (index 0), which
/// always carries a content-type. `failure` is set when the container
/// parse itself failed; whatever metadata had accumulated by then is kept
/// so that callers can emit partial output. `embedded_failures` counts
/// children whose parse failed; those are recorded on the child records.
#[derive(Debug)]
pub struct ParseOutput {
    pub records: NonEmpty<Metadata>,
    pub failure: Option<Error>,
    pub embedded_failures: usize,
}

impl ParseOutput {
    pub fn is_clean(&self) -> bool {
        self.failure.is_none() && self.embedded_failures == 0
    }
}

/// An ordered list of capability providers plus the detection chain.
///
/// Providers are registered under an extension id; registration is sorted
/// lexicographically by id, and dispatch picks the first provider whose
/// `supports` answers yes.
pub struct CompositeParser {
    parsers: Vec<(String, Box<dyn Parser>)>,
    detectors: DetectorChain,
}

impl Default for CompositeParser {
    /// The built-in providers: plain text, the bundle container format,
    /// and the sleep fixture parser.
    fn default() -> Self {
        Self::new()
            .with("bundle", Box::new(bundle::BundleParser))
            .with("sleep", Box::new(sleep::SleepParser))
            .with("text", Box::new(text::TextParser))
    }
}

impl CompositeParser {
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
            detectors: DetectorChain::default(),
        }
    }

    /// Register a provider. Providers are kept sorted by id so that
    /// registration order is deterministic regardless of call order.
    pub fn with(mut self, id: impl Into<String>, parser: Box<dyn Parser>) -> Self {
        let id = id.into();
        let ix = self
            .parsers
            .partition_point(|(existing, _)| existing.as_str() < id.as_str());
        self.parsers.insert(ix, (id, parser));
        self
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.parsers.iter().map(|(id, _)| id.as_str())
    }

    fn find(&self, media_type: &MediaType) -> Option<&dyn Parser> {
        self.parsers
            .iter()
            .find(|(_, p)| p.supports(media_type))
            .map(|(_, p)| p.as_ref())
    }

    fn detect(&self, bytes: &[u8], metadata: &Metadata) -> MediaType {
        self.detectors
            .detect(&bytes[..bytes.len().min(DETECT_HEAD)], metadata)
    }

    /// Parse a whole document tree.
    ///
    /// The container record is `metadata` (typically the tuple's user
    /// metadata) extended by the parser; embedded children follow in
    /// depth-first discovery order, each carrying `embedded-depth`. The
    /// container record always gets a `content-type`.
    pub fn parse_document(
        &self,
        bytes: &[u8],
        mut metadata: Metadata,
        ctx: &ParseContext,
    ) -> ParseOutput {
        let media_type = self.detect(bytes, &metadata);
        metadata.set(names::CONTENT_TYPE, media_type.as_str());

        let mut collector = Collector {
            composite: self,
            records: Vec::new(),
            failures: 0,
        };
        let failure = match self.find(&media_type) {
            None => {
                let e = Error::unsupported(format!("no parser for `{media_type}`"));
                metadata.add(names::PARSE_ERROR, e.to_string());
                Some(e)
            }
            Some(parser) => {
                match parser.parse(
                    &mut io::Cursor::new(bytes),
                    &mut metadata,
                    ctx,
                    &mut collector,
                ) {
                    Ok(()) => None,
                    Err(e) => {
                        metadata.add(names::PARSE_ERROR, e.to_string());
                        Some(e)
                    }
                }
            }
        };

        ParseOutput {
            records: NonEmpty {
                head: metadata,
                tail: collector.records,
            },
            failure,
            embedded_failures: collector.failures,
        }
    }
}

/// Collects embedded children into a flat, depth-first record list.
struct Collector<'a> {
    composite: &'a CompositeParser,
    records: Vec<Metadata>,
    failures: usize,
}

impl EmbeddedSink for Collector<'_> {
    fn embedded(
        &mut self,
        input: &mut dyn Read,
        mut metadata: Metadata,
        ctx: &ParseContext,
    ) -> Result<(), Error> {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;

        let media_type = self.composite.detect(&bytes, &metadata);
        metadata.set(names::CONTENT_TYPE, media_type.as_str());

        let child_ctx = match ctx.descend() {
            Some(child_ctx) => child_ctx,
            None => {
                // Bound reached: record the child, skip its content.
                metadata.add(names::EMBEDDED_RESOURCE_TYPE, SKIPPED_DEEP_EMBEDDED);
                metadata.add(names::EMBEDDED_DEPTH, (ctx.depth() + 1).to_string());
                self.records.push(metadata);
                return Ok(());
            }
        };
        metadata.add(names::EMBEDDED_DEPTH, child_ctx.depth().to_string());

        // Reserve the child's slot so grandchildren, pushed while the
        // child parses, land after it (pre-order).
        let slot = self.records.len();
        self.records.push(Metadata::new());

        match self.composite.find(&media_type) {
            None => {
                self.failures += 1;
                metadata.add(
                    names::PARSE_ERROR,
                    Error::unsupported(format!("no parser for `{media_type}`")).to_string(),
                );
            }
            Some(parser) => {
                if let Err(e) =
                    parser.parse(&mut io::Cursor::new(&bytes), &mut metadata, &child_ctx, self)
                {
                    self.failures += 1;
                    metadata.add(names::PARSE_ERROR, e.to_string());
                }
            }
        }
        self.records[slot] = metadata;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_plain_text() {
        let composite = CompositeParser::default();
        let mut seed = Metadata::new();
        seed.add(names::RESOURCE_NAME, "a.txt");

        let out = composite.parse_document(b"hello", seed, &ParseContext::default());

        assert!(out.is_clean());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records.head.get(names::CONTENT_TYPE), Some("text/plain"));
        assert_eq!(out.records.head.get(names::CONTENT), Some("hello"));
    }

    #[test]
    fn test_unsupported_media_type() {
        let composite = CompositeParser::default();
        let out = composite.parse_document(
            &[0u8, 1, 2, 3],
            Metadata::new(),
            &ParseContext::default(),
        );

        assert_eq!(out.failure.as_ref().map(|e| e.kind), Some(ErrorKind::Unsupported));
        assert_eq!(
            out.records.head.get(names::CONTENT_TYPE),
            Some(MediaType::OCTET_STREAM)
        );
    }

    #[test]
    fn test_bundle_children_depth_first() {
        let composite = CompositeParser::default();
        let input = b"#bundle\n--- a.txt\n  alpha\n--- b.txt\n  beta\n";
        let out = composite.parse_document(input, Metadata::new(), &ParseContext::default());

        assert!(out.is_clean());
        assert_eq!(out.records.len(), 3);
        let children: Vec<_> = out.records.tail.iter().collect();
        assert_eq!(children[0].get(names::RESOURCE_NAME), Some("a.txt"));
        assert_eq!(children[0].get(names::CONTENT), Some("alpha"));
        assert_eq!(children[0].get(names::EMBEDDED_DEPTH), Some("1"));
        assert_eq!(children[1].get(names::RESOURCE_NAME), Some("b.txt"));
    }

    #[test]
    fn test_embedded_depth_bound() {
        let composite = CompositeParser::default();
        // A bundle containing a bundle; with a bound of 1 the inner
        // bundle's entry is recorded but not descended into.
        let input = "#bundle\n\
                     --- inner.bundle\n\
                     \x20\x20#bundle\n\
                     \x20\x20--- deep.txt\n\
                     \x20\x20\x20\x20unreachable\n";
        let out =
            composite.parse_document(input.as_bytes(), Metadata::new(), &ParseContext::new(1));

        // Container, the inner bundle, and the skipped grandchild.
        assert_eq!(out.records.len(), 3);
        let skipped = out.records.tail.last().unwrap();
        assert_eq!(
            skipped.get(names::EMBEDDED_RESOURCE_TYPE),
            Some(SKIPPED_DEEP_EMBEDDED)
        );
        assert_eq!(skipped.get(names::CONTENT_TYPE), Some("text/plain"));
        assert_eq!(skipped.get(names::CONTENT), None);
    }

    #[test]
    fn test_container_failure_keeps_partial_output() {
        let composite = CompositeParser::default();
        let input = b"#bundle encrypted\n--- a.txt\n  alpha\n";
        let out = composite.parse_document(input, Metadata::new(), &ParseContext::default());

        assert_eq!(out.failure.as_ref().map(|e| e.kind), Some(ErrorKind::Encrypted));
        assert!(out.records.head.contains(names::PARSE_ERROR));
    }
}
