//! Media-type and character-set detection.
//!
//! Media types are resolved by a chain of detectors; the first non-empty
//! answer wins, ties broken by registration order. Character sets for text
//! streams run markup-declared, then statistical, then fallback detection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::metadata::{names, Metadata};

/// A media type, eg. `text/plain`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaType(String);

impl MediaType {
    pub const OCTET_STREAM: &'static str = "application/octet-stream";
    pub const TEXT_PLAIN: &'static str = "text/plain";
    pub const BUNDLE: &'static str = "application/x-bundle";
    pub const SLEEP: &'static str = "application/x-sleep";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn octet_stream() -> Self {
        Self::new(Self::OCTET_STREAM)
    }

    pub fn text_plain() -> Self {
        Self::new(Self::TEXT_PLAIN)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_text(&self) -> bool {
        self.0.starts_with("text/")
            || matches!(
                self.0.as_str(),
                "application/json" | "application/xml" | "image/svg+xml"
            )
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MediaType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/// Answers a media type from the head of a stream plus whatever metadata
/// has accumulated so far. Returns `None` when it has no opinion.
pub trait Detector: Send + Sync {
    fn detect(&self, head: &[u8], metadata: &Metadata) -> Option<MediaType>;
}

/// Magic byte prefixes, checked in table order.
const MAGIC: &[(&[u8], &str)] = &[
    (b"#bundle", MediaType::BUNDLE),
    (b"#sleep ", MediaType::SLEEP),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/gzip"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"<?xml", "application/xml"),
    (b"<!DOCTYPE html", "text/html"),
    (b"<html", "text/html"),
];

/// Detects by well-known leading bytes.
pub struct MagicDetector;

impl Detector for MagicDetector {
    fn detect(&self, head: &[u8], _metadata: &Metadata) -> Option<MediaType> {
        // Skip a UTF-8 BOM before matching text-ish magic.
        let head = head.strip_prefix(b"\xef\xbb\xbf").unwrap_or(head);

        for (magic, media_type) in MAGIC {
            if head.starts_with(magic) {
                return Some(MediaType::new(*media_type));
            }
        }
        if head.starts_with(b"{") || head.starts_with(b"[") {
            // Only call it JSON if the head is valid UTF-8.
            if std::str::from_utf8(head).is_ok() {
                return Some(MediaType::new("application/json"));
            }
        }
        None
    }
}

/// Extension globs, matched against the resource name.
const GLOBS: &[(&str, &str)] = &[
    (".txt", MediaType::TEXT_PLAIN),
    (".text", MediaType::TEXT_PLAIN),
    (".log", MediaType::TEXT_PLAIN),
    (".csv", "text/csv"),
    (".html", "text/html"),
    (".htm", "text/html"),
    (".xml", "application/xml"),
    (".json", "application/json"),
    (".pdf", "application/pdf"),
    (".zip", "application/zip"),
    (".gz", "application/gzip"),
    (".png", "image/png"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".gif", "image/gif"),
    (".bundle", MediaType::BUNDLE),
    (".sleep", MediaType::SLEEP),
];

/// Detects by the extension of the `resource-name` field.
pub struct GlobDetector;

impl Detector for GlobDetector {
    fn detect(&self, _head: &[u8], metadata: &Metadata) -> Option<MediaType> {
        let name = metadata.get(names::RESOURCE_NAME)?;
        let name = name.to_ascii_lowercase();

        GLOBS
            .iter()
            .find(|(glob, _)| name.ends_with(glob))
            .map(|(_, media_type)| MediaType::new(*media_type))
    }
}

/// Falls back to a content-type hint supplied upstream, eg. by a fetcher
/// that annotated server-side attributes.
pub struct HintDetector;

impl Detector for HintDetector {
    fn detect(&self, _head: &[u8], metadata: &Metadata) -> Option<MediaType> {
        metadata
            .get(names::CONTENT_TYPE)
            .map(|hint| MediaType::new(hint.split(';').next().unwrap_or(hint).trim()))
    }
}

/// The detection chain. First non-empty answer wins; registration order
/// breaks ties.
pub struct DetectorChain {
    detectors: Vec<Box<dyn Detector>>,
}

impl Default for DetectorChain {
    fn default() -> Self {
        Self {
            detectors: vec![
                Box::new(MagicDetector),
                Box::new(GlobDetector),
                Box::new(HintDetector),
            ],
        }
    }
}

impl DetectorChain {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    pub fn detect(&self, head: &[u8], metadata: &Metadata) -> MediaType {
        self.detectors
            .iter()
            .find_map(|d| d.detect(head, metadata))
            .unwrap_or_else(MediaType::octet_stream)
    }
}

/// A detected character set, by canonical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Utf16Le,
    Utf16Be,
    Iso8859_1,
    Windows1252,
}

impl Charset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Utf16Le => "UTF-16LE",
            Charset::Utf16Be => "UTF-16BE",
            Charset::Iso8859_1 => "ISO-8859-1",
            Charset::Windows1252 => "windows-1252",
        }
    }

    fn from_declared(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Some(Charset::Utf8),
            "utf-16le" => Some(Charset::Utf16Le),
            "utf-16be" => Some(Charset::Utf16Be),
            "iso-8859-1" | "latin1" => Some(Charset::Iso8859_1),
            "windows-1252" | "cp1252" => Some(Charset::Windows1252),
            _ => None,
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character set declared in an XML declaration or HTML meta tag.
fn declared(head: &[u8]) -> Option<Charset> {
    let text = String::from_utf8_lossy(&head[..head.len().min(1024)]).to_ascii_lowercase();

    for marker in ["encoding=\"", "encoding='", "charset=\"", "charset='", "charset="] {
        if let Some(ix) = text.find(marker) {
            let rest = &text[ix + marker.len()..];
            let end = rest
                .find(|c: char| c == '"' || c == '\'' || c == '>' || c.is_whitespace())
                .unwrap_or(rest.len());
            if let Some(cs) = Charset::from_declared(&rest[..end]) {
                return Some(cs);
            }
        }
    }
    None
}

/// Statistical detection: BOMs, UTF-16 zero-byte patterns, UTF-8 validity.
fn statistical(head: &[u8]) -> Option<Charset> {
    if head.starts_with(b"\xef\xbb\xbf") {
        return Some(Charset::Utf8);
    }
    if head.starts_with(b"\xff\xfe") {
        return Some(Charset::Utf16Le);
    }
    if head.starts_with(b"\xfe\xff") {
        return Some(Charset::Utf16Be);
    }
    if !head.is_empty() {
        let zeros_even = head.iter().step_by(2).filter(|b| **b == 0).count();
        let zeros_odd = head.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
        let half = head.len() / 2;
        if half > 4 {
            if zeros_odd * 10 > half * 7 && zeros_even == 0 {
                return Some(Charset::Utf16Le);
            }
            if zeros_even * 10 > half * 7 && zeros_odd == 0 {
                return Some(Charset::Utf16Be);
            }
        }
    }
    if std::str::from_utf8(head).is_ok() {
        return Some(Charset::Utf8);
    }
    if head.iter().any(|b| (0x80..0xa0).contains(b)) {
        // Bytes in the C1 range are printable in windows-1252 only.
        return Some(Charset::Windows1252);
    }
    None
}

/// Detect the character set of a text stream head.
///
/// Detectors run in priority order: markup-declared, statistical, latin-1
/// fallback. `windows-1252` is downgraded to `ISO-8859-1` when the stream
/// shows no CR or LF and no hint was supplied.
pub fn detect_charset(head: &[u8], hint: Option<&str>) -> Charset {
    let hinted = hint.and_then(Charset::from_declared);
    let detected = hinted
        .or_else(|| declared(head))
        .or_else(|| statistical(head))
        .unwrap_or(Charset::Iso8859_1);

    if detected == Charset::Windows1252
        && hint.is_none()
        && !head.iter().any(|b| *b == b'\r' || *b == b'\n')
    {
        return Charset::Iso8859_1;
    }
    detected
}

/// windows-1252 mappings for the 0x80..=0x9f range.
const WIN1252_C1: [char; 32] = [
    '€', '\u{81}', '‚', 'ƒ', '„', '…', '†', '‡', 'ˆ', '‰', 'Š', '‹', 'Œ', '\u{8d}', 'Ž',
    '\u{8f}', '\u{90}', '‘', '’', '“', '”', '•', '–', '—', '˜', '™', 'š', '›', 'œ', '\u{9d}',
    'ž', 'Ÿ',
];

/// Decode bytes into a string under the given charset. Latin-family bytes
/// map one-to-one onto code points; UTF-16 decodes pairwise.
pub fn decode(bytes: &[u8], charset: Charset) -> String {
    match charset {
        Charset::Utf8 => {
            let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
            String::from_utf8_lossy(bytes).into_owned()
        }
        Charset::Iso8859_1 => bytes.iter().map(|b| *b as char).collect(),
        Charset::Windows1252 => bytes
            .iter()
            .map(|b| match *b {
                // The C1 range is remapped to printable characters.
                0x80..=0x9f => WIN1252_C1[(*b - 0x80) as usize],
                b => b as char,
            })
            .collect(),
        Charset::Utf16Le => {
            let bytes = bytes.strip_prefix(b"\xff\xfe").unwrap_or(bytes);
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        Charset::Utf16Be => {
            let bytes = bytes.strip_prefix(b"\xfe\xff").unwrap_or(bytes);
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
    }
}
