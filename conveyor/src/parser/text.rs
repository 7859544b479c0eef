//! Plain-text parsing with character-set detection.

use std::io::Read;

use crate::detect::{self, MediaType};
use crate::metadata::{names, Metadata};
use crate::parser::{EmbeddedSink, Error, ParseContext, Parser};

/// How many leading bytes the charset detectors get to look at.
const DETECT_HEAD: usize = 8192;

/// Parses text streams: detects the character set, decodes, and records
/// the decoded text as the record's content.
pub struct TextParser;

impl Parser for TextParser {
    fn supports(&self, media_type: &MediaType) -> bool {
        media_type.is_text()
    }

    fn parse(
        &self,
        input: &mut dyn Read,
        metadata: &mut Metadata,
        _ctx: &ParseContext,
        _embedded: &mut dyn EmbeddedSink,
    ) -> Result<(), Error> {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;

        let hint = metadata.get(names::CHARSET).map(str::to_owned);
        let charset = detect::detect_charset(
            &bytes[..bytes.len().min(DETECT_HEAD)],
            hint.as_deref(),
        );
        let text = detect::decode(&bytes, charset);

        metadata.set(names::CHARSET, charset.as_str());
        metadata.add(names::CONTENT, text);

        Ok(())
    }
}
