//! A fixture parser that sleeps for a directed duration.
//!
//! Input is `#sleep <millis>` on the first line; any remaining lines
//! become the record's content. Used to exercise parse timeouts and
//! backpressure without a slow real-world format.

use std::io::Read;
use std::thread;
use std::time::Duration;

use crate::detect::MediaType;
use crate::metadata::{names, Metadata};
use crate::parser::{EmbeddedSink, Error, ParseContext, Parser};

pub struct SleepParser;

impl Parser for SleepParser {
    fn supports(&self, media_type: &MediaType) -> bool {
        media_type.as_str() == MediaType::SLEEP
    }

    fn parse(
        &self,
        input: &mut dyn Read,
        metadata: &mut Metadata,
        _ctx: &ParseContext,
        _embedded: &mut dyn EmbeddedSink,
    ) -> Result<(), Error> {
        let mut text = String::new();
        input.read_to_string(&mut text)?;

        let (directive, rest) = match text.split_once('\n') {
            Some((first, rest)) => (first, rest),
            None => (text.as_str(), ""),
        };
        let millis: u64 = directive
            .strip_prefix("#sleep ")
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(|| Error::corrupt("malformed `#sleep` directive"))?;

        thread::sleep(Duration::from_millis(millis));
        metadata.add(names::CONTENT, rest);

        Ok(())
    }
}
