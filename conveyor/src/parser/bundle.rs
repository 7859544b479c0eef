//! The bundle container format.
//!
//! A bundle is a line-oriented container of named entries. Entry bodies
//! are indented by two spaces, which lets bundles nest:
//!
//! ```text
//! #bundle
//! --- a.txt
//!   alpha
//! --- inner.bundle
//!   #bundle
//!   --- b.txt
//!     beta
//! ```
//!
//! Every entry is handed to the embedded sink with its entry name as seed
//! metadata and is parsed recursively. A header of `#bundle encrypted`
//! marks the container as unreadable.

use std::io;
use std::io::Read;

use crate::detect::MediaType;
use crate::metadata::{names, Metadata};
use crate::parser::{EmbeddedSink, Error, ParseContext, Parser};

/// Entry separator prefix.
const SEPARATOR: &str = "--- ";
/// Entry body indentation.
const INDENT: &str = "  ";

pub struct BundleParser;

impl Parser for BundleParser {
    fn supports(&self, media_type: &MediaType) -> bool {
        media_type.as_str() == MediaType::BUNDLE
    }

    fn parse(
        &self,
        input: &mut dyn Read,
        metadata: &mut Metadata,
        ctx: &ParseContext,
        embedded: &mut dyn EmbeddedSink,
    ) -> Result<(), Error> {
        let mut text = String::new();
        input.read_to_string(&mut text).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                Error::corrupt("bundle is not valid UTF-8")
            } else {
                Error::from(e)
            }
        })?;

        let mut lines = text.lines();
        match lines.next() {
            Some("#bundle") => {}
            Some("#bundle encrypted") => {
                return Err(Error::encrypted("bundle is encrypted"));
            }
            _ => return Err(Error::corrupt("missing `#bundle` header")),
        }

        let mut entries: Vec<(String, Vec<&str>)> = Vec::new();
        for line in lines {
            if let Some(name) = line.strip_prefix(SEPARATOR) {
                entries.push((name.trim().to_owned(), Vec::new()));
            } else if let Some(body_line) = line.strip_prefix(INDENT) {
                match entries.last_mut() {
                    Some((_, body)) => body.push(body_line),
                    None => return Err(Error::corrupt("content before first entry separator")),
                }
            } else if line.is_empty() {
                if let Some((_, body)) = entries.last_mut() {
                    body.push("");
                }
            } else {
                return Err(Error::corrupt(format!("unindented entry content: `{line}`")));
            }
        }
        metadata.set("entry-count", entries.len().to_string());

        for (name, body) in entries {
            let mut seed = Metadata::new();
            seed.add(names::RESOURCE_NAME, name);

            let body = body.join("\n");
            embedded.embedded(&mut io::Cursor::new(body.into_bytes()), seed, ctx)?;
        }
        Ok(())
    }
}
