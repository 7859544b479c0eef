//! The parser gateway.
//!
//! Workers hand a fetched stream to the gateway and get back a parse
//! reply, without knowing whether the parse ran in-process or in a
//! supervised child.

use std::io;
use std::sync::Arc;

use conveyor::fetcher::FetchStream;
use conveyor::metadata::Metadata;
use conveyor::parser::{CompositeParser, ParseContext};
use conveyor::status::Status;
use conveyor::temp::RunDir;

use crate::supervisor::{Failure, Supervisor};
use crate::wire::{Body, ParseReply, ParseRequest};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Reading the fetched stream failed; fetch-side, not parse-side.
    #[error("failed to read fetched stream: {0}")]
    Read(#[from] io::Error),
    /// The forked parse failed at the process level.
    #[error(transparent)]
    Forked(#[from] Failure),
}

/// Execution strategy, selected at startup.
pub enum Gateway {
    InProcess {
        composite: CompositeParser,
        max_embedded_depth: usize,
    },
    Forked {
        supervisor: Supervisor,
        max_embedded_depth: usize,
        /// Bodies above this size go to the child by file path.
        inline_threshold: u64,
        temp: Arc<RunDir>,
    },
}

impl Gateway {
    /// Parse a fetched stream into a reply. Blocking; honours the
    /// supervisor's client and parse timeouts in forked mode.
    pub fn parse(
        &self,
        id: &str,
        metadata: Metadata,
        stream: FetchStream,
    ) -> Result<ParseReply, Error> {
        match self {
            Gateway::InProcess {
                composite,
                max_embedded_depth,
            } => {
                let bytes = stream.into_bytes()?;
                if bytes.is_empty() {
                    return Ok(ParseReply {
                        status: Status::Empty,
                        message: None,
                        metadata: Vec::new(),
                    });
                }
                let ctx = ParseContext::new(*max_embedded_depth);
                Ok(ParseReply::from_output(
                    composite.parse_document(&bytes, metadata, &ctx),
                ))
            }
            Gateway::Forked {
                supervisor,
                max_embedded_depth,
                inline_threshold,
                temp,
            } => {
                // Keep file-backed bodies alive until the child replied;
                // the backing files are deleted on drop.
                let mut stream_guard = None;
                let mut spool_guard = None;

                let body = match stream.path() {
                    Some(path) => {
                        let path = path.to_string_lossy().into_owned();
                        stream_guard = Some(stream);
                        Body::Path(path)
                    }
                    None => {
                        let bytes = stream.into_bytes()?;
                        if bytes.len() as u64 > *inline_threshold {
                            let spooled = temp.write(&bytes)?;
                            let path = spooled.path().to_string_lossy().into_owned();
                            spool_guard = Some(spooled);
                            Body::Path(path)
                        } else {
                            Body::Inline(bytes)
                        }
                    }
                };
                let reply = supervisor.parse(ParseRequest {
                    id: id.to_owned(),
                    metadata,
                    max_embedded_depth: *max_embedded_depth as u32,
                    body,
                })?;
                drop(stream_guard);
                drop(spool_guard);

                Ok(reply)
            }
        }
    }

    /// Tear down the forked pool, if any.
    pub fn shutdown(self) {
        if let Gateway::Forked { supervisor, .. } = self {
            supervisor.shutdown();
        }
    }

    /// Interrupt in-flight forked parses.
    pub fn cancel(&self) {
        if let Gateway::Forked { supervisor, .. } = self {
            supervisor.kill_all();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use conveyor::metadata::names;

    fn in_process() -> Gateway {
        Gateway::InProcess {
            composite: CompositeParser::default(),
            max_embedded_depth: 20,
        }
    }

    #[test]
    fn test_in_process_parse() {
        let gateway = in_process();
        let mut metadata = Metadata::new();
        metadata.add(names::RESOURCE_NAME, "a.txt");

        let stream = FetchStream::from_reader(Box::new(io::Cursor::new(b"hello".to_vec())));
        let reply = gateway.parse("t-1", metadata, stream).unwrap();

        assert_eq!(reply.status, Status::ParseSuccess);
        assert_eq!(reply.metadata[0].get(names::CONTENT), Some("hello"));
    }

    #[test]
    fn test_in_process_empty_stream() {
        let gateway = in_process();
        let stream = FetchStream::from_reader(Box::new(io::Cursor::new(Vec::new())));
        let reply = gateway.parse("t-2", Metadata::new(), stream).unwrap();

        assert_eq!(reply.status, Status::Empty);
    }
}
