//! The child worker: serves framed parse requests on stdin/stdout.
//!
//! Standard output carries the protocol; logging goes to standard error,
//! which the supervisor forwards into its own log.

use std::fs;
use std::io;
use std::io::Write as _;
use std::process;

use conveyor::parser::{CompositeParser, ParseContext};
use conveyor::status::Status;

use crate::wire;
use crate::wire::{frame, Body, Frame, ParseReply, ParseRequest};

/// Exit code asking the supervisor for a silent replacement, used when
/// the resident-memory high-water mark is exceeded.
pub const EXIT_RESTART_REQUESTED: i32 = 71;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Resident bytes above which the child asks to be restarted after
    /// finishing its current request. Zero disables the check.
    pub memory_high_water: u64,
}

/// Serve parse requests until the supervisor shuts us down or the pipe
/// closes.
pub fn run(config: Config) -> Result<(), wire::Error> {
    let composite = CompositeParser::default();
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();

    frame::write(&mut writer, &Frame::Ready)?;
    log::debug!(target: "child", "Child worker ready (pid {})", process::id());

    loop {
        match frame::read(&mut reader) {
            Ok(Frame::Ping) => {
                frame::write(&mut writer, &Frame::Pong)?;
            }
            Ok(Frame::Shutdown) => {
                log::debug!(target: "child", "Shutdown requested..");
                return Ok(());
            }
            Ok(Frame::Parse(request)) => {
                let id = request.id.clone();
                match serve(&composite, request) {
                    Ok(reply) => {
                        log::debug!(target: "child", "Parsed `{id}`: {}", reply.status);
                        frame::write(&mut writer, &Frame::Result(reply))?;
                    }
                    Err(message) => {
                        log::error!(target: "child", "Request `{id}` failed: {message}");
                        frame::write(&mut writer, &Frame::Error(frame::ErrorFrame { message }))?;
                    }
                }
                if let Some(resident) = over_high_water(config.memory_high_water) {
                    log::warn!(
                        target: "child",
                        "Resident memory {resident} exceeds high-water mark; requesting restart"
                    );
                    writer.flush().ok();
                    process::exit(EXIT_RESTART_REQUESTED);
                }
            }
            Ok(frame) => {
                log::warn!(target: "child", "Ignoring unexpected frame {:#04x}", frame.type_byte());
            }
            // The supervisor went away; exit quietly.
            Err(e) if e.is_eof() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn serve(composite: &CompositeParser, request: ParseRequest) -> Result<ParseReply, String> {
    let bytes = match request.body {
        Body::Inline(bytes) => bytes,
        Body::Path(path) => {
            fs::read(&path).map_err(|e| format!("cannot read body file `{path}`: {e}"))?
        }
    };
    if bytes.is_empty() {
        return Ok(ParseReply {
            status: Status::Empty,
            message: None,
            metadata: Vec::new(),
        });
    }
    let ctx = ParseContext::new(request.max_embedded_depth as usize);
    let output = composite.parse_document(&bytes, request.metadata, &ctx);

    Ok(ParseReply::from_output(output))
}

/// The child's resident memory when it exceeds the high-water mark.
fn over_high_water(high_water: u64) -> Option<u64> {
    if high_water == 0 {
        return None;
    }
    resident_memory().filter(|resident| *resident > high_water)
}

/// Resident set size in bytes.
#[cfg(target_os = "linux")]
pub fn resident_memory() -> Option<u64> {
    let statm = fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory() -> Option<u64> {
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use conveyor::metadata::{names, Metadata};

    #[test]
    fn test_serve_inline() {
        let composite = CompositeParser::default();
        let mut metadata = Metadata::new();
        metadata.add(names::RESOURCE_NAME, "a.txt");

        let reply = serve(
            &composite,
            ParseRequest {
                id: "t-1".to_owned(),
                metadata,
                max_embedded_depth: 20,
                body: Body::Inline(b"hello".to_vec()),
            },
        )
        .unwrap();

        assert_eq!(reply.status, Status::ParseSuccess);
        assert_eq!(reply.metadata[0].get(names::CONTENT), Some("hello"));
    }

    #[test]
    fn test_serve_empty_body() {
        let composite = CompositeParser::default();
        let reply = serve(
            &composite,
            ParseRequest {
                id: "t-2".to_owned(),
                metadata: Metadata::new(),
                max_embedded_depth: 20,
                body: Body::Inline(Vec::new()),
            },
        )
        .unwrap();

        assert_eq!(reply.status, Status::Empty);
        assert!(reply.metadata.is_empty());
    }

    #[test]
    fn test_serve_missing_body_file() {
        let composite = CompositeParser::default();
        let err = serve(
            &composite,
            ParseRequest {
                id: "t-3".to_owned(),
                metadata: Metadata::new(),
                max_embedded_depth: 20,
                body: Body::Path("/nonexistent/body".to_owned()),
            },
        )
        .unwrap_err();

        assert!(err.contains("cannot read body file"));
    }

    #[test]
    fn test_parse_failure_is_intermediate() {
        let composite = CompositeParser::default();
        let mut metadata = Metadata::new();
        metadata.add(names::RESOURCE_NAME, "x.bundle");

        let reply = serve(
            &composite,
            ParseRequest {
                id: "t-4".to_owned(),
                metadata,
                max_embedded_depth: 20,
                body: Body::Inline(b"#bundle encrypted\n".to_vec()),
            },
        )
        .unwrap();

        assert_eq!(reply.status, Status::IntermediateParseException);
        assert!(!reply.metadata.is_empty());
    }
}
