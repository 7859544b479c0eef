//! Framing protocol for the child-worker pipes.
//!
//! Every frame is `[type: u8][length: u32 big-endian][payload]`. The
//! supervisor writes `PARSE`, `PING` and `SHUTDOWN`; the child writes
//! `READY`, `RESULT`, `ERROR` and `PONG`.

use std::io;
use std::io::{Read, Write};

use conveyor::metadata::Metadata;
use conveyor::status::Status;

use super::{deserialize, serialize, Decode, Encode, Error, Size};

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 1 << 30;

/// Frame type bytes.
pub const READY: u8 = 0x01;
pub const PARSE: u8 = 0x02;
pub const RESULT: u8 = 0x03;
pub const ERROR: u8 = 0x04;
pub const PING: u8 = 0x05;
pub const PONG: u8 = 0x06;
pub const SHUTDOWN: u8 = 0x07;

/// Where the parse body lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// The bytes travel in the frame.
    Inline(Vec<u8>),
    /// The bytes are in a scoped file the child reads directly.
    Path(String),
}

/// Body tag bytes.
const BODY_INLINE: u8 = 0x00;
const BODY_PATH: u8 = 0x01;

impl Encode for Body {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            Body::Inline(bytes) => Ok(BODY_INLINE.encode(writer)? + bytes.encode(writer)?),
            Body::Path(path) => Ok(BODY_PATH.encode(writer)? + path.encode(writer)?),
        }
    }
}

impl Decode for Body {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        match u8::decode(reader)? {
            BODY_INLINE => Ok(Body::Inline(Vec::<u8>::decode(reader)?)),
            BODY_PATH => Ok(Body::Path(String::decode(reader)?)),
            n => Err(Error::InvalidBodyTag(n)),
        }
    }
}

/// A parse request routed to a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRequest {
    /// Tuple id, for logging and correlation.
    pub id: String,
    /// Seed metadata for the container record.
    pub metadata: Metadata,
    /// Embedded recursion bound for this request.
    pub max_embedded_depth: u32,
    pub body: Body,
}

impl Encode for ParseRequest {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.id.encode(writer)?;
        n += self.metadata.encode(writer)?;
        n += self.max_embedded_depth.encode(writer)?;
        n += self.body.encode(writer)?;

        Ok(n)
    }
}

impl Decode for ParseRequest {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let id = String::decode(reader)?;
        let metadata = Metadata::decode(reader)?;
        let max_embedded_depth = u32::decode(reader)?;
        let body = Body::decode(reader)?;

        Ok(Self {
            id,
            metadata,
            max_embedded_depth,
            body,
        })
    }
}

/// A parse reply from a child. `status` is one of the parse-stage
/// statuses; the orchestrator folds it into the tuple's final outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseReply {
    pub status: Status,
    pub message: Option<String>,
    pub metadata: Vec<Metadata>,
}

impl ParseReply {
    /// Fold a parse output into its reply. A container failure becomes
    /// an intermediate parse exception with the partial records
    /// attached; failed embedded children downgrade a success to
    /// success-with-exception.
    pub fn from_output(output: conveyor::parser::ParseOutput) -> Self {
        let (status, message) = match (&output.failure, output.embedded_failures) {
            (Some(e), _) => (Status::IntermediateParseException, Some(e.to_string())),
            (None, n) if n > 0 => (
                Status::ParseSuccessWithException,
                Some(format!("{n} embedded document(s) failed to parse")),
            ),
            (None, _) => (Status::ParseSuccess, None),
        };
        Self {
            status,
            message,
            metadata: output.records.into_iter().collect(),
        }
    }
}

impl Encode for ParseReply {
    fn encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.status.encode(writer)?;
        n += self.message.encode(writer)?;
        n += self.metadata.encode(writer)?;

        Ok(n)
    }
}

impl Decode for ParseReply {
    fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let status = Status::decode(reader)?;
        let message = Option::<String>::decode(reader)?;
        let metadata = Vec::<Metadata>::decode(reader)?;

        Ok(Self {
            status,
            message,
            metadata,
        })
    }
}

/// A request-level failure that isn't a parse outcome, eg. the child
/// couldn't read a body file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub message: String,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ready,
    Parse(ParseRequest),
    Result(ParseReply),
    Error(ErrorFrame),
    Ping,
    Pong,
    Shutdown,
}

impl Frame {
    pub fn type_byte(&self) -> u8 {
        match self {
            Frame::Ready => READY,
            Frame::Parse(_) => PARSE,
            Frame::Result(_) => RESULT,
            Frame::Error(_) => ERROR,
            Frame::Ping => PING,
            Frame::Pong => PONG,
            Frame::Shutdown => SHUTDOWN,
        }
    }
}

/// Write a frame, with its envelope, to the writer and flush.
pub fn write(writer: &mut (impl Write + ?Sized), frame: &Frame) -> Result<(), Error> {
    let payload = match frame {
        Frame::Parse(req) => serialize(req),
        Frame::Result(reply) => serialize(reply),
        Frame::Error(e) => serialize(&e.message),
        Frame::Ready | Frame::Ping | Frame::Pong | Frame::Shutdown => Vec::new(),
    };
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(payload.len()));
    }
    frame.type_byte().encode(writer)?;
    (payload.len() as Size).encode(writer)?;
    writer.write_all(&payload)?;
    writer.flush()?;

    Ok(())
}

/// Read one frame, with its envelope, from the reader. Blocks until a
/// whole frame is available; an end-of-file before the first header byte
/// surfaces as an eof error.
pub fn read(reader: &mut (impl Read + ?Sized)) -> Result<Frame, Error> {
    let type_byte = u8::decode(reader)?;
    let len = Size::decode(reader)? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(len));
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload)?;

    match type_byte {
        READY => Ok(Frame::Ready),
        PARSE => Ok(Frame::Parse(deserialize(&payload)?)),
        RESULT => Ok(Frame::Result(deserialize(&payload)?)),
        ERROR => Ok(Frame::Error(ErrorFrame {
            message: deserialize(&payload)?,
        })),
        PING => Ok(Frame::Ping),
        PONG => Ok(Frame::Pong),
        SHUTDOWN => Ok(Frame::Shutdown),
        n => Err(Error::InvalidFrameType(n)),
    }
}
