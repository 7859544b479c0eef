//! Binary codec for the child-worker protocol.
//!
//! Payloads are length-prefixed strings and counted maps; no serde on the
//! wire. Integers are big-endian.

pub mod frame;

pub use frame::{Body, ErrorFrame, Frame, ParseReply, ParseRequest};

use std::io;
use std::string::FromUtf8Error;
use std::{mem, str::FromStr};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use conveyor::metadata::Metadata;
use conveyor::status::Status;

/// The default type we use to represent sizes on the wire. Frames may
/// carry whole documents, so four bytes it is.
pub type Size = u32;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("UTF-8 error: {0}")]
    FromUtf8(#[from] FromUtf8Error),
    #[error("invalid frame type `{0:#04x}`")]
    InvalidFrameType(u8),
    #[error("invalid body tag `{0:#04x}`")]
    InvalidBodyTag(u8),
    #[error("invalid presence tag `{0:#04x}`")]
    InvalidPresence(u8),
    #[error("unknown status `{0}`")]
    UnknownStatus(String),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("unexpected bytes")]
    UnexpectedBytes,
}

impl Error {
    /// Whether we've reached the end of file. This will be true when we
    /// fail to decode a frame because there's not enough data in the
    /// stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Things that can be encoded as binary.
pub trait Encode {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error>;
}

/// Things that can be decoded from binary.
pub trait Decode: Sized {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error>;
}

/// Encode an object into a byte vector.
pub fn serialize<T: Encode + ?Sized>(data: &T) -> Vec<u8> {
    let mut buffer = Vec::new();
    // Writing to a vector never fails.
    #[allow(clippy::unwrap_used)]
    let len = data.encode(&mut buffer).unwrap();

    debug_assert_eq!(len, buffer.len());

    buffer
}

/// Decode an object from a vector.
pub fn deserialize<T: Decode>(data: &[u8]) -> Result<T, Error> {
    let mut cursor = io::Cursor::new(data);
    let obj = T::decode(&mut cursor)?;

    if cursor.position() as usize != cursor.get_ref().len() {
        return Err(Error::UnexpectedBytes);
    }
    Ok(obj)
}

impl Encode for u8 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u8(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u32 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u32::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for u64 {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        writer.write_u64::<NetworkEndian>(*self)?;

        Ok(mem::size_of::<Self>())
    }
}

impl Encode for &[u8] {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let n = (self.len() as Size).encode(writer)?;
        writer.write_all(self)?;

        Ok(n + self.len())
    }
}

impl Encode for Vec<u8> {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_slice().encode(writer)
    }
}

impl Encode for &str {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_bytes().encode(writer)
    }
}

impl Encode for String {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_str().encode(writer)
    }
}

impl Encode for Option<String> {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            None => 0u8.encode(writer),
            Some(s) => Ok(1u8.encode(writer)? + s.encode(writer)?),
        }
    }
}

impl Encode for Metadata {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = (self.len() as Size).encode(writer)?;

        for (name, values) in self.iter() {
            n += name.encode(writer)?;
            n += (values.len() as Size).encode(writer)?;
            for value in values {
                n += value.encode(writer)?;
            }
        }
        Ok(n)
    }
}

impl Encode for Vec<Metadata> {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = (self.len() as Size).encode(writer)?;

        for metadata in self {
            n += metadata.encode(writer)?;
        }
        Ok(n)
    }
}

impl Encode for Status {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_str().encode(writer)
    }
}

impl Decode for u8 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u8()?)
    }
}

impl Decode for u32 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u32::<NetworkEndian>()?)
    }
}

impl Decode for u64 {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        Ok(reader.read_u64::<NetworkEndian>()?)
    }
}

impl Decode for Vec<u8> {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let len = Size::decode(reader)? as usize;
        if len > frame::MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(len));
        }
        let mut bytes = vec![0; len];
        reader.read_exact(&mut bytes)?;

        Ok(bytes)
    }
}

impl Decode for String {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let bytes = Vec::<u8>::decode(reader)?;

        Ok(String::from_utf8(bytes)?)
    }
}

impl Decode for Option<String> {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        match u8::decode(reader)? {
            0 => Ok(None),
            1 => Ok(Some(String::decode(reader)?)),
            n => Err(Error::InvalidPresence(n)),
        }
    }
}

impl Decode for Metadata {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let fields = Size::decode(reader)?;
        let mut metadata = Metadata::new();

        for _ in 0..fields {
            let name = String::decode(reader)?;
            let values = Size::decode(reader)?;
            for _ in 0..values {
                metadata.add(&name, String::decode(reader)?);
            }
        }
        Ok(metadata)
    }
}

impl Decode for Vec<Metadata> {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let count = Size::decode(reader)?;
        let mut list = Vec::with_capacity(count.min(1024) as usize);

        for _ in 0..count {
            list.push(Metadata::decode(reader)?);
        }
        Ok(list)
    }
}

impl Decode for Status {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, Error> {
        let s = String::decode(reader)?;

        Status::from_str(&s).map_err(|_| Error::UnknownStatus(s))
    }
}
