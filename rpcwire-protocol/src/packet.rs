//! Command packets and their header layout.
//!
//! Header layout (8 bytes, identical for every command):
//!
//! ```text
//! +---------+------+---------------+---------------+
//! | command | type | sequence high | sequence low  |
//! | 1 byte  |1 byte|   2 bytes     |   4 bytes     |
//! +---------+------+---------------+---------------+
//! | payload (depends on type and command)          |
//! +------------------------------------------------+
//! ```

use crate::error::{ProtocolError, RpcError};
use bytes::{Bytes, BytesMut};

/// Size of the fixed packet header in bytes (1+1+2+4 = 8).
pub const HEADER_SIZE: usize = 8;

/// Largest sequence number representable in the header (2^48 - 1).
pub const MAX_SEQUENCE: u64 = (1 << 48) - 1;

/// BINARY_CHUNK index value that aborts the addressed stream.
pub const ABORT_INDEX: u32 = u32::MAX;

/// Maximum length of fields with a 2-byte length prefix.
pub const MAX_SHORT_FIELD: usize = u16::MAX as usize;

/// Maximum length of fields with a 4-byte length prefix.
pub const MAX_LONG_FIELD: usize = u32::MAX as usize;

/// The closed set of commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ApiCall = 0,
    PushMessage = 1,
    BinaryChunk = 2,
    Ping = 3,
    Close = 4,
}

impl Command {
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Command::ApiCall),
            1 => Ok(Command::PushMessage),
            2 => Ok(Command::BinaryChunk),
            3 => Ok(Command::Ping),
            4 => Ok(Command::Close),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::ApiCall => "API_CALL",
            Command::PushMessage => "PUSH_MESSAGE",
            Command::BinaryChunk => "BINARY_CHUNK",
            Command::Ping => "PING",
            Command::Close => "CLOSE",
        }
    }
}

/// Packet type: a request or one of the two response kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    SuccessResponse = 1,
    ErrorResponse = 2,
}

impl PacketType {
    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(PacketType::Request),
            1 => Ok(PacketType::SuccessResponse),
            2 => Ok(PacketType::ErrorResponse),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::Request => "REQUEST",
            PacketType::SuccessResponse => "SUCCESS_RESPONSE",
            PacketType::ErrorResponse => "ERROR_RESPONSE",
        }
    }

    pub fn is_response(self) -> bool {
        !matches!(self, PacketType::Request)
    }
}

/// An opaque byte payload made of one or more segments.
///
/// Segment boundaries are not preserved on the wire: two payloads are equal
/// when their concatenated bytes are equal.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    segments: Vec<Bytes>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Bytes>) -> Self {
        Self {
            segments: segments.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Appends a segment.
    pub fn push(&mut self, segment: Bytes) {
        if !segment.is_empty() {
            self.segments.push(segment);
        }
    }

    /// Total length in bytes across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Bytes> {
        self.segments
    }

    /// Returns the payload as contiguous bytes, copying only when it spans
    /// several segments.
    pub fn into_bytes(mut self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments.pop().unwrap_or_default(),
            _ => self.to_bytes(),
        }
    }

    /// Copies the payload into contiguous bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        for segment in &self.segments {
            buf.extend_from_slice(segment);
        }
        buf.freeze()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .segments
                .iter()
                .flat_map(|s| s.iter())
                .eq(other.segments.iter().flat_map(|s| s.iter()))
    }
}

impl Eq for Payload {}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::from_segments(vec![bytes])
    }
}

impl From<Vec<Bytes>> for Payload {
    fn from(segments: Vec<Bytes>) -> Self {
        Self::from_segments(segments)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

/// Command-specific packet content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// API_CALL request.
    ApiCall { name: String, body: Payload },
    /// API_CALL success response.
    ApiResult { body: Payload },
    /// PING request or success response.
    Ping(Payload),
    /// PUSH_MESSAGE request.
    PushMessage(Payload),
    /// BINARY_CHUNK request.
    BinaryChunk {
        stream_id: u32,
        index: u32,
        chunk: Payload,
    },
    /// Responses without payload, and CLOSE requests.
    Empty,
    /// Any ERROR_RESPONSE.
    Error(RpcError),
}

/// A decoded or to-be-encoded command packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub packet_type: PacketType,
    pub sequence: u64,
    pub content: Content,
}

impl Packet {
    pub fn request(command: Command, sequence: u64, content: Content) -> Self {
        Self {
            command,
            packet_type: PacketType::Request,
            sequence,
            content,
        }
    }

    pub fn success(command: Command, sequence: u64, content: Content) -> Self {
        Self {
            command,
            packet_type: PacketType::SuccessResponse,
            sequence,
            content,
        }
    }

    pub fn error(command: Command, sequence: u64, error: RpcError) -> Self {
        Self {
            command,
            packet_type: PacketType::ErrorResponse,
            sequence,
            content: Content::Error(error),
        }
    }

    pub fn api_call(sequence: u64, name: impl Into<String>, body: impl Into<Payload>) -> Self {
        Self::request(
            Command::ApiCall,
            sequence,
            Content::ApiCall {
                name: name.into(),
                body: body.into(),
            },
        )
    }

    pub fn is_request(&self) -> bool {
        self.packet_type == PacketType::Request
    }

    /// Checks that the content variant is the one the codec table expects for
    /// this `(type, command)` pair.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let ok = match (self.packet_type, self.command, &self.content) {
            (PacketType::ErrorResponse, _, Content::Error(_)) => true,
            (PacketType::Request, Command::ApiCall, Content::ApiCall { .. }) => true,
            (PacketType::SuccessResponse, Command::ApiCall, Content::ApiResult { .. }) => true,
            (PacketType::Request | PacketType::SuccessResponse, Command::Ping, Content::Ping(_)) => {
                true
            }
            (PacketType::Request, Command::PushMessage, Content::PushMessage(_)) => true,
            (PacketType::Request, Command::BinaryChunk, Content::BinaryChunk { .. }) => true,
            (PacketType::SuccessResponse, Command::PushMessage, Content::Empty) => true,
            (PacketType::SuccessResponse, Command::BinaryChunk, Content::Empty) => true,
            (PacketType::Request | PacketType::SuccessResponse, Command::Close, Content::Empty) => {
                true
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(ProtocolError::ContentMismatch {
                command: self.command.name(),
                packet_type: self.packet_type.name(),
            })
        }
    }
}
