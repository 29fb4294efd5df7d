//! Codec errors and the typed error taxonomy carried in ERROR_RESPONSE packets.

use std::fmt;
use thiserror::Error;

/// Wire namespace for engine-raised errors.
pub const PROTOCOL_NAMESPACE: &str = "protocol_error";

/// Wire namespace for handler-raised errors.
pub const APP_NAMESPACE: &str = "app_error";

/// Errors raised while encoding or decoding a packet.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("incomplete packet: need {needed} more bytes")]
    Incomplete { needed: usize },

    #[error("unknown command code: {0:#04x}")]
    UnknownCommand(u8),

    #[error("unknown packet type code: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("sequence {0} does not fit in 48 bits")]
    SequenceOutOfRange(u64),

    #[error("{field} too large: {size} bytes (max {max})")]
    FieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("content does not match {packet_type} {command}")]
    ContentMismatch {
        command: &'static str,
        packet_type: &'static str,
    },
}

impl ProtocolError {
    /// Maps a codec failure onto the error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Incomplete { .. } => ErrorKind::IncompletePacket,
            _ => ErrorKind::InvalidPacket,
        }
    }
}

/// Engine-raised error names.
///
/// The names returned by [`ErrorKind::as_str`] are part of the wire contract
/// and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IncompletePacket,
    InvalidPacket,
    InvalidResponse,
    ChannelInactive,
    ChannelClosed,
    ApiNotFound,
    CmdNotImpl,
    NetworkError,
    StreamNotFound,
    StreamAborted,
    StreamClosed,
    StreamIndexMismatch,
    SystemBusy,
    ServerInternalError,
    Timeout,
    Unknown,
    UnprocessableError,
}

impl ErrorKind {
    const ALL: [ErrorKind; 17] = [
        ErrorKind::IncompletePacket,
        ErrorKind::InvalidPacket,
        ErrorKind::InvalidResponse,
        ErrorKind::ChannelInactive,
        ErrorKind::ChannelClosed,
        ErrorKind::ApiNotFound,
        ErrorKind::CmdNotImpl,
        ErrorKind::NetworkError,
        ErrorKind::StreamNotFound,
        ErrorKind::StreamAborted,
        ErrorKind::StreamClosed,
        ErrorKind::StreamIndexMismatch,
        ErrorKind::SystemBusy,
        ErrorKind::ServerInternalError,
        ErrorKind::Timeout,
        ErrorKind::Unknown,
        ErrorKind::UnprocessableError,
    ];

    /// Returns the wire name of this error.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IncompletePacket => "incomplete_packet",
            ErrorKind::InvalidPacket => "invalid_packet",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::ChannelInactive => "channel_inactive",
            ErrorKind::ChannelClosed => "channel_closed",
            ErrorKind::ApiNotFound => "api_not_found",
            ErrorKind::CmdNotImpl => "cmd_not_impl",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::StreamNotFound => "stream_not_found",
            ErrorKind::StreamAborted => "stream_aborted",
            ErrorKind::StreamClosed => "stream_closed",
            ErrorKind::StreamIndexMismatch => "stream_index_mismatch",
            ErrorKind::SystemBusy => "system_busy",
            ErrorKind::ServerInternalError => "server_internal_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
            ErrorKind::UnprocessableError => "unprocessable_error",
        }
    }

    /// Looks up an error by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }

    /// Returns whether a request failing with this error may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::NetworkError
                | ErrorKind::SystemBusy
                | ErrorKind::ChannelClosed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed error as seen by RPC callers and carried by ERROR_RESPONSE packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("protocol error: {0}")]
    Protocol(ErrorKind),

    #[error("application error: {0}")]
    App(String),
}

impl RpcError {
    /// Creates an application error.
    pub fn app(message: impl Into<String>) -> Self {
        RpcError::App(message.into())
    }

    /// Returns the protocol error kind, if this is an engine-raised error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RpcError::Protocol(kind) => Some(*kind),
            RpcError::App(_) => None,
        }
    }

    /// Returns true if this is the given protocol error.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == Some(kind)
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind().map(|k| k.is_retryable()).unwrap_or(false)
    }

    /// Formats the error as `"<namespace>:<message>"`.
    pub fn to_wire(&self) -> String {
        match self {
            RpcError::Protocol(kind) => format!("{}:{}", PROTOCOL_NAMESPACE, kind.as_str()),
            RpcError::App(message) => format!("{}:{}", APP_NAMESPACE, message),
        }
    }

    /// Reconstructs an error from its wire text.
    ///
    /// Text with an unrecognized namespace or protocol error name becomes
    /// `Protocol(Unknown)`.
    pub fn from_wire(text: &str) -> Self {
        match text.split_once(':') {
            Some((APP_NAMESPACE, message)) => RpcError::App(message.to_string()),
            Some((PROTOCOL_NAMESPACE, name)) => {
                RpcError::Protocol(ErrorKind::from_name(name).unwrap_or(ErrorKind::Unknown))
            }
            _ => RpcError::Protocol(ErrorKind::Unknown),
        }
    }
}

impl From<ErrorKind> for RpcError {
    fn from(kind: ErrorKind) -> Self {
        RpcError::Protocol(kind)
    }
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        RpcError::Protocol(err.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names_are_unique_and_reversible() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_name("no_such_error"), None);
    }

    #[test]
    fn test_error_kind_retryable() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(ErrorKind::SystemBusy.is_retryable());
        assert!(ErrorKind::ChannelClosed.is_retryable());

        assert!(!ErrorKind::InvalidPacket.is_retryable());
        assert!(!ErrorKind::CmdNotImpl.is_retryable());
        assert!(!ErrorKind::StreamIndexMismatch.is_retryable());
        assert!(!RpcError::app("boom").is_retryable());
    }

    #[test]
    fn test_wire_text() {
        assert_eq!(
            RpcError::Protocol(ErrorKind::ChannelInactive).to_wire(),
            "protocol_error:channel_inactive"
        );
        assert_eq!(RpcError::app("not allowed").to_wire(), "app_error:not allowed");
    }

    #[test]
    fn test_from_wire() {
        assert_eq!(
            RpcError::from_wire("protocol_error:stream_not_found"),
            RpcError::Protocol(ErrorKind::StreamNotFound)
        );
        // Only the first colon separates the namespace
        assert_eq!(
            RpcError::from_wire("app_error:key: missing"),
            RpcError::App("key: missing".to_string())
        );
        assert_eq!(RpcError::from_wire("app_error:"), RpcError::App(String::new()));
    }

    #[test]
    fn test_from_wire_unrecognized() {
        assert!(RpcError::from_wire("protocol_error:bogus").is(ErrorKind::Unknown));
        assert!(RpcError::from_wire("other:timeout").is(ErrorKind::Unknown));
        assert!(RpcError::from_wire("no namespace").is(ErrorKind::Unknown));
    }

    #[test]
    fn test_protocol_error_kind() {
        assert_eq!(
            ProtocolError::Incomplete { needed: 3 }.kind(),
            ErrorKind::IncompletePacket
        );
        assert_eq!(
            ProtocolError::UnknownCommand(9).kind(),
            ErrorKind::InvalidPacket
        );
        assert_eq!(
            RpcError::from(ProtocolError::TrailingBytes(2)),
            RpcError::Protocol(ErrorKind::InvalidPacket)
        );
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::Incomplete { needed: 10 };
        assert!(err.to_string().contains("10"));

        let err = ProtocolError::UnknownCommand(0xff);
        assert!(err.to_string().contains("0xff"));

        let err = ProtocolError::FieldTooLarge {
            field: "api name",
            size: 70000,
            max: 65535,
        };
        let msg = err.to_string();
        assert!(msg.contains("api name"));
        assert!(msg.contains("70000"));

        let err = ProtocolError::InvalidUtf8("error message");
        assert!(err.to_string().contains("UTF-8"));
    }
}
