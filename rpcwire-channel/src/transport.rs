//! The boundary between a channel and the byte-stream carrying its frames.
//!
//! A transporter delivers whole logical frames in order and reports its
//! lifecycle through [`TransportEvent`]s. How the bytes travel (TCP, TLS,
//! WebSocket, memory) is not the channel's concern.

use crate::error::TransportError;
use bytes::Bytes;

/// One logical packet's worth of bytes, possibly split into segments.
pub type Frame = Vec<Bytes>;

/// Write side of a framed connection.
///
/// Implementations must not block: `write` queues the frame and returns.
pub trait Transporter: Send + Sync + 'static {
    /// Returns whether frames can currently be written.
    fn writable(&self) -> bool;

    /// Queues one logical frame for delivery.
    fn write(&self, frame: Frame) -> Result<(), TransportError>;

    /// Half-closes the connection for writing.
    fn end(&self);

    /// Hard-closes the connection.
    fn destroy(&self);
}

/// Events emitted by a transporter, in order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The segments of exactly one logical packet.
    Frame(Frame),
    /// The remote side half-closed.
    End,
    /// The local half-close completed.
    Finish,
    /// The connection is fully closed. No events follow.
    Close,
    /// An I/O problem was observed.
    Error(String),
}
