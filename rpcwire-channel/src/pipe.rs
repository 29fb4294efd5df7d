//! In-process memory pipe transporter.
//!
//! [`pipe`] returns two connected endpoints. A frame written on one side is
//! delivered as a [`TransportEvent::Frame`] on the other. Half-closing emits
//! `End` to the peer and `Finish` locally; once both sides have half-closed,
//! or either side destroys the pipe, both sides receive `Close`.

use crate::error::TransportError;
use crate::transport::{Frame, TransportEvent, Transporter};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receiving half of a pipe endpoint.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// State shared by both endpoints.
#[derive(Debug, Default)]
struct PipeLink {
    half_closed: AtomicU8,
    closed: AtomicBool,
}

/// One endpoint of an in-memory pipe.
#[derive(Debug)]
pub struct MemoryTransport {
    peer: mpsc::UnboundedSender<TransportEvent>,
    local: mpsc::UnboundedSender<TransportEvent>,
    ended: AtomicBool,
    link: Arc<PipeLink>,
}

/// Creates a connected pair of memory transporters.
pub fn pipe() -> (
    (Arc<MemoryTransport>, EventReceiver),
    (Arc<MemoryTransport>, EventReceiver),
) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let link = Arc::new(PipeLink::default());

    let a = Arc::new(MemoryTransport {
        peer: tx_b.clone(),
        local: tx_a.clone(),
        ended: AtomicBool::new(false),
        link: link.clone(),
    });
    let b = Arc::new(MemoryTransport {
        peer: tx_a,
        local: tx_b,
        ended: AtomicBool::new(false),
        link,
    });

    ((a, rx_a), (b, rx_b))
}

impl MemoryTransport {
    /// Returns whether this endpoint has half-closed.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Returns whether the pipe is fully closed.
    pub fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }

    /// Injects a raw frame toward the peer, bypassing the writable check.
    pub fn inject(&self, frame: Frame) {
        let _ = self.peer.send(TransportEvent::Frame(frame));
    }

    fn close_both(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("memory pipe closed");
        let _ = self.local.send(TransportEvent::Close);
        let _ = self.peer.send(TransportEvent::Close);
    }
}

impl Transporter for MemoryTransport {
    fn writable(&self) -> bool {
        !self.is_ended() && !self.is_closed()
    }

    fn write(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.writable() {
            return Err(TransportError::NotWritable);
        }
        self.peer
            .send(TransportEvent::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) || self.is_closed() {
            return;
        }
        let _ = self.peer.send(TransportEvent::End);
        let _ = self.local.send(TransportEvent::Finish);
        if self.link.half_closed.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            self.close_both();
        }
    }

    fn destroy(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.close_both();
    }
}
