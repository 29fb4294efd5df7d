//! Transport-boundary error types.

use rpcwire_protocol::{ErrorKind, RpcError};
use thiserror::Error;

/// Errors reported by a [`Transporter`](crate::transport::Transporter).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not writable")]
    NotWritable,

    #[error("transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for RpcError {
    fn from(_: TransportError) -> Self {
        RpcError::Protocol(ErrorKind::NetworkError)
    }
}
