//! # rpcwire-protocol
//!
//! Binary packet codec for the rpcwire channel protocol.
//!
//! This crate provides:
//! - The fixed 8-byte packet header and per-command payload layouts
//! - A decoder that accepts frames split into arbitrary byte segments
//! - The typed error taxonomy carried in ERROR_RESPONSE packets
//!
//! The codec is pure: it performs no I/O and keeps no state between calls.

pub mod codec;
pub mod error;
pub mod packet;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorKind, ProtocolError, RpcError, APP_NAMESPACE, PROTOCOL_NAMESPACE};
pub use packet::{
    Command, Content, Packet, PacketType, Payload, ABORT_INDEX, HEADER_SIZE, MAX_SEQUENCE,
};
