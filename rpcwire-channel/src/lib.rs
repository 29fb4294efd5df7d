//! # rpcwire-channel
//!
//! Channel engine for rpcwire.
//!
//! This crate provides:
//! - Request/response correlation over any framed [`Transporter`]
//! - Inbound dispatch to registered API and push handlers
//! - Ordered binary streams with capacity limits and inactivity timeouts
//! - Graceful, drain-before-teardown shutdown
//! - An in-process memory pipe transporter

pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod pipe;
pub mod sender;
pub mod stream;
pub mod transport;

pub use channel::{Channel, ChannelBuilder, ChannelEvent, ChannelState};
pub use config::{ChannelConfig, Config, ConfigError, StreamCapacity, StreamConfig};
pub use error::TransportError;
pub use handler::{ApiCall, ApiHandler, PushHandler, PushMessage, Responder};
pub use manager::{StreamManager, StreamPolicy};
pub use sender::StreamSender;
pub use stream::{BinaryStream, ChunkResult, StreamReader, StreamState};
pub use transport::{Frame, TransportEvent, Transporter};
