//! Inbound handler registration.
//!
//! A channel without an [`ApiHandler`] answers every API_CALL with
//! `cmd_not_impl`; likewise for PUSH_MESSAGE without a [`PushHandler`].

use crate::channel::ChannelInner;
use rpcwire_protocol::{ErrorKind, Payload, RpcError};
use std::sync::Arc;

/// An inbound API call.
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub name: String,
    pub body: Payload,
    pub sequence: u64,
}

/// An inbound pushed message. It has already been acknowledged.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub body: Payload,
    pub sequence: u64,
}

/// Handles inbound API calls.
///
/// Called on the channel's event loop; long-running work should move the
/// [`Responder`] into a spawned task.
pub trait ApiHandler: Send + Sync + 'static {
    fn handle(&self, call: ApiCall, responder: Responder);
}

impl<F> ApiHandler for F
where
    F: Fn(ApiCall, Responder) + Send + Sync + 'static,
{
    fn handle(&self, call: ApiCall, responder: Responder) {
        self(call, responder)
    }
}

/// Handles inbound pushed messages.
pub trait PushHandler: Send + Sync + 'static {
    fn handle(&self, message: PushMessage);
}

impl<F> PushHandler for F
where
    F: Fn(PushMessage) + Send + Sync + 'static,
{
    fn handle(&self, message: PushMessage) {
        self(message)
    }
}

/// Single-use completion for one inbound API call.
///
/// Replying consumes the responder. A responder dropped without a reply
/// answers `server_internal_error`.
pub struct Responder {
    channel: Option<Arc<ChannelInner>>,
    sequence: u64,
}

impl Responder {
    pub(crate) fn new(channel: Arc<ChannelInner>, sequence: u64) -> Self {
        Self {
            channel: Some(channel),
            sequence,
        }
    }

    /// Sequence number of the call being answered.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn reply(mut self, result: Result<Payload, RpcError>) {
        if let Some(channel) = self.channel.take() {
            channel.complete_call(self.sequence, result);
        }
    }

    pub fn ok(self, body: impl Into<Payload>) {
        self.reply(Ok(body.into()))
    }

    pub fn err(self, error: impl Into<RpcError>) {
        self.reply(Err(error.into()))
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("sequence", &self.sequence)
            .field("answered", &self.channel.is_none())
            .finish()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            tracing::warn!("responder for call #{} dropped without a reply", self.sequence);
            channel.complete_call(self.sequence, Err(ErrorKind::ServerInternalError.into()));
        }
    }
}
