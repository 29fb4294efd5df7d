//! Outbound side of a binary stream.

use crate::channel::Channel;
use rpcwire_protocol::{ErrorKind, Payload, RpcError, ABORT_INDEX};

/// Numbers and sends chunks for one of the peer's streams.
///
/// Chunks go out one at a time; each `send` waits for the peer to accept the
/// chunk before the index advances.
#[derive(Debug)]
pub struct StreamSender {
    channel: Channel,
    stream_id: u32,
    next_index: u32,
}

impl StreamSender {
    pub(crate) fn new(channel: Channel, stream_id: u32) -> Self {
        Self {
            channel,
            stream_id,
            next_index: 0,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Index the next chunk will carry.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Sends one chunk. Empty chunks are skipped, since the peer reads an
    /// empty chunk as end of data.
    ///
    /// Fails with `system_busy` once the index space is used up; the last
    /// index is reserved for aborts.
    pub async fn send(&mut self, chunk: impl Into<Payload>) -> Result<(), RpcError> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        self.check_index()?;
        self.channel
            .send_binary_chunk(self.stream_id, Some(self.next_index), Some(chunk))
            .await?;
        self.next_index += 1;
        Ok(())
    }

    /// Ends the stream cleanly.
    pub async fn finish(self) -> Result<(), RpcError> {
        self.check_index()?;
        self.channel
            .send_binary_chunk(self.stream_id, Some(self.next_index), None)
            .await
    }

    /// Aborts the stream; the peer's reader sees `stream_aborted`.
    pub async fn abort(self) -> Result<(), RpcError> {
        self.channel
            .send_binary_chunk(self.stream_id, None, None)
            .await
    }

    fn check_index(&self) -> Result<(), RpcError> {
        if self.next_index == ABORT_INDEX {
            return Err(ErrorKind::SystemBusy.into());
        }
        Ok(())
    }
}
