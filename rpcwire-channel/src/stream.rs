//! Ordered, abortable, timeout-guarded binary streams.

use crate::manager::StreamManager;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rpcwire_protocol::{ErrorKind, Payload, RpcError};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Item yielded by a [`StreamReader`].
pub type ChunkResult = Result<Bytes, RpcError>;

/// Stream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// Clean end of data.
    Closed,
    /// Aborted by the sender, by manager teardown, or by inactivity.
    Aborted,
}

struct StreamInner {
    next_index: u32,
    state: StreamState,
    tx: Option<mpsc::UnboundedSender<ChunkResult>>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every re-arm so a stale timer cannot fire.
    generation: u64,
}

struct StreamShared {
    id: u32,
    timeout: Option<Duration>,
    manager: Weak<StreamManager>,
    inner: Mutex<StreamInner>,
}

/// Receiving end of a stream as tracked by its manager.
///
/// Chunks pushed here are delivered, in order, to the paired
/// [`StreamReader`].
#[derive(Clone)]
pub struct BinaryStream {
    shared: Arc<StreamShared>,
}

impl std::fmt::Debug for BinaryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("BinaryStream")
            .field("id", &self.shared.id)
            .field("next_index", &inner.next_index)
            .field("state", &inner.state)
            .finish()
    }
}

impl BinaryStream {
    pub(crate) fn open(
        id: u32,
        timeout: Option<Duration>,
        manager: Weak<StreamManager>,
    ) -> (Self, StreamReader) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = Self {
            shared: Arc::new(StreamShared {
                id,
                timeout,
                manager,
                inner: Mutex::new(StreamInner {
                    next_index: 0,
                    state: StreamState::Open,
                    tx: Some(tx),
                    timer: None,
                    generation: 0,
                }),
            }),
        };
        stream.arm_timer(&mut stream.shared.inner.lock());
        (stream, StreamReader { id, rx })
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Index the next accepted chunk must carry.
    pub fn next_index(&self) -> u32 {
        self.shared.inner.lock().next_index
    }

    pub fn state(&self) -> StreamState {
        self.shared.inner.lock().state
    }

    /// Accepts the chunk at `index`.
    ///
    /// A chunk whose index is not the expected one is rejected with
    /// `stream_index_mismatch` and leaves the stream untouched. An empty chunk
    /// closes the stream.
    pub fn push(&self, index: u32, chunk: Payload) -> Result<(), RpcError> {
        let mut inner = self.shared.inner.lock();
        if inner.state != StreamState::Open {
            return Err(ErrorKind::StreamClosed.into());
        }
        if index != inner.next_index {
            tracing::debug!(
                "stream {:#010x}: expected chunk {}, got {}",
                self.shared.id,
                inner.next_index,
                index
            );
            return Err(ErrorKind::StreamIndexMismatch.into());
        }
        if chunk.is_empty() {
            self.finish(inner, StreamState::Closed, None);
            return Ok(());
        }
        self.append(&mut inner, chunk.into_bytes());
        Ok(())
    }

    fn append(&self, inner: &mut StreamInner, chunk: Bytes) {
        inner.next_index = inner.next_index.wrapping_add(1);
        if let Some(tx) = &inner.tx {
            // The reader may have been dropped; keep accepting chunks anyway.
            let _ = tx.send(Ok(chunk));
        }
        self.arm_timer(inner);
    }

    /// Ends the stream cleanly.
    pub fn close(&self) {
        let inner = self.shared.inner.lock();
        if inner.state == StreamState::Open {
            self.finish(inner, StreamState::Closed, None);
        }
    }

    /// Fails the stream with `stream_aborted`.
    pub fn abort(&self) {
        self.fail(ErrorKind::StreamAborted);
    }

    fn fail(&self, kind: ErrorKind) {
        let inner = self.shared.inner.lock();
        if inner.state == StreamState::Open {
            self.finish(inner, StreamState::Aborted, Some(kind.into()));
        }
    }

    fn expire(&self, generation: u64) {
        let inner = self.shared.inner.lock();
        if inner.state == StreamState::Open && inner.generation == generation {
            tracing::debug!("stream {:#010x} timed out", self.shared.id);
            self.finish(inner, StreamState::Aborted, Some(ErrorKind::Timeout.into()));
        }
    }

    fn finish(
        &self,
        mut inner: parking_lot::MutexGuard<'_, StreamInner>,
        state: StreamState,
        error: Option<RpcError>,
    ) {
        inner.state = state;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if let Some(tx) = inner.tx.take() {
            if let Some(error) = error {
                let _ = tx.send(Err(error));
            }
        }
        drop(inner);

        if let Some(manager) = self.shared.manager.upgrade() {
            manager.forget(self.shared.id);
        }
    }

    fn arm_timer(&self, inner: &mut StreamInner) {
        let Some(timeout) = self.shared.timeout else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "stream {:#010x}: no runtime, inactivity timeout disabled",
                self.shared.id
            );
            return;
        };

        inner.generation += 1;
        let generation = inner.generation;
        let weak = Arc::downgrade(&self.shared);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                BinaryStream { shared }.expire(generation);
            }
        });
        if let Some(previous) = inner.timer.replace(timer) {
            previous.abort();
        }
    }
}

/// Application-facing end of a stream: an ordered sequence of chunks.
///
/// The sequence ends with `None` after a clean close, or yields one `Err`
/// (`stream_aborted`, `timeout`) and then ends.
#[derive(Debug)]
pub struct StreamReader {
    id: u32,
    rx: mpsc::UnboundedReceiver<ChunkResult>,
}

impl StreamReader {
    /// Stream id to hand to the sending peer.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Waits for the next chunk.
    pub async fn next_chunk(&mut self) -> Option<ChunkResult> {
        self.rx.recv().await
    }

    /// Collects every chunk until the stream closes.
    pub async fn read_to_end(mut self) -> Result<Bytes, RpcError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl futures_core::Stream for StreamReader {
    type Item = ChunkResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(timeout: Option<Duration>) -> (BinaryStream, StreamReader) {
        BinaryStream::open(7, timeout, Weak::new())
    }

    #[tokio::test]
    async fn test_in_order_chunks() {
        let (stream, mut reader) = open(None);
        assert_eq!(stream.next_index(), 0);

        stream.push(0, "ab".into()).unwrap();
        stream.push(1, "cd".into()).unwrap();
        assert_eq!(stream.next_index(), 2);

        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "ab");
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "cd");
    }

    #[tokio::test]
    async fn test_reader_waits_for_chunk() {
        let (stream, mut reader) = open(None);
        let mut next = tokio_test::task::spawn(reader.next_chunk());
        tokio_test::assert_pending!(next.poll());

        stream.push(0, "late".into()).unwrap();
        assert!(next.is_woken());
        let chunk = tokio_test::assert_ready!(next.poll());
        assert_eq!(chunk.unwrap().unwrap(), "late");
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_rejected_without_state_change() {
        let (stream, mut reader) = open(None);

        let err = stream.push(1, "late".into()).unwrap_err();
        assert!(err.is(ErrorKind::StreamIndexMismatch));
        assert_eq!(stream.next_index(), 0);
        assert_eq!(stream.state(), StreamState::Open);

        stream.push(0, "first".into()).unwrap();
        assert_eq!(stream.next_index(), 1);
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "first");
    }

    #[tokio::test]
    async fn test_empty_chunk_closes() {
        let (stream, reader) = open(None);
        stream.push(0, "data".into()).unwrap();
        stream.push(1, Payload::new()).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);

        assert_eq!(reader.read_to_end().await.unwrap(), "data");
        assert!(stream.push(2, "more".into()).unwrap_err().is(ErrorKind::StreamClosed));
    }

    #[tokio::test]
    async fn test_abort_is_an_error_not_an_end() {
        let (stream, mut reader) = open(None);
        stream.push(0, "partial".into()).unwrap();
        stream.abort();
        assert_eq!(stream.state(), StreamState::Aborted);

        assert!(reader.next_chunk().await.unwrap().is_ok());
        let err = reader.next_chunk().await.unwrap().unwrap_err();
        assert!(err.is(ErrorKind::StreamAborted));
        assert!(reader.next_chunk().await.is_none());

        // Closing after abort changes nothing
        stream.close();
        assert_eq!(stream.state(), StreamState::Aborted);
    }

    #[tokio::test]
    async fn test_inactivity_timeout() {
        let (stream, reader) = open(Some(Duration::from_millis(30)));
        stream.push(0, "x".into()).unwrap();

        let err = reader.read_to_end().await.unwrap_err();
        assert!(err.is(ErrorKind::Timeout));
        assert_eq!(stream.state(), StreamState::Aborted);
    }

    #[tokio::test]
    async fn test_append_resets_timer() {
        let (stream, reader) = open(Some(Duration::from_millis(80)));
        for index in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            stream.push(index, "tick".into()).unwrap();
        }
        stream.close();
        assert_eq!(reader.read_to_end().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_reader_as_stream() {
        use std::future::poll_fn;

        let (stream, mut reader) = open(None);
        stream.push(0, "one".into()).unwrap();
        stream.close();

        let first = poll_fn(|cx| futures_core::Stream::poll_next(Pin::new(&mut reader), cx)).await;
        assert_eq!(first.unwrap().unwrap(), "one");
        let end = poll_fn(|cx| futures_core::Stream::poll_next(Pin::new(&mut reader), cx)).await;
        assert!(end.is_none());
    }
}
