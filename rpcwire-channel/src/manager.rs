//! Stream registry.
//!
//! A [`StreamManager`] allocates random 32-bit stream ids, enforces the
//! configured capacity, and owns every open [`BinaryStream`]. It is either
//! private to one channel or shared by several (see [`StreamPolicy`]).

use crate::config::{StreamCapacity, StreamConfig};
use crate::stream::{BinaryStream, StreamReader};
use dashmap::DashMap;
use parking_lot::Mutex;
use rpcwire_protocol::{ErrorKind, RpcError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How many random ids are tried before creation gives up.
pub const MAX_ID_ATTEMPTS: usize = 64;

/// Which stream manager a channel uses.
#[derive(Debug, Clone)]
pub enum StreamPolicy {
    /// A private manager, closed together with the channel.
    PerChannel(StreamConfig),
    /// A manager shared with other channels; left open when the channel closes.
    Shared(Arc<StreamManager>),
    /// No streams; inbound chunks are answered with `cmd_not_impl`.
    Disabled,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        StreamPolicy::PerChannel(StreamConfig::default())
    }
}

/// Registry of open binary streams.
#[derive(Debug)]
pub struct StreamManager {
    capacity: StreamCapacity,
    timeout: Option<Duration>,
    streams: DashMap<u32, BinaryStream>,
    /// Serializes the capacity check with the insert.
    create_lock: Mutex<()>,
    closed: AtomicBool,
}

impl StreamManager {
    pub fn new(config: &StreamConfig) -> Arc<Self> {
        Arc::new(Self {
            capacity: config.capacity(),
            timeout: config.timeout(),
            streams: DashMap::new(),
            create_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// A manager that refuses every stream.
    pub fn disabled() -> Arc<Self> {
        Self::new(&StreamConfig::new().with_max_streams(0))
    }

    /// Opens a new stream and returns its reader.
    ///
    /// Fails with `cmd_not_impl` when streams are disabled, `stream_closed`
    /// after [`close`](Self::close), and `system_busy` at capacity or when no
    /// free id turns up within [`MAX_ID_ATTEMPTS`] draws.
    pub fn create(self: &Arc<Self>) -> Result<StreamReader, RpcError> {
        self.create_with(rand::random::<u32>)
    }

    fn create_with(
        self: &Arc<Self>,
        mut next_id: impl FnMut() -> u32,
    ) -> Result<StreamReader, RpcError> {
        if self.capacity == StreamCapacity::Disabled {
            return Err(ErrorKind::CmdNotImpl.into());
        }

        let _guard = self.create_lock.lock();
        if self.is_closed() {
            return Err(ErrorKind::StreamClosed.into());
        }
        if let StreamCapacity::Limited(max) = self.capacity {
            if self.streams.len() >= max {
                tracing::debug!("stream capacity reached ({})", max);
                return Err(ErrorKind::SystemBusy.into());
            }
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = next_id();
            if let dashmap::mapref::entry::Entry::Vacant(entry) = self.streams.entry(id) {
                let (stream, reader) = BinaryStream::open(id, self.timeout, Arc::downgrade(self));
                entry.insert(stream);
                tracing::debug!("opened stream {:#010x}", id);
                return Ok(reader);
            }
        }

        tracing::warn!("no free stream id after {} attempts", MAX_ID_ATTEMPTS);
        Err(ErrorKind::SystemBusy.into())
    }

    /// Looks up an open stream.
    pub fn get(&self, id: u32) -> Option<BinaryStream> {
        self.streams.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.streams.contains_key(&id)
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn capacity(&self) -> StreamCapacity {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Aborts every open stream and refuses new ones.
    pub fn close(&self) {
        let streams: Vec<BinaryStream> = {
            let _guard = self.create_lock.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let streams = self.streams.iter().map(|e| e.value().clone()).collect();
            self.streams.clear();
            streams
        };

        if !streams.is_empty() {
            tracing::debug!("aborting {} open streams", streams.len());
        }
        for stream in streams {
            stream.abort();
        }
    }

    pub(crate) fn forget(&self, id: u32) {
        self.streams.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamState;
    use rpcwire_protocol::Payload;

    fn manager(max_streams: i64) -> Arc<StreamManager> {
        StreamManager::new(&StreamConfig::new().with_max_streams(max_streams).without_timeout())
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let manager = manager(-1);
        let reader = manager.create().unwrap();

        let stream = manager.get(reader.id()).unwrap();
        assert_eq!(stream.id(), reader.id());
        assert!(manager.contains(reader.id()));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_manager() {
        let manager = StreamManager::disabled();
        assert_eq!(manager.capacity(), StreamCapacity::Disabled);
        assert!(manager.create().unwrap_err().is(ErrorKind::CmdNotImpl));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let manager = manager(2);
        let first = manager.create().unwrap();
        let _second = manager.create().unwrap();
        assert!(manager.create().unwrap_err().is(ErrorKind::SystemBusy));

        // Closing one frees a slot
        manager.get(first.id()).unwrap().close();
        assert_eq!(manager.len(), 1);
        assert!(manager.create().is_ok());
    }

    #[tokio::test]
    async fn test_id_collisions_bounded() {
        let manager = manager(-1);
        let taken = manager.create_with(|| 42).unwrap();
        assert_eq!(taken.id(), 42);

        let mut draws = 0;
        let err = manager
            .create_with(|| {
                draws += 1;
                42
            })
            .unwrap_err();
        assert!(err.is(ErrorKind::SystemBusy));
        assert_eq!(draws, MAX_ID_ATTEMPTS);

        let mut ids = [42, 42, 43].into_iter();
        let reader = manager.create_with(|| ids.next().unwrap_or(0)).unwrap();
        assert_eq!(reader.id(), 43);
    }

    #[tokio::test]
    async fn test_finished_streams_are_removed() {
        let manager = manager(-1);
        let reader = manager.create().unwrap();
        let stream = manager.get(reader.id()).unwrap();

        stream.push(0, "x".into()).unwrap();
        stream.push(1, Payload::new()).unwrap();
        assert!(!manager.contains(reader.id()));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_close_aborts_all() {
        let manager = manager(-1);
        let a = manager.create().unwrap();
        let b = manager.create().unwrap();
        let stream_a = manager.get(a.id()).unwrap();

        manager.close();
        assert!(manager.is_closed());
        assert!(manager.is_empty());
        assert_eq!(stream_a.state(), StreamState::Aborted);

        for reader in [a, b] {
            let err = reader.read_to_end().await.unwrap_err();
            assert!(err.is(ErrorKind::StreamAborted));
        }
        assert!(manager.create().unwrap_err().is(ErrorKind::StreamClosed));

        // Idempotent
        manager.close();
    }

    #[tokio::test]
    async fn test_stream_timeout_removes_from_manager() {
        let manager = StreamManager::new(
            &StreamConfig::new().with_timeout(Duration::from_millis(20)),
        );
        let reader = manager.create().unwrap();
        let id = reader.id();

        let err = reader.read_to_end().await.unwrap_err();
        assert!(err.is(ErrorKind::Timeout));
        assert!(!manager.contains(id));
    }
}
