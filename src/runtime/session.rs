//! Session state for one live connection.
//!
//! A session owns the accumulated receive buffer, the write half of its
//! transport, the negotiated protocol tag and a typed tag bag. Sessions are
//! recycled by the [`SessionPool`] once their disconnect hook has run.

use crate::error::TransportError;
use crate::runtime::pool::SessionPool;
use crate::runtime::tags::TagBag;
use crate::runtime::transport::{BoxedWriter, TransportKind};
use bytes::BytesMut;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

/// Application protocol negotiated on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Undetermined = 0,
    Policy = 1,
    Http = 2,
    WebSocket = 3,
    Fast = 4,
    ServerSentEvents = 5,
}

impl Protocol {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Protocol::Policy,
            2 => Protocol::Http,
            3 => Protocol::WebSocket,
            4 => Protocol::Fast,
            5 => Protocol::ServerSentEvents,
            _ => Protocol::Undetermined,
        }
    }
}

/// One live (or recyclable) connection.
pub struct Session {
    id: AtomicU64,
    /// Written once per connection via compare-exchange from `Undetermined`.
    protocol: AtomicU8,
    tags: RwLock<TagBag>,
    /// Received but not yet consumed bytes.
    buffer: Mutex<BytesMut>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    secure: AtomicBool,
    connected: AtomicBool,
    /// Guards the disconnect hook so it runs exactly once.
    disconnected: AtomicBool,
    shutdown: Notify,
    data_ready: Notify,
    pool: Weak<SessionPool>,
}

impl Session {
    pub(crate) fn new(id: u64, pool: Weak<SessionPool>) -> Self {
        Self {
            id: AtomicU64::new(id),
            protocol: AtomicU8::new(Protocol::Undetermined as u8),
            tags: RwLock::new(TagBag::new()),
            buffer: Mutex::new(BytesMut::new()),
            writer: tokio::sync::Mutex::new(None),
            remote_addr: Mutex::new(None),
            secure: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            shutdown: Notify::new(),
            data_ready: Notify::new(),
            pool,
        }
    }

    /// Create a session that does not belong to any pool (outbound clients).
    pub fn standalone(id: u64) -> Arc<Self> {
        Arc::new(Self::new(id, Weak::new()))
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// Negotiated protocol, `Undetermined` until a middleware claims it.
    pub fn protocol(&self) -> Protocol {
        Protocol::from_u8(self.protocol.load(Ordering::Acquire))
    }

    /// Tag the session's protocol.
    ///
    /// Succeeds if the session was undetermined or already carries
    /// `protocol`; returns `false` if another protocol was set first.
    pub fn set_protocol(&self, protocol: Protocol) -> bool {
        match self.protocol.compare_exchange(
            Protocol::Undetermined as u8,
            protocol as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == protocol as u8,
        }
    }

    pub fn tags(&self) -> RwLockReadGuard<'_, TagBag> {
        self.tags.read()
    }

    pub fn tags_mut(&self) -> RwLockWriteGuard<'_, TagBag> {
        self.tags.write()
    }

    /// Lock the receive buffer.
    ///
    /// Protocol code consumes bytes from the front and must remove what it
    /// consumed. The guard must not be held across an `.await`.
    pub fn buffer(&self) -> MutexGuard<'_, BytesMut> {
        self.buffer.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    /// Whether the session runs over TLS.
    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Owning pool, for enumeration and broadcast. `None` for standalone sessions.
    pub fn pool(&self) -> Option<Arc<SessionPool>> {
        self.pool.upgrade()
    }

    /// Write `data` to the peer, returning the number of bytes written.
    ///
    /// Concurrent senders are serialized so frames never interleave. A write
    /// failure closes the session.
    pub async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let result = async {
            stream.write_all(data).await?;
            stream.flush().await
        }
        .await;

        match result {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                drop(writer);
                self.close();
                Err(e.into())
            }
        }
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.shutdown.notify_waiters();
            self.data_ready.notify_one();
        }
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.shutdown.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent close cannot be missed
            notified.as_mut().enable();
            if !self.is_connected() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) async fn attach(
        &self,
        writer: BoxedWriter,
        remote_addr: Option<SocketAddr>,
        kind: TransportKind,
    ) {
        *self.writer.lock().await = Some(writer);
        *self.remote_addr.lock() = remote_addr;
        self.secure.store(kind == TransportKind::Tls, Ordering::Release);
        self.disconnected.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    /// Drop the write half, shutting it down first.
    pub(crate) async fn detach(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Append freshly received bytes and wake the processing task.
    pub(crate) fn append_received(&self, data: &[u8]) {
        self.buffer.lock().extend_from_slice(data);
        self.data_ready.notify_one();
    }

    pub(crate) async fn data_ready(&self) {
        self.data_ready.notified().await;
    }

    /// Returns `true` for the one caller that gets to run the disconnect hook.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    /// Reset all per-connection state ahead of reuse.
    pub(crate) fn reset(&self, id: u64) {
        self.id.store(id, Ordering::Release);
        self.protocol
            .store(Protocol::Undetermined as u8, Ordering::Release);
        self.tags.write().clear();
        self.buffer.lock().clear();
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = None;
        }
        *self.remote_addr.lock() = None;
        self.secure.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.disconnected.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("protocol", &self.protocol())
            .field("connected", &self.is_connected())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}
