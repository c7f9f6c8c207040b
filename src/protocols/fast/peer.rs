//! Per-connection Fast state shared by the server and client sides.

use crate::dispatch::params::IntoParams;
use crate::error::{CallError, TransportError};
use crate::protocols::fast::calls::CallTable;
use crate::protocols::fast::packet::Frame;
use crate::protocols::fast::serializer::Serializer;
use crate::runtime::session::Session;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Tag under which a session's peer is stored.
const PEER_TAG: &str = "fast.peer";

const REMOTE_EXCEPTION_CAPACITY: usize = 64;

/// An exception response that matched no pending call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteException {
    pub session: u64,
    pub id: u64,
    pub message: String,
}

/// Call-side context of one Fast connection: id generation, the pending
/// call table and the orphan exception channel.
pub struct FastPeer {
    session: Arc<Session>,
    calls: Arc<CallTable>,
    next_id: AtomicU64,
    serializer: Arc<dyn Serializer>,
    remote_exceptions: broadcast::Sender<RemoteException>,
}

impl FastPeer {
    pub fn new(
        session: Arc<Session>,
        serializer: Arc<dyn Serializer>,
        call_timeout: Duration,
    ) -> Arc<Self> {
        let (remote_exceptions, _) = broadcast::channel(REMOTE_EXCEPTION_CAPACITY);
        Arc::new(Self {
            session,
            calls: CallTable::with_timeout(Arc::clone(&serializer), call_timeout),
            next_id: AtomicU64::new(1),
            serializer,
            remote_exceptions,
        })
    }

    /// Create a peer and store it in the session's tag bag.
    pub(crate) fn attach(
        session: &Arc<Session>,
        serializer: Arc<dyn Serializer>,
        call_timeout: Duration,
    ) -> Arc<Self> {
        let peer = Self::new(Arc::clone(session), serializer, call_timeout);
        session.tags_mut().set(PEER_TAG, Arc::clone(&peer));
        peer
    }

    /// The peer of a Fast session, if one was attached.
    pub fn of(session: &Session) -> Option<Arc<FastPeer>> {
        session.tags().get::<Arc<FastPeer>>(PEER_TAG)
    }

    /// Remove the peer from the session's tag bag, breaking the
    /// session/peer reference cycle.
    pub(crate) fn detach(session: &Session) -> Option<Arc<FastPeer>> {
        session.tags_mut().take::<Arc<FastPeer>>(PEER_TAG)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn calls(&self) -> &Arc<CallTable> {
        &self.calls
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Call `api` on the remote side and await its typed result.
    pub async fn invoke_api<R, P>(&self, api: &str, params: P) -> Result<R, CallError>
    where
        R: DeserializeOwned + Send + 'static,
        P: IntoParams,
    {
        self.invoke_api_with_timeout(api, params, None).await
    }

    /// Like [`invoke_api`](Self::invoke_api) with a per-call deadline.
    pub async fn invoke_api_with_timeout<R, P>(
        &self,
        api: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R, CallError>
    where
        R: DeserializeOwned + Send + 'static,
        P: IntoParams,
    {
        let body = self.encode_params(params)?;
        let id = self.next_id();
        let handle = self.calls.create::<R>(id, timeout)?;

        trace!(session = self.session.id(), api, id, "Invoking remote api");
        if let Err(e) = self.send_frame(&Frame::request(api, id, body)).await {
            self.calls.fail(id, CallError::ConnectionLost);
            return Err(e.into());
        }
        handle.await
    }

    /// Send a request without awaiting any result.
    pub async fn invoke<P: IntoParams>(&self, api: &str, params: P) -> Result<(), CallError> {
        let body = self.encode_params(params)?;
        self.notify_body(api, body).await?;
        Ok(())
    }

    /// Send a request with an already serialized body, awaiting nothing.
    pub(crate) async fn notify_body(&self, api: &str, body: Bytes) -> Result<(), TransportError> {
        let id = self.next_id();
        trace!(session = self.session.id(), api, id, "Sending notification");
        self.send_frame(&Frame::request(api, id, body)).await?;
        Ok(())
    }

    fn encode_params<P: IntoParams>(&self, params: P) -> Result<Bytes, CallError> {
        let values = params.into_values()?;
        Ok(self.serializer.serialize(&Value::Array(values))?)
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<usize, TransportError> {
        self.session.send(&frame.encode()).await
    }

    /// Route a response frame to its pending call.
    ///
    /// An unmatched success is dropped; an unmatched exception is published
    /// on the remote exception channel.
    pub fn handle_response(&self, frame: Frame) {
        let id = frame.id;
        if frame.is_exception {
            let message = frame.exception_message();
            if !self.calls.fail(id, CallError::Remote(message.clone())) {
                warn!(
                    session = self.session.id(),
                    id,
                    message = %message,
                    "Remote exception for unknown call"
                );
                let _ = self.remote_exceptions.send(RemoteException {
                    session: self.session.id(),
                    id,
                    message,
                });
            }
        } else if !self.calls.complete(id, frame.body) {
            trace!(session = self.session.id(), id, "Dropping orphan response");
        }
    }

    /// Orphan exception responses on this connection.
    pub fn subscribe_remote_exceptions(&self) -> broadcast::Receiver<RemoteException> {
        self.remote_exceptions.subscribe()
    }

    /// Fail every pending call with "connection lost".
    pub fn fail_all(&self) -> usize {
        self.calls.fail_all(|| CallError::ConnectionLost)
    }
}

impl std::fmt::Debug for FastPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastPeer")
            .field("session", &self.session.id())
            .field("pending", &self.calls.len())
            .finish()
    }
}
