//! Outbound Fast connections.
//!
//! A client speaks the same frames as an accepted session: it can call the
//! server and serve calls the server makes back through its own dispatcher.

use crate::dispatch::executor::Dispatcher;
use crate::dispatch::params::IntoParams;
use crate::error::{CallError, TransportError};
use crate::protocols::fast::calls::DEFAULT_CALL_TIMEOUT;
use crate::protocols::fast::handler::route;
use crate::protocols::fast::packet::{extract, DEFAULT_MAX_FRAME_LEN};
use crate::protocols::fast::peer::{FastPeer, RemoteException};
use crate::runtime::session::{Protocol, Session};
use crate::runtime::transport::{BoxedReader, Transport};
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8 * 1024;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Options for an outbound connection.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub call_timeout: Duration,
    pub max_frame_len: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// A connected Fast client.
pub struct FastClient {
    peer: Arc<FastPeer>,
}

impl FastClient {
    /// Connect over plaintext TCP with default options.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr().ok();
        Ok(Self::connect_with(
            Transport::plain(stream),
            remote_addr,
            dispatcher,
            ClientOptions::default(),
        )
        .await)
    }

    /// Run the client over an established transport, e.g. a client-side TLS stream.
    pub async fn connect_with(
        transport: Transport,
        remote_addr: Option<SocketAddr>,
        dispatcher: Arc<Dispatcher>,
        options: ClientOptions,
    ) -> Self {
        let session = Session::standalone(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
        session
            .attach(transport.writer, remote_addr, transport.kind)
            .await;
        session.set_protocol(Protocol::Fast);

        let peer = FastPeer::attach(
            &session,
            Arc::clone(dispatcher.serializer()),
            options.call_timeout,
        );
        debug!(session = session.id(), peer = ?remote_addr, "Fast client connected");

        tokio::spawn(read_loop(
            transport.reader,
            Arc::clone(&peer),
            dispatcher,
            options.max_frame_len,
        ));
        Self { peer }
    }

    pub fn peer(&self) -> &Arc<FastPeer> {
        &self.peer
    }

    pub fn session(&self) -> &Arc<Session> {
        self.peer.session()
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_connected()
    }

    /// Call `api` on the server and await its typed result.
    pub async fn invoke_api<R, P>(&self, api: &str, params: P) -> Result<R, CallError>
    where
        R: DeserializeOwned + Send + 'static,
        P: IntoParams,
    {
        self.peer.invoke_api(api, params).await
    }

    pub async fn invoke_api_with_timeout<R, P>(
        &self,
        api: &str,
        params: P,
        timeout: Duration,
    ) -> Result<R, CallError>
    where
        R: DeserializeOwned + Send + 'static,
        P: IntoParams,
    {
        self.peer
            .invoke_api_with_timeout(api, params, Some(timeout))
            .await
    }

    /// Send a request without awaiting a result.
    pub async fn invoke<P: IntoParams>(&self, api: &str, params: P) -> Result<(), CallError> {
        self.peer.invoke(api, params).await
    }

    pub fn subscribe_remote_exceptions(&self) -> broadcast::Receiver<RemoteException> {
        self.peer.subscribe_remote_exceptions()
    }

    /// Close the connection. Pending calls fail with "connection lost".
    pub fn close(&self) {
        self.session().close();
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.session().closed().await;
    }
}

impl Drop for FastClient {
    fn drop(&mut self) {
        self.peer.session().close();
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    peer: Arc<FastPeer>,
    dispatcher: Arc<Dispatcher>,
    max_frame_len: u32,
) {
    let session = Arc::clone(peer.session());
    let mut chunk = BytesMut::with_capacity(READ_CHUNK);

    loop {
        chunk.reserve(READ_CHUNK);
        tokio::select! {
            _ = session.closed() => break,
            read = reader.read_buf(&mut chunk) => match read {
                Ok(0) => break,
                Ok(_) => {
                    let frames = {
                        let mut buffer = session.buffer();
                        buffer.extend_from_slice(&chunk);
                        chunk.clear();
                        extract(&mut buffer, max_frame_len)
                    };
                    match frames {
                        Ok(frames) => {
                            for frame in frames {
                                route(&dispatcher, &peer, frame);
                            }
                        }
                        Err(e) => {
                            warn!(session = session.id(), error = %e, "Frame decode failed");
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!(session = session.id(), error = %e, "Read failed");
                    break;
                }
            }
        }
    }

    session.close();
    let drained = peer.fail_all();
    FastPeer::detach(&session);
    session.detach().await;
    debug!(session = session.id(), drained, "Fast client disconnected");
}
