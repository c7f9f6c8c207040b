//! TCP listener serving every protocol on one port.
//!
//! Each accepted connection gets a pooled session and two tasks: the read
//! loop, which only moves bytes into the session buffer, and a processing
//! task that runs the middleware chain on the accumulated buffer. A slow
//! handler therefore never stalls reads.

use crate::runtime::middleware::{Middleware, MiddlewareChain};
use crate::runtime::pool::SessionPool;
use crate::runtime::session::Session;
use crate::runtime::transport::{BoxedReader, Transport};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace};

/// Maximum number of concurrent connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Read buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after an accept error that is not specific to one connection
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Live connection limit; also bounds the recycled session pool.
    pub max_connections: usize,
    /// Bytes requested per socket read.
    pub buffer_size: usize,
    pub handshake_timeout: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// A listener being configured.
pub struct Listener {
    options: ListenerOptions,
    chain: MiddlewareChain,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub fn new(options: ListenerOptions) -> Self {
        Self {
            options,
            chain: MiddlewareChain::new(),
            tls: None,
        }
    }

    /// Append a middleware. Chain order is registration order; the
    /// fallback always stays last.
    pub fn use_middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.chain.push(Arc::new(middleware));
        self
    }

    /// Wrap every accepted connection in TLS.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    /// Bind `addr` and start accepting connections.
    pub async fn start(self, addr: SocketAddr, backlog: i32) -> io::Result<RunningListener> {
        let listener = TcpListener::from_std(bind(addr, backlog)?)?;
        let local_addr = listener.local_addr()?;
        let pool = SessionPool::new(self.options.max_connections);

        let shared = Arc::new(Shared {
            connection_limit: Arc::new(Semaphore::new(self.options.max_connections)),
            chain: self.chain,
            tls: self.tls,
            options: self.options,
            pool: Arc::clone(&pool),
        });

        info!(
            address = %local_addr,
            tls = shared.tls.is_some(),
            middleware = ?shared.chain.names(),
            "Server listening"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, shared, stop_rx));

        Ok(RunningListener {
            local_addr,
            pool,
            stop: stop_tx,
            task,
        })
    }
}

/// Handle to a started listener.
pub struct RunningListener {
    local_addr: SocketAddr,
    pool: Arc<SessionPool>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live sessions, for enumeration and broadcast.
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Stop accepting and close every live session.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "Accept loop failed");
        }
        self.pool.close_all();
        info!(address = %self.local_addr, "Server stopped");
    }
}

struct Shared {
    chain: MiddlewareChain,
    tls: Option<TlsAcceptor>,
    options: ListenerOptions,
    pool: Arc<SessionPool>,
    connection_limit: Arc<Semaphore>,
}

fn bind(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut stop: oneshot::Receiver<()>) {
    loop {
        // Wait for a connection slot
        let permit = tokio::select! {
            _ = &mut stop => break,
            permit = Arc::clone(&shared.connection_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        serve(shared, stream, addr).await;
                        drop(permit);
                    });
                }
                Err(e) => match accept_backoff(&e) {
                    None => debug!(error = %e, "Connection dropped before accept"),
                    Some(backoff) => {
                        error!(error = %e, ?backoff, "Failed to accept connection");
                        tokio::select! {
                            _ = &mut stop => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                },
            },
        }
    }
}

/// Errors tied to a single aborted connection are retried at once. Anything
/// else, such as running out of file descriptors, would fail again immediately.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_ERROR_BACKOFF),
    }
}

/// Drive one connection from handshake to recycling.
async fn serve(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let _ = stream.set_nodelay(true);

    let transport = match &shared.tls {
        Some(acceptor) => {
            match Transport::tls(stream, acceptor, shared.options.handshake_timeout).await {
                Ok(transport) => transport,
                Err(e) => {
                    debug!(peer = %addr, error = %e, "TLS handshake failed");
                    return;
                }
            }
        }
        None => Transport::plain(stream),
    };

    let session = shared.pool.acquire();
    session
        .attach(transport.writer, Some(addr), transport.kind)
        .await;
    debug!(
        session = session.id(),
        peer = %addr,
        secure = session.is_secure(),
        "Session connected"
    );

    let (eof_tx, eof_rx) = oneshot::channel();
    let processor = tokio::spawn(process(Arc::clone(&shared), Arc::clone(&session), eof_rx));
    match read_loop(transport.reader, &session, shared.options.buffer_size).await {
        // Let the processor finish what the peer sent before it half-closed
        ReadEnd::Eof => {
            let _ = eof_tx.send(());
        }
        ReadEnd::Closed | ReadEnd::Failed => session.close(),
    }

    let _ = processor.await;
    session.close();
    if session.mark_disconnected() {
        shared.chain.disconnected(&session).await;
    }
    session.detach().await;
    debug!(session = session.id(), peer = %addr, "Session disconnected");
    shared.pool.release(session);
}

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    /// The peer finished sending.
    Eof,
    /// The session was closed locally.
    Closed,
    Failed,
}

/// Move received bytes into the session buffer until EOF, error or close.
async fn read_loop(
    mut reader: BoxedReader,
    session: &Arc<Session>,
    buffer_size: usize,
) -> ReadEnd {
    let mut chunk = BytesMut::with_capacity(buffer_size);
    loop {
        chunk.reserve(buffer_size);
        tokio::select! {
            _ = session.closed() => return ReadEnd::Closed,
            read = reader.read_buf(&mut chunk) => match read {
                Ok(0) => {
                    trace!(session = session.id(), "Connection closed by peer");
                    return ReadEnd::Eof;
                }
                Ok(n) => {
                    trace!(session = session.id(), bytes = n, "Received");
                    session.append_received(&chunk);
                    chunk.clear();
                }
                Err(e) => {
                    debug!(session = session.id(), error = %e, "Read failed");
                    return ReadEnd::Failed;
                }
            },
        }
    }
}

/// Run the middleware chain each time new bytes arrive.
///
/// Once `eof` fires, the chain gets one last pass over whatever is still
/// buffered.
async fn process(shared: Arc<Shared>, session: Arc<Session>, mut eof: oneshot::Receiver<()>) {
    loop {
        let last = tokio::select! {
            biased;
            _ = session.data_ready() => false,
            _ = &mut eof => true,
        };
        if !session.is_connected() {
            break;
        }
        if last && session.buffer().is_empty() {
            break;
        }
        if let Err(e) = shared.chain.invoke(&session).await {
            debug!(session = session.id(), error = %e, "Closing session");
            session.close();
            break;
        }
        if last || !session.is_connected() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::action::ActionTable;
    use crate::dispatch::context::CallContext;
    use crate::dispatch::executor::Dispatcher;
    use crate::dispatch::resolver::DefaultResolver;
    use crate::error::{ActionError, CallError};
    use crate::protocols::fast::client::{ClientOptions, FastClient};
    use crate::protocols::fast::handler::notify_all;
    use crate::protocols::fast::FastMiddleware;
    use crate::protocols::http::HttpMiddleware;
    use crate::protocols::policy::{PolicyMiddleware, FLASH_POLICY_REQUEST};
    use crate::runtime::session::Protocol;
    use crate::runtime::transport::{tls_acceptor, TransportKind};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    struct Calc;

    /// Client-side service receiving server callbacks.
    struct Inbox {
        name: String,
        notices: mpsc::UnboundedSender<String>,
    }

    fn server_dispatcher() -> Arc<Dispatcher> {
        let actions = ActionTable::builder()
            .service::<Calc, _>(|svc| {
                svc.action("GetSum", |_: Arc<Calc>, _, (a, b, c): (i32, i32, i32)| async move {
                    Ok(a + b + c)
                })
                .action("Sleep", |_: Arc<Calc>, _, (): ()| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(0)
                })
                .action("IsSecure", |_: Arc<Calc>, ctx: CallContext, (): ()| async move {
                    Ok(ctx.session().is_secure())
                })
                .action("Greet", |_: Arc<Calc>, ctx: CallContext, (): ()| async move {
                    // Call back into the client on the same connection
                    let name: String = ctx
                        .peer()
                        .invoke_api("WhoAreYou", ())
                        .await
                        .map_err(|e| ActionError::failed(e.to_string()))?;
                    Ok(format!("hello, {}", name))
                })
            })
            .build()
            .unwrap();
        Arc::new(Dispatcher::new(actions, DefaultResolver::new().singleton(Calc)))
    }

    fn client_dispatcher(notices: mpsc::UnboundedSender<String>) -> Arc<Dispatcher> {
        let actions = ActionTable::builder()
            .service::<Inbox, _>(|svc| {
                svc.action("WhoAreYou", |inbox: Arc<Inbox>, _, (): ()| async move {
                    Ok(inbox.name.clone())
                })
                .action("Notice", |inbox: Arc<Inbox>, _, (text,): (String,)| async move {
                    let _ = inbox.notices.send(text);
                    Ok(())
                })
            })
            .build()
            .unwrap();
        let inbox = Inbox {
            name: "client-1".to_string(),
            notices,
        };
        Arc::new(Dispatcher::new(actions, DefaultResolver::new().singleton(inbox)))
    }

    fn listener() -> Listener {
        let mut listener = Listener::new(ListenerOptions::default());
        listener
            .use_middleware(PolicyMiddleware::flash_with("<ok/>\0"))
            .use_middleware(HttpMiddleware::new())
            .use_middleware(FastMiddleware::new(server_dispatcher()));
        listener
    }

    async fn start() -> RunningListener {
        listener()
            .start("127.0.0.1:0".parse().unwrap(), 128)
            .await
            .unwrap()
    }

    async fn connect(server: &RunningListener) -> (FastClient, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = FastClient::connect(server.local_addr(), client_dispatcher(tx))
            .await
            .unwrap();
        (client, rx)
    }

    /// Poll `check` until it holds or a second passes.
    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_get_sum_end_to_end() {
        let server = start().await;
        let (client, _notices) = connect(&server).await;

        let sum: i32 = client.invoke_api("GetSum", (1, 2, 3)).await.unwrap();
        assert_eq!(sum, 6);

        let sessions = server.pool().sessions_with(Protocol::Fast);
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].is_secure());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_api_is_remote_exception() {
        let server = start().await;
        let (client, _notices) = connect(&server).await;

        match client.invoke_api::<i32, _>("Nope", ()).await {
            Err(CallError::Remote(message)) => assert_eq!(message, "api not found: Nope"),
            other => panic!("unexpected: {:?}", other),
        }
        // The connection survives a dispatch failure
        assert_eq!(client.invoke_api::<i32, _>("getsum", (1, 1, 1)).await.unwrap(), 3);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_server_calls_back_into_client() {
        let server = start().await;
        let (client, _notices) = connect(&server).await;

        let greeting: String = client.invoke_api("Greet", ()).await.unwrap();
        assert_eq!(greeting, "hello, client-1");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_calls_correlate_by_id() {
        let server = start().await;
        let (client, _notices) = connect(&server).await;
        let client = Arc::new(client);

        let calls: Vec<_> = (0..20)
            .map(|i| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.invoke_api::<i32, _>("GetSum", (i, i, i)).await })
            })
            .collect();
        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), 3 * i as i32);
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_notify_all_reaches_fast_sessions() {
        let server = start().await;
        let (client, mut notices) = connect(&server).await;

        // The server only learns the protocol from the first frame
        let _: i32 = client.invoke_api("GetSum", (0, 0, 0)).await.unwrap();

        let delivered = notify_all(server.pool(), "Notice", ("maintenance at noon",))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(notices.recv().await.unwrap(), "maintenance at noon");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_client_close_fails_pending_calls() {
        let server = start().await;
        let (client, _notices) = connect(&server).await;
        let client = Arc::new(client);

        let pending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.invoke_api::<i32, _>("Sleep", ()).await })
        };
        assert!(eventually(|| client.peer().calls().len() == 1).await);

        client.close();
        assert!(matches!(pending.await.unwrap(), Err(CallError::ConnectionLost)));
        assert!(eventually(|| client.peer().calls().is_empty()).await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_call_timeout_leaves_connection_usable() {
        let server = start().await;
        let (client, _notices) = connect(&server).await;

        let err = client
            .invoke_api_with_timeout::<i32, _>("Sleep", (), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout { .. }));
        assert!(client.is_connected());
        assert_eq!(client.invoke_api::<i32, _>("GetSum", (2, 2, 2)).await.unwrap(), 6);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_http_and_policy_share_the_port() {
        let server = start().await;

        let mut http = TcpStream::connect(server.local_addr()).await.unwrap();
        http.write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        http.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

        let mut policy = TcpStream::connect(server.local_addr()).await.unwrap();
        policy.write_all(FLASH_POLICY_REQUEST).await.unwrap();
        let mut response = Vec::new();
        policy.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"<ok/>\0");

        server.stop().await;
    }

    #[test]
    fn test_accept_backoff_only_for_persistent_errors() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_backoff(&aborted), None);
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(accept_backoff(&reset), None);

        // EMFILE
        let exhausted = io::Error::from_raw_os_error(24);
        assert_eq!(accept_backoff(&exhausted), Some(ACCEPT_ERROR_BACKOFF));
        let other = io::Error::new(io::ErrorKind::Other, "accept failed");
        assert_eq!(accept_backoff(&other), Some(ACCEPT_ERROR_BACKOFF));
    }

    #[tokio::test]
    async fn test_half_closed_policy_request_is_answered() {
        let server = start().await;

        for _ in 0..20 {
            let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
            stream.write_all(FLASH_POLICY_REQUEST).await.unwrap();
            stream.shutdown().await.unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.unwrap();
            assert_eq!(response, b"<ok/>\0");
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_half_closed_http_request_is_answered() {
        let server = start().await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream
            .write_all(b"GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

        let pool = Arc::clone(server.pool());
        assert!(eventually(|| pool.is_empty()).await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unrecognized_protocol_is_closed() {
        let server = start().await;

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(b"\x00\x01\x02 junk").await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let pool = Arc::clone(server.pool());
        assert!(eventually(|| pool.is_empty()).await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_sessions_are_recycled_after_disconnect() {
        let server = start().await;
        let (client, _notices) = connect(&server).await;
        let _: i32 = client.invoke_api("GetSum", (1, 2, 3)).await.unwrap();
        assert_eq!(server.pool().len(), 1);

        drop(client);
        let pool = Arc::clone(server.pool());
        assert!(eventually(|| pool.is_empty() && pool.recycled() == 1).await);

        // The next connection reuses the reset session
        let (client, _notices) = connect(&server).await;
        let _: i32 = client.invoke_api("GetSum", (1, 2, 3)).await.unwrap();
        assert_eq!(pool.recycled(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_tls_round_trip() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        let acceptor = tls_acceptor(vec![cert.clone()], key).unwrap();

        let server = listener()
            .with_tls(acceptor)
            .start("127.0.0.1:0".parse().unwrap(), 128)
            .await
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert).unwrap();
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect(server.local_addr()).await.unwrap();
        let tls = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();

        let (tx, _notices) = mpsc::unbounded_channel();
        let client = FastClient::connect_with(
            Transport::from_io(tls, TransportKind::Tls),
            Some(server.local_addr()),
            client_dispatcher(tx),
            ClientOptions::default(),
        )
        .await;

        assert_eq!(client.invoke_api::<i32, _>("GetSum", (1, 2, 3)).await.unwrap(), 6);
        assert!(client.invoke_api::<bool, _>("IsSecure", ()).await.unwrap());
        assert!(client.session().is_secure());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_plaintext_client_fails_tls_handshake() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        let acceptor = tls_acceptor(vec![certified.cert.der().clone()], key).unwrap();
        let server = listener()
            .with_tls(acceptor)
            .start("127.0.0.1:0".parse().unwrap(), 128)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut rest = Vec::new();
        // The server drops the connection; a reset is as good as EOF here
        let _ = stream.read_to_end(&mut rest).await;
        assert!(!String::from_utf8_lossy(&rest).contains("HTTP/1.1"));
        assert!(server.pool().is_empty());
        server.stop().await;
    }
}
