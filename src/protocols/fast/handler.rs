//! Fast protocol middleware.

use crate::dispatch::executor::Dispatcher;
use crate::dispatch::params::IntoParams;
use crate::error::{CallError, SessionError};
use crate::protocols::fast::calls::DEFAULT_CALL_TIMEOUT;
use crate::protocols::fast::packet::{extract, Frame, DEFAULT_MAX_FRAME_LEN, FRAME_MAGIC};
use crate::protocols::fast::peer::FastPeer;
use crate::runtime::middleware::{Middleware, Next};
use crate::runtime::pool::SessionPool;
use crate::runtime::session::{Protocol, Session};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Claims connections whose first byte is the frame magic and routes their
/// frames: requests to the dispatcher, responses to the pending call table.
pub struct FastMiddleware {
    dispatcher: Arc<Dispatcher>,
    max_frame_len: u32,
    call_timeout: Duration,
}

impl FastMiddleware {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Upper bound on a frame's length field; larger frames close the session.
    pub fn with_max_frame_len(mut self, max_frame_len: u32) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Default deadline for server-initiated calls on accepted sessions.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn claim(&self, session: &Arc<Session>) -> Arc<FastPeer> {
        if let Some(peer) = FastPeer::of(session) {
            return peer;
        }
        debug!(session = session.id(), peer = ?session.remote_addr(), "Fast session");
        FastPeer::attach(
            session,
            Arc::clone(self.dispatcher.serializer()),
            self.call_timeout,
        )
    }
}

#[async_trait]
impl Middleware for FastMiddleware {
    fn name(&self) -> &'static str {
        "fast"
    }

    async fn invoke(&self, session: &Arc<Session>, next: Next<'_>) -> Result<(), SessionError> {
        match session.protocol() {
            Protocol::Fast => {}
            Protocol::Undetermined => {
                let first = session.buffer().first().copied();
                match first {
                    None => return Ok(()),
                    Some(FRAME_MAGIC) => {
                        if !session.set_protocol(Protocol::Fast) {
                            return next.run(session).await;
                        }
                    }
                    Some(_) => return next.run(session).await,
                }
            }
            _ => return next.run(session).await,
        }

        let peer = self.claim(session);
        let frames = {
            let mut buffer = session.buffer();
            extract(&mut buffer, self.max_frame_len)
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => {
                warn!(session = session.id(), error = %e, "Frame decode failed");
                return Err(e.into());
            }
        };

        for frame in frames {
            trace!(
                session = session.id(),
                id = frame.id,
                request = frame.is_request,
                exception = frame.is_exception,
                "Frame received"
            );
            route(&self.dispatcher, &peer, frame);
        }
        Ok(())
    }

    async fn on_disconnected(&self, session: &Arc<Session>) {
        if let Some(peer) = FastPeer::detach(session) {
            peer.fail_all();
        }
    }
}

/// Hand a received frame to its consumer.
pub(crate) fn route(dispatcher: &Arc<Dispatcher>, peer: &Arc<FastPeer>, frame: Frame) {
    if frame.is_request {
        // Spawned in frame order; completions may finish in any order
        dispatcher.spawn(Arc::clone(peer), frame);
    } else {
        peer.handle_response(frame);
    }
}

/// Send a notification to every live Fast session, returning how many
/// sessions it was written to.
pub async fn notify_all<P: IntoParams>(
    pool: &SessionPool,
    api: &str,
    params: P,
) -> Result<usize, CallError> {
    let values = Value::Array(params.into_values()?);
    let mut delivered = 0;
    for session in pool.sessions_with(Protocol::Fast) {
        let Some(peer) = FastPeer::of(&session) else {
            continue;
        };
        let body = peer.serializer().serialize(&values)?;
        match peer.notify_body(api, body).await {
            Ok(()) => delivered += 1,
            Err(e) => debug!(session = session.id(), api, error = %e, "Broadcast skipped session"),
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::action::ActionTable;
    use crate::dispatch::resolver::DefaultResolver;
    use crate::protocols::http::HttpMiddleware;
    use crate::protocols::policy::PolicyMiddleware;
    use crate::runtime::middleware::MiddlewareChain;
    use crate::runtime::transport::TransportKind;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Calc;

    fn chain() -> MiddlewareChain {
        let actions = ActionTable::builder()
            .service::<Calc, _>(|svc| {
                svc.action("GetSum", |_: Arc<Calc>, _, (a, b, c): (i32, i32, i32)| async move {
                    Ok(a + b + c)
                })
            })
            .build()
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(actions, DefaultResolver::new().singleton(Calc)));

        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(PolicyMiddleware::flash()));
        chain.push(Arc::new(HttpMiddleware::new()));
        chain.push(Arc::new(FastMiddleware::new(dispatcher)));
        chain
    }

    async fn session() -> (Arc<Session>, DuplexStream) {
        let session = Session::standalone(1);
        let (local, remote) = tokio::io::duplex(4096);
        session
            .attach(Box::new(local), None, TransportKind::Plain)
            .await;
        (session, remote)
    }

    async fn read_frame(remote: &mut DuplexStream) -> Frame {
        let mut buffer = BytesMut::new();
        loop {
            let mut frames = extract(&mut buffer, DEFAULT_MAX_FRAME_LEN).unwrap();
            if let Some(frame) = frames.pop() {
                return frame;
            }
            remote.read_buf(&mut buffer).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_frame_claimed_and_answered() {
        let chain = chain();
        let (session, mut remote) = session().await;

        session.append_received(&Frame::request("GetSum", 7, &b"[1,2,3]"[..]).encode());
        chain.invoke(&session).await.unwrap();
        assert_eq!(session.protocol(), Protocol::Fast);
        assert!(session.buffer().is_empty());

        let response = read_frame(&mut remote).await;
        assert_eq!(response, Frame::response(7, &b"6"[..]));
    }

    #[tokio::test]
    async fn test_split_frame_waits_for_rest() {
        let chain = chain();
        let (session, mut remote) = session().await;
        let encoded = Frame::request("GetSum", 1, &b"[2,2,2]"[..]).encode();

        session.append_received(&encoded[..3]);
        chain.invoke(&session).await.unwrap();
        assert_eq!(session.protocol(), Protocol::Fast);
        assert_eq!(session.buffer().len(), 3);

        session.append_received(&encoded[3..]);
        chain.invoke(&session).await.unwrap();
        assert_eq!(read_frame(&mut remote).await.body, &b"6"[..]);
    }

    #[tokio::test]
    async fn test_protocol_is_sticky() {
        let chain = chain();
        let (session, _remote) = session().await;

        session.append_received(&Frame::request("GetSum", 1, &b"[0,0,0]"[..]).encode());
        chain.invoke(&session).await.unwrap();

        // HTTP-looking bytes on a Fast session are a corrupt stream, not a new protocol
        session.append_received(b"GET / HTTP/1.1\r\n\r\n");
        let err = chain.invoke(&session).await.unwrap_err();
        assert!(matches!(err, SessionError::Frame(_)));
        assert_eq!(session.protocol(), Protocol::Fast);
    }

    #[tokio::test]
    async fn test_http_is_not_claimed() {
        let chain = chain();
        let (session, _remote) = session().await;

        session.append_received(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        chain.invoke(&session).await.unwrap();
        assert_eq!(session.protocol(), Protocol::Http);
        assert!(FastPeer::of(&session).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_calls() {
        let chain = chain();
        let (session, _remote) = session().await;
        session.append_received(&Frame::response(1, &b"0"[..]).encode());
        chain.invoke(&session).await.unwrap();

        let peer = FastPeer::of(&session).unwrap();
        let calls: Vec<_> = (100..103)
            .map(|id| peer.calls().create::<i32>(id, None).unwrap())
            .collect();

        chain.disconnected(&session).await;
        for call in calls {
            assert!(matches!(call.await, Err(CallError::ConnectionLost)));
        }
        assert!(peer.calls().is_empty());
        assert!(FastPeer::of(&session).is_none());
    }
}
