//! HTTP middleware and the application hand-off.

use super::parser::{detect, parse, HttpRequest, ParseResult};
use crate::error::SessionError;
use crate::runtime::middleware::{Detection, Middleware, Next};
use crate::runtime::session::{Protocol, Session};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

/// A response to write back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Plain-text body.
    pub fn text(self, text: impl Into<String>) -> Self {
        self.header("Content-Type", "text/plain; charset=utf-8")
            .body(text.into())
    }

    /// Serialize with `Content-Length` and `Connection` set.
    pub fn encode(&self, keep_alive: bool) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        buf.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            buf.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        buf.put_slice(if keep_alive {
            b"Connection: keep-alive\r\n\r\n".as_slice()
        } else {
            b"Connection: close\r\n\r\n".as_slice()
        });
        buf.put_slice(&self.body);
        buf
    }
}

/// Application code serving HTTP requests on the shared port.
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(&self, session: &Arc<Session>, request: HttpRequest) -> HttpResponse;
}

/// Answers every request with 404.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFoundHandler;

#[async_trait]
impl HttpHandler for NotFoundHandler {
    async fn handle(&self, _session: &Arc<Session>, _request: HttpRequest) -> HttpResponse {
        HttpResponse::not_found()
    }
}

/// Claims connections that open with an HTTP request line.
pub struct HttpMiddleware {
    handler: Arc<dyn HttpHandler>,
}

impl HttpMiddleware {
    pub fn new() -> Self {
        Self::with_handler(NotFoundHandler)
    }

    pub fn with_handler(handler: impl HttpHandler) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl Default for HttpMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for HttpMiddleware {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn invoke(&self, session: &Arc<Session>, next: Next<'_>) -> Result<(), SessionError> {
        match session.protocol() {
            Protocol::Http => {}
            Protocol::Undetermined => {
                let detection = detect(&session.buffer());
                match detection {
                    Detection::NeedMore => return Ok(()),
                    Detection::Mismatch => return next.run(session).await,
                    Detection::Match => {
                        if !session.set_protocol(Protocol::Http) {
                            return next.run(session).await;
                        }
                        debug!(
                            session = session.id(),
                            peer = ?session.remote_addr(),
                            "HTTP session"
                        );
                    }
                }
            }
            _ => return next.run(session).await,
        }

        // Serve every complete pipelined request in order
        loop {
            let parsed = {
                let mut buffer = session.buffer();
                match parse(&buffer) {
                    ParseResult::Complete(request, consumed) => {
                        buffer.advance(consumed);
                        Ok(request)
                    }
                    ParseResult::Incomplete => return Ok(()),
                    ParseResult::Error(e) => Err(e),
                }
            };

            let request = match parsed {
                Ok(request) => request,
                Err(e) => {
                    let response = HttpResponse::bad_request().text(e.clone());
                    let _ = session.send(&response.encode(false)).await;
                    return Err(SessionError::Malformed(e));
                }
            };

            let keep_alive = request.keep_alive();
            debug!(
                session = session.id(),
                method = %request.method,
                target = %request.target,
                "HTTP request"
            );
            let response = self.handler.handle(session, request).await;
            session.send(&response.encode(keep_alive)).await?;

            if !keep_alive {
                session.close();
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::middleware::MiddlewareChain;
    use crate::runtime::transport::TransportKind;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Echo;

    #[async_trait]
    impl HttpHandler for Echo {
        async fn handle(&self, _session: &Arc<Session>, request: HttpRequest) -> HttpResponse {
            HttpResponse::ok().text(format!("{} {}", request.method, request.path()))
        }
    }

    async fn session() -> (Arc<Session>, DuplexStream) {
        let session = Session::standalone(1);
        let (local, remote) = tokio::io::duplex(4096);
        session
            .attach(Box::new(local), None, TransportKind::Plain)
            .await;
        (session, remote)
    }

    fn chain(middleware: HttpMiddleware) -> MiddlewareChain {
        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(middleware));
        chain
    }

    #[test]
    fn test_encode_response() {
        let encoded = HttpResponse::not_found().encode(false);
        assert_eq!(
            &encoded[..],
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_close_after_response() {
        let chain = chain(HttpMiddleware::with_handler(Echo));
        let (session, mut remote) = session().await;

        session.append_received(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n");
        chain.invoke(&session).await.unwrap();
        assert_eq!(session.protocol(), Protocol::Http);
        assert!(!session.is_connected());

        session.detach().await;
        let mut response = String::new();
        remote.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nGET /hello"));
    }

    #[tokio::test]
    async fn test_keep_alive_serves_pipelined_requests() {
        let chain = chain(HttpMiddleware::new());
        let (session, mut remote) = session().await;

        session.append_received(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c");
        chain.invoke(&session).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(&session.buffer()[..], b"GET /c");

        let expected = HttpResponse::not_found().encode(true);
        let mut buf = vec![0u8; expected.len() * 2];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..expected.len()], &expected[..]);
        assert_eq!(&buf[expected.len()..], &expected[..]);
    }

    #[tokio::test]
    async fn test_partial_method_defers() {
        let chain = chain(HttpMiddleware::new());
        let (session, _remote) = session().await;

        session.append_received(b"DEL");
        chain.invoke(&session).await.unwrap();
        assert_eq!(session.protocol(), Protocol::Undetermined);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let chain = chain(HttpMiddleware::new());
        let (session, mut remote) = session().await;

        session.append_received(b"GET / HTTP/1.1\r\nbroken header\r\n\r\n");
        let err = chain.invoke(&session).await.unwrap_err();
        assert!(matches!(err, SessionError::Malformed(_)));

        let mut buf = [0u8; 24];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 400 Bad Request");
    }
}
