//! Protocol middleware chain.
//!
//! Each middleware inspects the session's protocol tag and buffered bytes and
//! either claims the connection, defers until more bytes arrive, or hands
//! control to the next middleware. The terminal fallback is always last.

use crate::error::SessionError;
use crate::protocols::fallback::FallbackMiddleware;
use crate::runtime::session::Session;
use async_trait::async_trait;
use std::sync::Arc;

/// A protocol handler in the chain.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handle the session's current buffer or delegate to `next`.
    ///
    /// Returning `Ok(())` without calling `next` either means the buffer was
    /// handled or that the decision is deferred to the next receive.
    async fn invoke(&self, session: &Arc<Session>, next: Next<'_>) -> Result<(), SessionError>;

    /// Called exactly once per connection after it is gone.
    async fn on_disconnected(&self, _session: &Arc<Session>) {}
}

/// The remainder of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Pass control to the next middleware.
    pub async fn run(self, session: &Arc<Session>) -> Result<(), SessionError> {
        match self.rest.split_first() {
            Some((head, rest)) => head.invoke(session, Next { rest }).await,
            None => Ok(()),
        }
    }
}

/// Outcome of matching a fixed signature against buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// The signature is present.
    Match,
    /// The bytes seen so far agree with the signature but are too few to decide.
    NeedMore,
    /// The bytes cannot start this signature.
    Mismatch,
}

/// Match `signature` against the front of `buffer` without waiting for more bytes.
pub fn detect_prefix(buffer: &[u8], signature: &[u8]) -> Detection {
    if buffer.len() >= signature.len() {
        if buffer.starts_with(signature) {
            Detection::Match
        } else {
            Detection::Mismatch
        }
    } else if signature.starts_with(buffer) {
        Detection::NeedMore
    } else {
        Detection::Mismatch
    }
}

/// Ordered middleware sequence ending with a terminal fallback.
pub struct MiddlewareChain {
    /// Registration order; the fallback occupies the last slot.
    entries: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// A chain holding only the default fallback, which closes unclaimed connections.
    pub fn new() -> Self {
        Self::with_fallback(FallbackMiddleware::new())
    }

    /// A chain with a custom terminal fallback.
    pub fn with_fallback(fallback: impl Middleware) -> Self {
        Self {
            entries: vec![Arc::new(fallback)],
        }
    }

    /// Append a middleware ahead of the fallback.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        let at = self.entries.len() - 1;
        self.entries.insert(at, middleware);
    }

    /// Run the chain on the session's current buffer.
    pub async fn invoke(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        Next {
            rest: &self.entries,
        }
        .run(session)
        .await
    }

    /// Run every middleware's disconnect hook.
    pub async fn disconnected(&self, session: &Arc<Session>) {
        for middleware in &self.entries {
            middleware.on_disconnected(session).await;
        }
    }

    /// Middleware names in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::session::Protocol;
    use crate::runtime::transport::TransportKind;
    use parking_lot::Mutex;

    /// Records its name and optionally claims sessions whose buffer starts with `token`.
    struct Recorder {
        name: &'static str,
        token: &'static [u8],
        protocol: Protocol,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn invoke(&self, session: &Arc<Session>, next: Next<'_>) -> Result<(), SessionError> {
            self.log.lock().push(self.name);
            let current = session.protocol();
            if current != Protocol::Undetermined && current != self.protocol {
                return next.run(session).await;
            }
            let detection = detect_prefix(&session.buffer(), self.token);
            match detection {
                Detection::Match => {
                    session.set_protocol(self.protocol);
                    Ok(())
                }
                Detection::NeedMore => Ok(()),
                Detection::Mismatch => next.run(session).await,
            }
        }
    }

    fn chain(log: &Arc<Mutex<Vec<&'static str>>>) -> MiddlewareChain {
        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(Recorder {
            name: "policy",
            token: b"<policy",
            protocol: Protocol::Policy,
            log: Arc::clone(log),
        }));
        chain.push(Arc::new(Recorder {
            name: "http",
            token: b"GET ",
            protocol: Protocol::Http,
            log: Arc::clone(log),
        }));
        chain
    }

    async fn session_with(bytes: &[u8]) -> Arc<Session> {
        let session = Session::standalone(1);
        let (local, _remote) = tokio::io::duplex(64);
        session
            .attach(Box::new(local), None, TransportKind::Plain)
            .await;
        session.append_received(bytes);
        session
    }

    #[test]
    fn test_detect_prefix() {
        assert_eq!(detect_prefix(b"GET /", b"GET "), Detection::Match);
        assert_eq!(detect_prefix(b"GE", b"GET "), Detection::NeedMore);
        assert_eq!(detect_prefix(b"", b"GET "), Detection::NeedMore);
        assert_eq!(detect_prefix(b"POST", b"GET "), Detection::Mismatch);
        assert_eq!(detect_prefix(b"GX", b"GET "), Detection::Mismatch);
    }

    #[test]
    fn test_fallback_stays_last() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);
        assert_eq!(chain.names(), vec!["policy", "http", "fallback"]);
    }

    #[tokio::test]
    async fn test_chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);
        let session = session_with(b"GET / HTTP/1.1\r\n").await;

        chain.invoke(&session).await.unwrap();
        assert_eq!(*log.lock(), vec!["policy", "http"]);
        assert_eq!(session.protocol(), Protocol::Http);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_deferral_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);
        let session = session_with(b"<pol").await;

        chain.invoke(&session).await.unwrap();
        assert_eq!(*log.lock(), vec!["policy"]);
        assert_eq!(session.protocol(), Protocol::Undetermined);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_unclaimed_connection_is_closed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log);
        let session = session_with(b"\x00\x01garbage").await;

        chain.invoke(&session).await.unwrap();
        assert_eq!(*log.lock(), vec!["policy", "http"]);
        assert!(!session.is_connected());
    }
}
