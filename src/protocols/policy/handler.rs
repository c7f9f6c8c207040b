//! Policy middleware.

use super::{DEFAULT_POLICY, FLASH_POLICY_REQUEST};
use crate::error::SessionError;
use crate::runtime::middleware::{detect_prefix, Detection, Middleware, Next};
use crate::runtime::session::{Protocol, Session};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Answers a fixed policy request with a fixed document, then closes.
#[derive(Debug, Clone)]
pub struct PolicyMiddleware {
    request: Bytes,
    response: Bytes,
}

impl PolicyMiddleware {
    /// Responder for `request` with `response`.
    pub fn new(request: impl Into<Bytes>, response: impl Into<Bytes>) -> Self {
        Self {
            request: request.into(),
            response: response.into(),
        }
    }

    /// Flash policy responder with the permissive default document.
    pub fn flash() -> Self {
        Self::new(FLASH_POLICY_REQUEST, DEFAULT_POLICY)
    }

    /// Flash policy responder with a custom document.
    pub fn flash_with(policy: impl Into<Bytes>) -> Self {
        Self::new(FLASH_POLICY_REQUEST, policy)
    }
}

#[async_trait]
impl Middleware for PolicyMiddleware {
    fn name(&self) -> &'static str {
        "policy"
    }

    async fn invoke(&self, session: &Arc<Session>, next: Next<'_>) -> Result<(), SessionError> {
        match session.protocol() {
            Protocol::Undetermined => {}
            // Already answered; anything further is ignored until close
            Protocol::Policy => return Ok(()),
            _ => return next.run(session).await,
        }

        let detection = {
            let mut buffer = session.buffer();
            let detection = detect_prefix(&buffer, &self.request);
            if detection == Detection::Match {
                buffer.clear();
            }
            detection
        };

        match detection {
            Detection::NeedMore => Ok(()),
            Detection::Mismatch => next.run(session).await,
            Detection::Match => {
                session.set_protocol(Protocol::Policy);
                debug!(session = session.id(), "Serving policy file");
                session.send(&self.response).await?;
                session.close();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::middleware::MiddlewareChain;
    use crate::runtime::transport::TransportKind;
    use tokio::io::AsyncReadExt;

    async fn run(bytes: &[u8]) -> (Arc<Session>, tokio::io::DuplexStream) {
        let mut chain = MiddlewareChain::new();
        chain.push(Arc::new(PolicyMiddleware::flash_with("<ok/>")));

        let session = Session::standalone(1);
        let (local, remote) = tokio::io::duplex(256);
        session
            .attach(Box::new(local), None, TransportKind::Plain)
            .await;
        session.append_received(bytes);
        chain.invoke(&session).await.unwrap();
        (session, remote)
    }

    #[test]
    fn test_request_is_23_bytes() {
        assert_eq!(FLASH_POLICY_REQUEST.len(), 23);
    }

    #[tokio::test]
    async fn test_policy_request_answered_and_closed() {
        let (session, mut remote) = run(FLASH_POLICY_REQUEST).await;
        assert_eq!(session.protocol(), Protocol::Policy);
        assert!(!session.is_connected());

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<ok/>");
    }

    #[tokio::test]
    async fn test_partial_request_defers() {
        let (session, _remote) = run(b"<policy-file").await;
        assert_eq!(session.protocol(), Protocol::Undetermined);
        assert!(session.is_connected());
        assert_eq!(session.buffer().len(), 12);
    }

    #[tokio::test]
    async fn test_other_bytes_are_not_claimed() {
        let (session, _remote) = run(b"GET / HTTP/1.1\r\n\r\n").await;
        assert_ne!(session.protocol(), Protocol::Policy);
    }
}
