//! Terminal middleware for connections no protocol handler claimed.

use crate::error::SessionError;
use crate::runtime::middleware::{Middleware, Next};
use crate::runtime::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Closes the connection, optionally after replying with a fixed message.
#[derive(Debug, Default)]
pub struct FallbackMiddleware {
    reply: Option<Bytes>,
}

impl FallbackMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `reply` (e.g. "protocol not recognized") before closing.
    pub fn with_reply(reply: impl Into<Bytes>) -> Self {
        Self {
            reply: Some(reply.into()),
        }
    }
}

#[async_trait]
impl Middleware for FallbackMiddleware {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn invoke(&self, session: &Arc<Session>, _next: Next<'_>) -> Result<(), SessionError> {
        let buffered = session.buffer().len();
        debug!(
            session = session.id(),
            protocol = ?session.protocol(),
            buffered,
            "Protocol not recognized, closing connection"
        );

        if let Some(reply) = &self.reply {
            // The connection is going away either way
            let _ = session.send(reply).await;
        }
        session.close();
        Ok(())
    }
}
