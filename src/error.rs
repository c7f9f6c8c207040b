//! Error types shared across the runtime, the Fast protocol and dispatch.
//!
//! Transport and frame errors never escape to application code; they close
//! the one session they belong to. Call and action errors are what
//! applications see.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Socket-level failures. Always fatal to a single session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session is not connected")]
    NotConnected,
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("tls handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fast frame decode failures. The byte stream can no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unexpected magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("frame length {0} is below the minimum header size")]
    TooShort(u32),
    #[error("frame length {len} exceeds limit {max}")]
    TooLarge { len: u32, max: u32 },
    #[error("api name length {0} overruns the frame")]
    ApiOverrun(u16),
    #[error("api name is not valid UTF-8")]
    InvalidApi,
    #[error("reserved flag bits set: 0x{0:02x}")]
    ReservedFlags(u8),
}

/// Failure reported by a [`Serializer`](crate::protocols::fast::Serializer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializerError {
    #[error("serialize failed: {0}")]
    Serialize(String),
    #[error("deserialize failed: {0}")]
    Deserialize(String),
}

/// Outcome of a remote call that did not produce a result.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("call {id} timed out after {timeout:?}")]
    Timeout { id: u64, timeout: Duration },
    #[error("connection lost")]
    ConnectionLost,
    #[error("remote exception: {0}")]
    Remote(String),
    #[error("call id {0} is already pending")]
    DuplicateId(u64),
    #[error(transparent)]
    Serializer(#[from] SerializerError),
    #[error("send failed: {0}")]
    Transport(#[from] TransportError),
}

/// Failure while dispatching a request to a service action.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("api not found: {0}")]
    ApiNotFound(String),
    #[error("invalid parameters for {api}: {reason}")]
    Parameters { api: String, reason: String },
    #[error(transparent)]
    Serializer(#[from] SerializerError),
    #[error("service {0} is not available from the resolver")]
    ServiceUnavailable(&'static str),
    #[error("{0}")]
    Failed(String),
    #[error("action panicked: {0}")]
    Panicked(String),
    #[error("rejected by filter: {0}")]
    Rejected(String),
}

impl ActionError {
    /// Failure raised by a service method.
    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(message.into())
    }

    /// Rejection raised by a filter's before-hook.
    pub fn rejected(message: impl Into<String>) -> Self {
        ActionError::Rejected(message.into())
    }
}

/// Error returned by a middleware to the runtime. The session is closed.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("frame decode error: {0}")]
    Frame(#[from] FrameError),
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Action registration errors, raised once at startup.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("action {0} is registered more than once")]
    DuplicateAction(String),
}

/// TLS material loading errors.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in '{}'", .0.display())]
    NoCertificates(PathBuf),
    #[error("no private key found in '{}'", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("invalid tls configuration: {0}")]
    Config(#[from] rustls::Error),
}
