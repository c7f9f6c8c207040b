//! fastsocket: a multi-protocol socket server
//!
//! One listening port serves several protocols, told apart by their first
//! bytes:
//! - Fast, a framed binary protocol for bidirectional calls
//! - HTTP/1.x, handed to an application handler
//! - Flash policy-file requests
//!
//! Fast requests are dispatched to registered service actions through a
//! tiered filter pipeline. Either side of a Fast connection may call the
//! other; responses are correlated to pending calls by id.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use dispatch::{ActionTable, CallContext, DefaultResolver, Dispatcher, Filter};
pub use error::{ActionError, CallError, SessionError, TransportError};
pub use protocols::fast::{FastClient, FastPeer};
pub use runtime::{Listener, ListenerOptions, RunningListener, Session, SessionPool};
