//! Connection runtime: sessions, their pool, transports, the middleware
//! chain and the listener that drives them.
//!
//! Every accepted connection runs two tasks:
//! - a read loop that appends received bytes to the session buffer
//! - a processing task that runs the middleware chain over that buffer
//!
//! Protocol code never touches the socket directly; it consumes from the
//! session buffer and writes through [`Session::send`].

pub mod listener;
pub mod middleware;
pub mod pool;
pub mod session;
pub mod tags;
pub mod transport;

pub use listener::{Listener, ListenerOptions, RunningListener};
pub use middleware::{Detection, Middleware, MiddlewareChain, Next};
pub use pool::SessionPool;
pub use session::{Protocol, Session};
pub use tags::TagBag;
pub use transport::{load_tls_acceptor, tls_acceptor, Transport, TransportKind};
