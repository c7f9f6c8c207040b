//! Fast: a bidirectional binary RPC protocol.
//!
//! Either side may send request frames naming an api; responses correlate
//! purely by id. See [`packet`] for the wire layout.

pub mod calls;
pub mod client;
pub mod handler;
pub mod packet;
pub mod peer;
pub mod serializer;

pub use calls::{CallHandle, CallTable, DEFAULT_CALL_TIMEOUT};
pub use client::FastClient;
pub use handler::{notify_all, FastMiddleware};
pub use packet::{Frame, FRAME_MAGIC};
pub use peer::{FastPeer, RemoteException};
pub use serializer::{JsonSerializer, Serializer};
