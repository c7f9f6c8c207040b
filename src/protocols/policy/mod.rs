//! Flash socket policy-file responder.
//!
//! Legacy browser plugins open a socket and send a fixed request before they
//! allow any other traffic:
//!
//! ```text
//! Request:  <policy-file-request/>\0          (23 bytes)
//! Response: <cross-domain-policy>...</cross-domain-policy>\0
//! ```
//!
//! The connection is closed right after the response.

pub mod handler;

pub use handler::PolicyMiddleware;

/// Exact policy request sent by Flash clients, including the trailing NUL.
pub const FLASH_POLICY_REQUEST: &[u8] = b"<policy-file-request/>\0";

/// Permissive policy document used when none is configured.
pub const DEFAULT_POLICY: &str = "<?xml version=\"1.0\"?>\
<cross-domain-policy><allow-access-from domain=\"*\" to-ports=\"*\"/></cross-domain-policy>\0";
