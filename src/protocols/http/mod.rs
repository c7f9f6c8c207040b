//! HTTP/1.x on the shared port.
//!
//! Detection looks for a method token followed by a space. Claimed
//! connections have their requests parsed and handed to an [`HttpHandler`];
//! keep-alive is honoured unless the request asks to close.

pub mod handler;
pub mod parser;

pub use handler::{HttpHandler, HttpMiddleware, HttpResponse, NotFoundHandler};
pub use parser::HttpRequest;
