//! Protocol middlewares sharing one listen port.

pub mod fallback;
pub mod fast;
pub mod http;
pub mod policy;

pub use fallback::FallbackMiddleware;
pub use fast::FastMiddleware;
pub use http::HttpMiddleware;
pub use policy::PolicyMiddleware;
