//! Action dispatch for Fast requests.
//!
//! Services are registered once into an [`ActionTable`]; the [`Dispatcher`]
//! looks requests up by api name and runs them through their resolved
//! filter pipeline.

pub mod action;
pub mod context;
pub mod executor;
pub mod filter;
pub mod params;
pub mod resolver;

pub use action::{ActionTable, ActionTableBuilder, ServiceAction, ServiceBuilder};
pub use context::{ActionContext, CallContext, ExceptionContext};
pub use executor::{Dispatcher, UnhandledException};
pub use filter::{Filter, FilterScope, ScopedFilter};
pub use params::{IntoParams, Params};
pub use resolver::{DefaultResolver, DependencyResolver, ServiceInstance};
