//! Action filters and their ordering.
//!
//! Filters are attached explicitly when actions are registered: table-wide
//! (global), per service (class) or per action (method). Each action's
//! filter list is resolved once at registration and never re-sorted per call.

use crate::dispatch::context::{ActionContext, ExceptionContext};
use crate::error::ActionError;
use async_trait::async_trait;
use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::Arc;

/// Tier a filter runs in. Lower tiers always run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterScope {
    Authorization,
    Global,
    Class,
    Method,
}

/// Interceptor around action invocation.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    fn name(&self) -> &'static str {
        type_name::<Self>()
    }

    /// Position within a tier; lower runs first.
    fn order(&self) -> i32 {
        0
    }

    /// Whether instances of this filter type may be stacked across levels.
    ///
    /// When `false`, an instance at a narrower level replaces any instance
    /// of the same type at a broader level.
    fn allow_multiple(&self) -> bool {
        true
    }

    /// Authorization filters run ahead of every other tier wherever they
    /// are attached.
    fn is_authorization(&self) -> bool {
        false
    }

    /// Identity used for the `allow_multiple` check.
    fn filter_type(&self) -> TypeId {
        TypeId::of::<Self>()
    }

    /// Runs before parameters are decoded. Returning an error or setting a
    /// result stops the remaining before-hooks and the method.
    async fn on_executing(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
        Ok(())
    }

    async fn on_executed(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
        Ok(())
    }

    async fn on_exception(&self, _ctx: &mut ExceptionContext) {}
}

/// A filter together with the tier it resolved to.
#[derive(Clone)]
pub struct ScopedFilter {
    pub scope: FilterScope,
    pub filter: Arc<dyn Filter>,
}

impl ScopedFilter {
    fn new(level: FilterScope, filter: &Arc<dyn Filter>) -> Self {
        let scope = if filter.is_authorization() {
            FilterScope::Authorization
        } else {
            level
        };
        Self {
            scope,
            filter: Arc::clone(filter),
        }
    }
}

impl fmt::Debug for ScopedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedFilter")
            .field("scope", &self.scope)
            .field("name", &self.filter.name())
            .field("order", &self.filter.order())
            .finish()
    }
}

/// A non-multiple filter is dropped if any narrower level has the same type.
fn shadowed(filter: &Arc<dyn Filter>, narrower: &[&[Arc<dyn Filter>]]) -> bool {
    !filter.allow_multiple()
        && narrower
            .iter()
            .flat_map(|level| level.iter())
            .any(|other| other.filter_type() == filter.filter_type())
}

/// Resolve the filters that apply to one action, in execution order.
pub fn resolve_filters(
    global: &[Arc<dyn Filter>],
    class: &[Arc<dyn Filter>],
    method: &[Arc<dyn Filter>],
) -> Vec<ScopedFilter> {
    let mut resolved: Vec<ScopedFilter> = Vec::new();
    resolved.extend(
        global
            .iter()
            .filter(|f| !shadowed(f, &[class, method]))
            .map(|f| ScopedFilter::new(FilterScope::Global, f)),
    );
    resolved.extend(
        class
            .iter()
            .filter(|f| !shadowed(f, &[method]))
            .map(|f| ScopedFilter::new(FilterScope::Class, f)),
    );
    resolved.extend(
        method
            .iter()
            .map(|f| ScopedFilter::new(FilterScope::Method, f)),
    );

    // Stable: registration order breaks remaining ties
    resolved.sort_by_key(|f| (f.scope, f.filter.order()));
    resolved
}
