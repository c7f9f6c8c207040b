//! Service actions and the registration table.
//!
//! Actions are registered once at startup as typed closures. Lookup by api
//! name is case-insensitive; invocation goes straight through the stored
//! closure with no per-call type inspection.

use crate::dispatch::context::CallContext;
use crate::dispatch::filter::{resolve_filters, Filter, ScopedFilter};
use crate::dispatch::params::Params;
use crate::dispatch::resolver::ServiceInstance;
use crate::error::{ActionError, RegistrationError};
use crate::protocols::fast::serializer::to_value;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Decodes parameters and runs the method. `Ok(None)` for void actions.
pub(crate) type Invoker = Arc<
    dyn Fn(ServiceInstance, CallContext, Vec<Value>) -> BoxFuture<'static, ActionResult>
        + Send
        + Sync,
>;

pub(crate) type ActionResult = Result<Option<Value>, ActionError>;

/// One invocable operation.
pub struct ServiceAction {
    name: String,
    service: &'static str,
    service_type: TypeId,
    params: Vec<&'static str>,
    returns: Option<&'static str>,
    filters: Vec<ScopedFilter>,
    invoker: Invoker,
}

impl ServiceAction {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type name of the declaring service.
    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn service_type(&self) -> TypeId {
        self.service_type
    }

    pub fn param_types(&self) -> &[&'static str] {
        &self.params
    }

    /// Return type name, `None` for void actions.
    pub fn return_type(&self) -> Option<&'static str> {
        self.returns
    }

    pub fn is_void(&self) -> bool {
        self.returns.is_none()
    }

    /// Resolved filters in execution order.
    pub fn filters(&self) -> &[ScopedFilter] {
        &self.filters
    }

    pub(crate) fn invoke(
        &self,
        service: ServiceInstance,
        call: CallContext,
        values: Vec<Value>,
    ) -> BoxFuture<'static, Result<Option<Value>, ActionError>> {
        (self.invoker)(service, call, values)
    }
}

impl fmt::Debug for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAction")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("filters", &self.filters)
            .finish()
    }
}

/// An action awaiting filter resolution.
struct PendingAction {
    name: String,
    service: &'static str,
    service_type: TypeId,
    params: Vec<&'static str>,
    returns: Option<&'static str>,
    class_filters: Vec<Arc<dyn Filter>>,
    method_filters: Vec<Arc<dyn Filter>>,
    invoker: Invoker,
}

/// Actions of one service type.
pub struct ServiceBuilder<S> {
    filters: Vec<Arc<dyn Filter>>,
    actions: Vec<PendingAction>,
    _service: PhantomData<fn() -> S>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    fn new() -> Self {
        Self {
            filters: Vec::new(),
            actions: Vec::new(),
            _service: PhantomData,
        }
    }

    /// Attach a filter to every action of this service.
    pub fn filter(mut self, filter: impl Filter) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Register `handler` under `name`.
    ///
    /// Actions returning `()` are void: no response is sent.
    pub fn action<P, R, F, Fut>(self, name: &str, handler: F) -> Self
    where
        P: Params,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActionError>> + Send + 'static,
    {
        self.action_with(name, Vec::new(), handler)
    }

    /// Register `handler` with method-level filters.
    pub fn action_with<P, R, F, Fut>(
        mut self,
        name: &str,
        filters: Vec<Arc<dyn Filter>>,
        handler: F,
    ) -> Self
    where
        P: Params,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActionError>> + Send + 'static,
    {
        let is_void = TypeId::of::<R>() == TypeId::of::<()>();
        let handler = Arc::new(handler);

        let invoker: Invoker = Arc::new(
            move |service: ServiceInstance,
                  call: CallContext,
                  values: Vec<Value>|
                  -> BoxFuture<'static, Result<Option<Value>, ActionError>> {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let service = service
                        .downcast::<S>()
                        .map_err(|_| ActionError::ServiceUnavailable(type_name::<S>()))?;
                    let params = P::from_values(values).map_err(|reason| {
                        ActionError::Parameters {
                            api: call.api().to_string(),
                            reason,
                        }
                    })?;
                    let result = handler(service, call, params).await?;
                    let value = if is_void {
                        None
                    } else {
                        Some(to_value(&result)?)
                    };
                    Ok::<_, ActionError>(value)
                })
            },
        );

        self.actions.push(PendingAction {
            name: name.to_string(),
            service: type_name::<S>(),
            service_type: TypeId::of::<S>(),
            params: P::type_names(),
            returns: (!is_void).then(type_name::<R>),
            class_filters: Vec::new(),
            method_filters: filters,
            invoker,
        });
        self
    }
}

/// Collects services and filters, then freezes them into an [`ActionTable`].
#[derive(Default)]
pub struct ActionTableBuilder {
    global: Vec<Arc<dyn Filter>>,
    actions: Vec<PendingAction>,
}

impl ActionTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a filter to every action in the table.
    pub fn global_filter(mut self, filter: impl Filter) -> Self {
        self.global.push(Arc::new(filter));
        self
    }

    /// Register the actions of service type `S`.
    pub fn service<S, F>(mut self, register: F) -> Self
    where
        S: Send + Sync + 'static,
        F: FnOnce(ServiceBuilder<S>) -> ServiceBuilder<S>,
    {
        let builder = register(ServiceBuilder::new());
        for mut action in builder.actions {
            action.class_filters = builder.filters.clone();
            self.actions.push(action);
        }
        self
    }

    /// Resolve filters and build the lookup table.
    pub fn build(self) -> Result<ActionTable, RegistrationError> {
        let mut actions = HashMap::with_capacity(self.actions.len());
        for pending in self.actions {
            let key = pending.name.to_lowercase();
            if actions.contains_key(&key) {
                return Err(RegistrationError::DuplicateAction(pending.name));
            }
            let filters = resolve_filters(
                &self.global,
                &pending.class_filters,
                &pending.method_filters,
            );
            let action = ServiceAction {
                name: pending.name,
                service: pending.service,
                service_type: pending.service_type,
                params: pending.params,
                returns: pending.returns,
                filters,
                invoker: pending.invoker,
            };
            actions.insert(key, Arc::new(action));
        }

        let global = resolve_filters(&self.global, &[], &[]);
        Ok(ActionTable { actions, global })
    }
}

/// Case-insensitive api name to action lookup.
pub struct ActionTable {
    actions: HashMap<String, Arc<ServiceAction>>,
    global: Vec<ScopedFilter>,
}

impl ActionTable {
    pub fn builder() -> ActionTableBuilder {
        ActionTableBuilder::new()
    }

    /// A table with no actions, for peers that only make calls.
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
            global: Vec::new(),
        }
    }

    pub fn get(&self, api: &str) -> Option<Arc<ServiceAction>> {
        self.actions.get(&api.to_lowercase()).cloned()
    }

    /// Table-wide filters, consulted when no action matches.
    pub fn global_filters(&self) -> &[ScopedFilter] {
        &self.global
    }

    /// Registered action names.
    pub fn names(&self) -> Vec<&str> {
        self.actions.values().map(|a| a.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTable")
            .field("actions", &self.names())
            .field("global", &self.global)
            .finish()
    }
}
