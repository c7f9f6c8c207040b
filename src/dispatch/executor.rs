//! Request dispatch: filter pipeline, invocation and exception escalation.

use crate::dispatch::action::{ActionTable, ServiceAction};
use crate::dispatch::context::{ActionContext, CallContext, ExceptionContext};
use crate::dispatch::filter::ScopedFilter;
use crate::dispatch::params::positional;
use crate::dispatch::resolver::{DefaultResolver, DependencyResolver};
use crate::error::ActionError;
use crate::protocols::fast::packet::Frame;
use crate::protocols::fast::peer::FastPeer;
use crate::protocols::fast::serializer::{to_body, JsonSerializer, Serializer};
use bytes::Bytes;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

const UNHANDLED_CAPACITY: usize = 256;

/// A dispatch failure no exception filter handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhandledException {
    pub session: u64,
    pub api: String,
    pub id: u64,
    pub message: String,
}

/// Serves request frames against an action table.
pub struct Dispatcher {
    actions: ActionTable,
    resolver: Arc<dyn DependencyResolver>,
    serializer: Arc<dyn Serializer>,
    unhandled: broadcast::Sender<UnhandledException>,
}

impl Dispatcher {
    pub fn new(actions: ActionTable, resolver: impl DependencyResolver) -> Self {
        let (unhandled, _) = broadcast::channel(UNHANDLED_CAPACITY);
        Self {
            actions,
            resolver: Arc::new(resolver),
            serializer: Arc::new(JsonSerializer),
            unhandled,
        }
    }

    /// A dispatcher that answers every request with "api not found".
    pub fn empty() -> Self {
        Self::new(ActionTable::empty(), DefaultResolver::new())
    }

    /// Replace the default JSON serializer.
    pub fn with_serializer(mut self, serializer: impl Serializer) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn actions(&self) -> &ActionTable {
        &self.actions
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// Failures that escaped every exception filter.
    pub fn subscribe_unhandled(&self) -> broadcast::Receiver<UnhandledException> {
        self.unhandled.subscribe()
    }

    /// Dispatch a request on the worker pool.
    pub fn spawn(self: &Arc<Self>, peer: Arc<FastPeer>, frame: Frame) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.dispatch(&peer, frame).await })
    }

    /// Serve one request frame to completion.
    pub async fn dispatch(&self, peer: &Arc<FastPeer>, frame: Frame) {
        let call = CallContext::new(Arc::clone(peer), &frame.api, frame.id);
        trace!(session = peer.session().id(), api = %frame.api, id = frame.id, "Dispatching");

        let Some(action) = self.actions.get(&frame.api) else {
            let err = ActionError::ApiNotFound(frame.api.clone());
            self.report(&call, None, self.actions.global_filters(), err)
                .await;
            return;
        };

        let result = match self.execute(&call, &action, frame.body).await {
            Ok(result) => result,
            Err(e) => {
                self.report(&call, Some(&action), action.filters(), e).await;
                return;
            }
        };

        if action.is_void() || !peer.session().is_connected() {
            return;
        }

        let body = match to_body(self.serializer.as_ref(), &result.unwrap_or(Value::Null)) {
            Ok(body) => body,
            Err(e) => {
                self.report(&call, Some(&action), action.filters(), e.into())
                    .await;
                return;
            }
        };
        if let Err(e) = peer.send_frame(&Frame::response(call.id(), body)).await {
            debug!(
                session = peer.session().id(),
                id = call.id(),
                error = %e,
                "Failed to send response"
            );
        }
    }

    /// Run the filter pipeline and the method.
    async fn execute(
        &self,
        call: &CallContext,
        action: &Arc<ServiceAction>,
        body: Bytes,
    ) -> Result<Option<Value>, ActionError> {
        let mut ctx = ActionContext::new(call.clone(), Arc::clone(action), body);

        for scoped in action.filters() {
            scoped.filter.on_executing(&mut ctx).await?;
            if ctx.is_short_circuited() {
                trace!(
                    api = action.name(),
                    filter = scoped.filter.name(),
                    "Result supplied by filter"
                );
                break;
            }
        }

        if !ctx.is_short_circuited() {
            let values = positional(self.serializer.deserialize(ctx.body())?);
            let service = self
                .resolver
                .get_service(action.service_type())
                .ok_or(ActionError::ServiceUnavailable(action.service()))?;

            let invocation = action.invoke(Arc::clone(&service), call.clone(), values);
            let outcome = AssertUnwindSafe(invocation).catch_unwind().await;
            self.resolver.terminate_service(service);

            let result = match outcome {
                Ok(result) => result?,
                Err(panic) => return Err(ActionError::Panicked(panic_message(panic.as_ref()))),
            };
            ctx.complete(result);
        }

        for scoped in action.filters() {
            scoped.filter.on_executed(&mut ctx).await?;
        }

        Ok(ctx.into_result())
    }

    /// Tell the caller, run the exception tier, and escalate if unhandled.
    async fn report(
        &self,
        call: &CallContext,
        action: Option<&Arc<ServiceAction>>,
        filters: &[ScopedFilter],
        err: ActionError,
    ) {
        let message = err.to_string();
        let session = call.session().id();

        if call.session().is_connected() {
            if let Err(e) = call
                .peer()
                .send_frame(&Frame::exception(call.id(), &message))
                .await
            {
                debug!(session, id = call.id(), error = %e, "Failed to send exception");
            }
        }

        let mut ctx = ExceptionContext::new(call.clone(), action.cloned(), err);
        for scoped in filters {
            scoped.filter.on_exception(&mut ctx).await;
        }

        if ctx.is_handled() {
            debug!(
                session,
                api = call.api(),
                id = call.id(),
                error = %message,
                "Exception handled by filter"
            );
            return;
        }

        let err = ctx.into_error();
        error!(
            session,
            api = call.api(),
            id = call.id(),
            error = %err,
            "Unhandled dispatch exception"
        );
        let _ = self.unhandled.send(UnhandledException {
            session,
            api: call.api().to_string(),
            id: call.id(),
            message,
        });
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("actions", &self.actions)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
