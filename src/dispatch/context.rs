//! Contexts handed to actions and filters.
//!
//! The current connection is always passed explicitly; nothing is looked up
//! from task-local or global state.

use crate::dispatch::action::ServiceAction;
use crate::error::{ActionError, SerializerError};
use crate::protocols::fast::peer::FastPeer;
use crate::protocols::fast::serializer::to_value;
use crate::runtime::session::Session;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// The request being served and the connection it arrived on.
#[derive(Debug, Clone)]
pub struct CallContext {
    peer: Arc<FastPeer>,
    api: Arc<str>,
    id: u64,
}

impl CallContext {
    pub fn new(peer: Arc<FastPeer>, api: &str, id: u64) -> Self {
        Self {
            peer,
            api: Arc::from(api),
            id,
        }
    }

    /// Connection the request arrived on. Use it to call back into the
    /// remote side or to read and write session tags.
    pub fn peer(&self) -> &Arc<FastPeer> {
        &self.peer
    }

    pub fn session(&self) -> &Arc<Session> {
        self.peer.session()
    }

    /// Requested api name as sent on the wire.
    pub fn api(&self) -> &str {
        &self.api
    }

    /// Correlation id of the request.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// State shared by the before and after hooks of one invocation.
#[derive(Debug)]
pub struct ActionContext {
    call: CallContext,
    action: Arc<ServiceAction>,
    body: Bytes,
    result: Option<Value>,
    short_circuited: bool,
}

impl ActionContext {
    pub(crate) fn new(call: CallContext, action: Arc<ServiceAction>, body: Bytes) -> Self {
        Self {
            call,
            action,
            body,
            result: None,
            short_circuited: false,
        }
    }

    pub fn call(&self) -> &CallContext {
        &self.call
    }

    pub fn action(&self) -> &Arc<ServiceAction> {
        &self.action
    }

    /// Raw request body. Parameters are not yet decoded when before-hooks run.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The action's result, once the method ran or a filter supplied one.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn result_mut(&mut self) -> Option<&mut Value> {
        self.result.as_mut()
    }

    /// Supply the result from a before-hook.
    ///
    /// Remaining before-hooks and the method are skipped; after-hooks still run.
    pub fn set_result<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), SerializerError> {
        self.set_result_value(to_value(value)?);
        Ok(())
    }

    pub fn set_result_value(&mut self, value: Value) {
        self.result = Some(value);
        self.short_circuited = true;
    }

    pub fn is_short_circuited(&self) -> bool {
        self.short_circuited
    }

    pub(crate) fn complete(&mut self, result: Option<Value>) {
        self.result = result;
    }

    pub(crate) fn into_result(self) -> Option<Value> {
        self.result
    }
}

/// A dispatch failure passing through the exception hooks.
#[derive(Debug)]
pub struct ExceptionContext {
    call: CallContext,
    action: Option<Arc<ServiceAction>>,
    error: ActionError,
    handled: bool,
}

impl ExceptionContext {
    pub(crate) fn new(
        call: CallContext,
        action: Option<Arc<ServiceAction>>,
        error: ActionError,
    ) -> Self {
        Self {
            call,
            action,
            error,
            handled: false,
        }
    }

    pub fn call(&self) -> &CallContext {
        &self.call
    }

    /// `None` when the api name matched no action.
    pub fn action(&self) -> Option<&Arc<ServiceAction>> {
        self.action.as_ref()
    }

    pub fn error(&self) -> &ActionError {
        &self.error
    }

    /// Mark the failure handled, suppressing local escalation.
    pub fn set_handled(&mut self) {
        self.handled = true;
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub(crate) fn into_error(self) -> ActionError {
        self.error
    }
}
