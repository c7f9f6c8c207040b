//! Call correlation: matches response frames to outstanding calls by id.
//!
//! Every pending call owns an independent timer task. Completion, failure
//! and timeout all race on a single `DashMap::remove`, so exactly one of them
//! settles a given call and the others become no-ops.

use crate::error::CallError;
use crate::protocols::fast::serializer::{from_body, Serializer};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Settles a pending call, deserializing the raw result to the caller's type.
type Completer = Box<dyn FnOnce(Result<Bytes, CallError>) + Send + Sync>;

struct PendingCall {
    completer: Completer,
    /// Set right after registration; `None` only while the timer is being spawned.
    timer: Option<AbortHandle>,
    created: Instant,
}

impl PendingCall {
    fn settle(self, outcome: Result<Bytes, CallError>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        (self.completer)(outcome);
    }
}

/// Outstanding calls of one connection.
pub struct CallTable {
    pending: DashMap<u64, PendingCall>,
    serializer: Arc<dyn Serializer>,
    timeout: Duration,
}

impl CallTable {
    pub fn new(serializer: Arc<dyn Serializer>) -> Arc<Self> {
        Self::with_timeout(serializer, DEFAULT_CALL_TIMEOUT)
    }

    /// Create a table whose calls default to `timeout`.
    pub fn with_timeout(serializer: Arc<dyn Serializer>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            serializer,
            timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a pending call and start its timer.
    ///
    /// `timeout` overrides the table default for this call only. Must be
    /// called from within a tokio runtime.
    pub fn create<T>(
        self: &Arc<Self>,
        id: u64,
        timeout: Option<Duration>,
    ) -> Result<CallHandle<T>, CallError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let timeout = timeout.unwrap_or(self.timeout);
        let (tx, rx) = oneshot::channel();

        let serializer = Arc::clone(&self.serializer);
        let completer: Completer = Box::new(move |outcome: Result<Bytes, CallError>| {
            let result = outcome.and_then(|body| {
                from_body::<T>(serializer.as_ref(), &body).map_err(CallError::from)
            });
            // The caller may have stopped waiting
            let _ = tx.send(result);
        });

        match self.pending.entry(id) {
            Entry::Occupied(_) => return Err(CallError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    completer,
                    timer: None,
                    created: Instant::now(),
                });
            }
        }

        // The entry exists before the timer can fire, so expiry always finds it
        let table: Weak<CallTable> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(id, timeout);
            }
        })
        .abort_handle();

        match self.pending.get_mut(&id) {
            Some(mut call) => call.timer = Some(timer),
            // Already settled or expired
            None => timer.abort(),
        }
        trace!(id, ?timeout, "Pending call registered");
        Ok(CallHandle { id, rx })
    }

    /// Fulfill call `id` with a raw result body.
    ///
    /// Returns `false` if no such call is pending (orphan response).
    pub fn complete(&self, id: u64, body: Bytes) -> bool {
        match self.pending.remove(&id) {
            Some((_, call)) => {
                trace!(id, elapsed = ?call.created.elapsed(), "Call completed");
                call.settle(Ok(body));
                true
            }
            None => false,
        }
    }

    /// Fail call `id`. Returns `false` if no such call is pending.
    pub fn fail(&self, id: u64, error: CallError) -> bool {
        match self.pending.remove(&id) {
            Some((_, call)) => {
                trace!(id, error = %error, "Call failed");
                call.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending call, returning how many were drained.
    pub fn fail_all(&self, make_error: impl Fn() -> CallError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut drained = 0;
        for id in ids {
            if self.fail(id, make_error()) {
                drained += 1;
            }
        }
        if drained > 0 {
            debug!(drained, "Pending calls drained");
        }
        drained
    }

    fn expire(&self, id: u64, timeout: Duration) {
        // Completion may have won the race
        if let Some((_, call)) = self.pending.remove(&id) {
            debug!(id, ?timeout, "Call timed out");
            (call.completer)(Err(CallError::Timeout { id, timeout }));
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for CallTable {
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            if let Some(timer) = &entry.value().timer {
                timer.abort();
            }
        }
    }
}

/// Awaitable result of a pending call.
///
/// Resolves with [`CallError::ConnectionLost`] if the table is dropped
/// before the call is settled.
#[derive(Debug)]
pub struct CallHandle<T> {
    id: u64,
    rx: oneshot::Receiver<Result<T, CallError>>,
}

impl<T> CallHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Future for CallHandle<T> {
    type Output = Result<T, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::ConnectionLost)),
            Poll::Pending => Poll::Pending,
        }
    }
}
