//! Registry of live sessions with recycling of disconnected ones.
//!
//! Live sessions sit in a sharded concurrent map so unrelated connections
//! never contend on one lock. Enumeration returns a point-in-time snapshot.

use crate::runtime::session::{Protocol, Session};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Pool of live and recyclable sessions.
pub struct SessionPool {
    live: DashMap<u64, Arc<Session>>,
    /// Reset sessions ready for reuse (LIFO).
    free: Mutex<Vec<Arc<Session>>>,
    next_id: AtomicU64,
    max_free: usize,
}

impl SessionPool {
    /// Create a pool keeping at most `max_free` recycled sessions.
    pub fn new(max_free: usize) -> Arc<Self> {
        Arc::new(Self {
            live: DashMap::new(),
            free: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            max_free,
        })
    }

    /// Take a recycled session or create a new one, and register it as live.
    pub(crate) fn acquire(self: &Arc<Self>) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = match self.free.lock().pop() {
            Some(session) => {
                session.reset(id);
                session
            }
            None => Arc::new(Session::new(id, Arc::downgrade(self))),
        };
        self.live.insert(id, Arc::clone(&session));
        session
    }

    /// Remove a session from the live set and recycle it if nothing else holds it.
    ///
    /// Must only be called after the session's disconnect hook has run.
    pub(crate) fn release(&self, session: Arc<Session>) {
        let id = session.id();
        self.live.remove(&id);

        // A strong count of one means no in-flight task can observe the reset
        if Arc::strong_count(&session) == 1 {
            let mut free = self.free.lock();
            if free.len() < self.max_free {
                session.reset(0);
                free.push(session);
                trace!(session = id, "Session recycled");
            }
        }
    }

    /// Look up a live session by id.
    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.live.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of all live sessions.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.live
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of live sessions that negotiated `protocol`.
    pub fn sessions_with(&self, protocol: Protocol) -> Vec<Arc<Session>> {
        self.live
            .iter()
            .filter(|entry| entry.value().protocol() == protocol)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Close every live session.
    pub fn close_all(&self) {
        for session in self.snapshot() {
            session.close();
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of sessions waiting for reuse.
    pub fn recycled(&self) -> usize {
        self.free.lock().len()
    }
}
