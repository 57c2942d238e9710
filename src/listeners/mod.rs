use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::registry::ConnectionId;
use crate::wire::message::CommandResult;

/// Observer of results that were written back to their connection.
pub trait ResponseListener: Send + Sync {
    fn on_response(&self, connection_id: ConnectionId, result: &CommandResult);
}

impl<F> ResponseListener for F
where
    F: Fn(ConnectionId, &CommandResult) + Send + Sync,
{
    fn on_response(&self, connection_id: ConnectionId, result: &CommandResult) {
        self(connection_id, result)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Vec<(ListenerId, Arc<dyn ResponseListener>)>;

/// Copy-on-write listener list. Iteration works on a snapshot, so adds and
/// removes never wait for a running notification and vice versa.
#[derive(Default)]
pub struct ResponseListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Arc<ListenerList>>,
}

impl ResponseListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ResponseListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut guard = self.listeners.write();
        let mut next = guard.as_ref().clone();
        next.push((id, listener));
        *guard = Arc::new(next);
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: ListenerList = guard
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Arc<ListenerList> {
        Arc::clone(&self.listeners.read())
    }

    /// Calls every listener of the current snapshot. A panicking listener is
    /// skipped; returns how many listeners completed.
    pub fn notify(&self, connection_id: ConnectionId, result: &CommandResult) -> usize {
        self.snapshot()
            .iter()
            .filter(|(_, listener)| {
                panic::catch_unwind(AssertUnwindSafe(|| {
                    listener.on_response(connection_id, result)
                }))
                .is_ok()
            })
            .count()
    }
}
