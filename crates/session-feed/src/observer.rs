use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::message::Message;
use crate::state::ConnectionState;

/// Notification delivered to feed observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    MessageApplied(Message),
    StateChanged(ConnectionState),
}

type Callback = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

#[derive(Default)]
struct ObserverTable {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// Shared registry of feed observers.
#[derive(Clone, Default)]
pub struct Observers {
    table: Arc<Mutex<ObserverTable>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F) -> ObserverGuard
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        let mut table = self.table.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.entries.push((id, Arc::new(callback)));
        ObserverGuard {
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Invokes every observer in registration order. The table lock is not
    /// held while callbacks run, so a callback may register or dispose.
    pub fn notify(&self, event: &FeedEvent) {
        let callbacks: Vec<Callback> = self
            .table
            .lock()
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its observer when disposed or dropped.
#[must_use = "dropping the guard unregisters the observer"]
pub struct ObserverGuard {
    id: u64,
    table: Weak<Mutex<ObserverTable>>,
}

impl ObserverGuard {
    pub fn dispose(self) {}
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}
