use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StoreError;
use crate::message::{InsertEvent, Message, Role, SessionId};

/// Connection status reported by the transport for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Closed,
    Errored(String),
}

/// Push notification delivered for an open subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Insert(InsertEvent),
    Status(ChannelStatus),
}

pub type ChannelSender = mpsc::UnboundedSender<ChannelEvent>;

/// One open logical subscription. Deliberately not `Clone`: exactly one
/// owner holds it until it is handed back through [`MessageStore::unsubscribe`].
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    session_id: SessionId,
}

impl SubscriptionHandle {
    pub fn new(id: u64, session_id: SessionId) -> Self {
        Self { id, session_id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

/// Liveness probe broadcast over an open channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub session_id: SessionId,
    pub sequence: u64,
    pub sent_at: DateTime<Utc>,
}

/// Backing store for session messages. Implementations own persistence and
/// the realtime transport; the feed only relies on these primitives.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn fetch_history(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError>;

    async fn append(
        &self,
        session_id: &SessionId,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Registers a subscription for inserts scoped to `session_id` and returns
    /// its handle without waiting on the transport. Joining happens in the
    /// background and its outcome arrives on `events` as a status: `Connected`
    /// once live, `Closed` or `Errored` otherwise. Inserts and status changes
    /// are pushed into `events` until the handle is released or the transport
    /// drops the sender.
    fn subscribe(
        &self,
        session_id: &SessionId,
        events: ChannelSender,
    ) -> Result<SubscriptionHandle, StoreError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle);

    async fn send_probe(&self, handle: &SubscriptionHandle, probe: &Probe)
        -> Result<(), StoreError>;
}

/// Counters exposed by [`InMemoryMessageStore`] for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub subscribe_calls: u64,
    pub unsubscribe_calls: u64,
    pub probes_sent: u64,
    pub max_concurrent_subscriptions: usize,
}

#[derive(Default)]
struct Faults {
    failing_subscribes: u32,
    fail_probes: bool,
    hang_probes: bool,
    fail_appends: bool,
    fail_history: bool,
    withhold_connected: bool,
    mute_append_echo: bool,
}

struct Subscriber {
    session_id: SessionId,
    events: ChannelSender,
}

#[derive(Default)]
struct StoreInner {
    rows: HashMap<SessionId, Vec<Message>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscription: u64,
    faults: Faults,
    stats: StoreStats,
}

impl StoreInner {
    fn broadcast(&self, session_id: &SessionId, event: &ChannelEvent) -> usize {
        let mut delivered = 0;
        for subscriber in self.subscribers.values() {
            if &subscriber.session_id == session_id && subscriber.events.send(event.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn session_subscriptions(&self, session_id: &SessionId) -> usize {
        self.subscribers
            .values()
            .filter(|s| &s.session_id == session_id)
            .count()
    }
}

/// In-memory store with fault injection, for tests and local tooling.
#[derive(Default)]
pub struct InMemoryMessageStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryMessageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Persists a row and pushes it to every live subscriber of the session,
    /// the way a backend insert would.
    pub fn insert(&self, session_id: &SessionId, role: Role, content: &str) -> Message {
        self.persist(session_id, role, content, true)
    }

    fn persist(
        &self,
        session_id: &SessionId,
        role: Role,
        content: &str,
        broadcast: bool,
    ) -> Message {
        let message = Message {
            id: Some(uuid::Uuid::new_v4().to_string()),
            session_id: session_id.clone(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let mut inner = self.inner.lock();
        inner
            .rows
            .entry(session_id.clone())
            .or_default()
            .push(message.clone());
        if broadcast {
            inner.broadcast(session_id, &ChannelEvent::Insert(InsertEvent::from(&message)));
        }
        message
    }

    /// Pushes an arbitrary event to subscribers without persisting it.
    pub fn push_event(&self, session_id: &SessionId, event: InsertEvent) -> usize {
        self.inner
            .lock()
            .broadcast(session_id, &ChannelEvent::Insert(event))
    }

    pub fn emit_connected(&self, session_id: &SessionId) -> usize {
        self.inner
            .lock()
            .broadcast(session_id, &ChannelEvent::Status(ChannelStatus::Connected))
    }

    pub fn close_channels(&self, session_id: &SessionId) -> usize {
        self.inner
            .lock()
            .broadcast(session_id, &ChannelEvent::Status(ChannelStatus::Closed))
    }

    pub fn error_channels(&self, session_id: &SessionId, reason: &str) -> usize {
        self.inner.lock().broadcast(
            session_id,
            &ChannelEvent::Status(ChannelStatus::Errored(reason.to_string())),
        )
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.inner.lock().faults.failing_subscribes = count;
    }

    pub fn set_fail_probes(&self, fail: bool) {
        self.inner.lock().faults.fail_probes = fail;
    }

    /// Probe sends never complete while set.
    pub fn set_hang_probes(&self, hang: bool) {
        self.inner.lock().faults.hang_probes = hang;
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.inner.lock().faults.fail_appends = fail;
    }

    pub fn set_fail_history(&self, fail: bool) {
        self.inner.lock().faults.fail_history = fail;
    }

    /// Rows written through [`MessageStore::append`] are persisted but not
    /// pushed to subscribers while set, like a transport that skips the
    /// writer's own inserts.
    pub fn set_mute_append_echo(&self, mute: bool) {
        self.inner.lock().faults.mute_append_echo = mute;
    }

    /// New subscriptions stay unacknowledged until [`Self::emit_connected`].
    pub fn set_withhold_connected(&self, withhold: bool) {
        self.inner.lock().faults.withhold_connected = withhold;
    }

    pub fn active_subscriptions(&self, session_id: &SessionId) -> usize {
        self.inner.lock().session_subscriptions(session_id)
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.lock().stats.clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn fetch_history(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock();
        if inner.faults.fail_history {
            return Err(StoreError::Request("history unavailable".into()));
        }
        Ok(inner.rows.get(session_id).cloned().unwrap_or_default())
    }

    async fn append(
        &self,
        session_id: &SessionId,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError> {
        let echo = {
            let inner = self.inner.lock();
            if inner.faults.fail_appends {
                return Err(StoreError::Request("insert rejected".into()));
            }
            !inner.faults.mute_append_echo
        };
        Ok(self.persist(session_id, role, content, echo))
    }

    fn subscribe(
        &self,
        session_id: &SessionId,
        events: ChannelSender,
    ) -> Result<SubscriptionHandle, StoreError> {
        let mut inner = self.inner.lock();
        inner.stats.subscribe_calls += 1;
        if inner.faults.failing_subscribes > 0 {
            inner.faults.failing_subscribes -= 1;
            return Err(StoreError::Request("subscribe refused".into()));
        }

        let id = inner.next_subscription;
        inner.next_subscription += 1;
        if !inner.faults.withhold_connected {
            let _ = events.send(ChannelEvent::Status(ChannelStatus::Connected));
        }
        inner.subscribers.insert(
            id,
            Subscriber {
                session_id: session_id.clone(),
                events,
            },
        );
        let live = inner.session_subscriptions(session_id);
        inner.stats.max_concurrent_subscriptions = inner.stats.max_concurrent_subscriptions.max(live);
        debug!(target = "session.feed.store", subscription = id, session = %session_id, "subscription opened");
        Ok(SubscriptionHandle::new(id, session_id.clone()))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut inner = self.inner.lock();
        inner.stats.unsubscribe_calls += 1;
        inner.subscribers.remove(&handle.id());
        debug!(target = "session.feed.store", subscription = handle.id(), "subscription released");
    }

    async fn send_probe(
        &self,
        handle: &SubscriptionHandle,
        probe: &Probe,
    ) -> Result<(), StoreError> {
        let hang = {
            let mut inner = self.inner.lock();
            if !inner.subscribers.contains_key(&handle.id()) {
                return Err(StoreError::UnknownSubscription(handle.id()));
            }
            if inner.faults.fail_probes {
                return Err(StoreError::ChannelClosed);
            }
            serde_json::to_vec(probe).map_err(|err| StoreError::Request(err.to_string()))?;
            inner.stats.probes_sent += 1;
            inner.faults.hang_probes
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
