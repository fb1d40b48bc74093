use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::controller::{Command, LiveQueue, ReconnectController};
use crate::error::{FeedError, FeedResult};
use crate::message::{InsertEvent, Message, Role, SessionId};
use crate::observer::{FeedEvent, ObserverGuard, Observers};
use crate::reducer::{LogReader, MessageReducer, SeedOutcome};
use crate::state::ConnectionState;
use crate::store::{ChannelEvent, MessageStore};

/// Live view of one chat session.
///
/// Dropping the feed disposes it in the background; call [`SessionFeed::close`]
/// to wait until the subscription has been released.
pub struct SessionFeed {
    session_id: SessionId,
    store: Arc<dyn MessageStore>,
    commands: mpsc::UnboundedSender<Command>,
    live: LiveQueue,
    log: LogReader,
    state: watch::Receiver<ConnectionState>,
    observers: Observers,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionFeed {
    /// Loads history, seeds the log and starts the subscription. Returns as
    /// soon as the subscription has been requested.
    pub async fn open(
        store: Arc<dyn MessageStore>,
        session_id: &str,
        config: FeedConfig,
    ) -> FeedResult<Self> {
        let session_id = SessionId::parse(session_id)?;
        let history = store
            .fetch_history(&session_id)
            .await
            .map_err(FeedError::HistoryUnavailable)?;

        let observers = Observers::new();
        let mut reducer = MessageReducer::new(session_id.clone(), observers.clone());
        if let SeedOutcome::Seeded { entries } = reducer.seed(history) {
            debug!(target = "session.feed", session = %session_id, entries, "history loaded");
        }
        let log = reducer.reader();

        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let (commands, rx) = mpsc::unbounded_channel();
        let live = LiveQueue::default();
        let mut controller = ReconnectController::new(
            session_id.clone(),
            Arc::clone(&store),
            config,
            reducer,
            observers.clone(),
            state_tx,
            rx,
            Arc::clone(&live),
        );
        controller.open().await;
        let task = tokio::spawn(controller.run());
        info!(target = "session.feed", session = %session_id, "feed opened");

        Ok(Self {
            session_id,
            store,
            commands,
            live,
            log,
            state,
            observers,
            task: Mutex::new(Some(task)),
        })
    }

    /// Appends a visitor or owner message. The stored row is queued on the
    /// open subscription behind anything the transport already delivered, so
    /// it keeps causal order and shows up exactly once even when the
    /// transport echoes it as well.
    pub async fn send(&self, content: &str, role: Role) -> FeedResult<Message> {
        if role == Role::Assistant {
            return Err(FeedError::UnsupportedRole(role));
        }
        if content.trim().is_empty() {
            return Err(FeedError::EmptyMessage);
        }
        if self.commands.is_closed() {
            return Err(FeedError::Closed);
        }

        let message = self
            .store
            .append(&self.session_id, role, content)
            .await
            .map_err(|err| {
                warn!(
                    target = "session.feed",
                    session = %self.session_id,
                    error = %err,
                    "append failed"
                );
                FeedError::AppendFailed(err)
            })?;

        let event = InsertEvent::from(&message);
        let queued = match self.live.lock().as_ref().and_then(|tx| tx.upgrade()) {
            Some(tx) => tx.send(ChannelEvent::Insert(event.clone())).is_ok(),
            None => false,
        };
        if !queued && self.commands.send(Command::Deliver(event)).is_err() {
            debug!(
                target = "session.feed",
                session = %self.session_id,
                "feed closed before appended message was applied"
            );
        }
        Ok(message)
    }

    pub fn observe<F>(&self, callback: F) -> ObserverGuard
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.observers.register(callback)
    }

    /// Requests a fresh connection now, skipping any pending backoff.
    pub fn manual_reconnect(&self) -> FeedResult<()> {
        self.commands
            .send(Command::ManualReconnect)
            .map_err(|_| FeedError::Closed)
    }

    /// Disposes the feed and waits for the subscription to be released.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };
        let _ = self.commands.send(Command::Dispose);
        if let Err(err) = task.await {
            warn!(
                target = "session.feed",
                session = %self.session_id,
                error = %err,
                "feed controller ended abnormally"
            );
        }
        info!(target = "session.feed", session = %self.session_id, "feed closed");
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.log.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for SessionFeed {
    fn drop(&mut self) {
        if self.task.get_mut().is_some() {
            let _ = self.commands.send(Command::Dispose);
        }
    }
}
