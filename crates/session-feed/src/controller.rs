//! Reconnection controller.
//!
//! One actor task per feed owns the subscription handle, the reducer, the
//! retry timer and the liveness monitor. Everything that can change feed
//! state (facade commands, channel events, probe completion, timers) is
//! funnelled through the single `select!` in [`ReconnectController::run`],
//! so at most one transition is ever in flight. Nothing in the loop awaits
//! the transport except releasing a handle.

use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use crate::backoff::RetrySchedule;
use crate::config::FeedConfig;
use crate::error::ConnectionFailure;
use crate::liveness::LivenessMonitor;
use crate::message::{InsertEvent, SessionId};
use crate::observer::{FeedEvent, Observers};
use crate::reducer::MessageReducer;
use crate::state::ConnectionState;
use crate::store::{ChannelEvent, ChannelStatus, MessageStore, SubscriptionHandle};

/// Requests from the facade to the controller task.
#[derive(Debug)]
pub(crate) enum Command {
    ManualReconnect,
    /// A locally appended row, used only while no attempt is open.
    Deliver(InsertEvent),
    Dispose,
}

/// Weak sender into the current attempt's event queue. `Some` exactly while
/// an attempt is open; the facade pushes locally appended rows through it so
/// they queue behind whatever the transport already delivered. Weak, so the
/// transport dropping its sender still closes the queue.
pub(crate) type LiveQueue = Arc<Mutex<Option<mpsc::WeakUnboundedSender<ChannelEvent>>>>;

type PendingProbe = BoxFuture<'static, Result<(), ConnectionFailure>>;

enum Step {
    Command(Option<Command>),
    Channel(Option<ChannelEvent>),
    Probe(Result<(), ConnectionFailure>),
    ConnectDeadline,
    RetryTimer,
    Heartbeat,
}

pub(crate) struct ReconnectController {
    session_id: SessionId,
    store: Arc<dyn MessageStore>,
    config: FeedConfig,
    schedule: RetrySchedule,
    reducer: MessageReducer,
    observers: Observers,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    live: LiveQueue,
    attempt: u32,
    epoch: u64,
    handle: Option<Arc<SubscriptionHandle>>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    probe: Option<PendingProbe>,
    connect_deadline: Option<Pin<Box<Sleep>>>,
    retry: Option<Pin<Box<Sleep>>>,
    liveness: LivenessMonitor,
    disposed: bool,
}

impl ReconnectController {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: SessionId,
        store: Arc<dyn MessageStore>,
        config: FeedConfig,
        reducer: MessageReducer,
        observers: Observers,
        state_tx: watch::Sender<ConnectionState>,
        commands: mpsc::UnboundedReceiver<Command>,
        live: LiveQueue,
    ) -> Self {
        let liveness = LivenessMonitor::new(
            session_id.clone(),
            config.heartbeat_interval,
            config.probe_timeout,
        );
        let state = *state_tx.borrow();
        Self {
            schedule: RetrySchedule::from_config(&config),
            state,
            session_id,
            store,
            config,
            reducer,
            observers,
            state_tx,
            commands,
            live,
            attempt: 0,
            epoch: 0,
            handle: None,
            events: None,
            probe: None,
            connect_deadline: None,
            retry: None,
            liveness,
            disposed: false,
        }
    }

    /// `Idle -> Connecting` and the first subscribe request. Connection
    /// progress is driven by [`Self::run`].
    pub(crate) async fn open(&mut self) {
        self.transition(ConnectionState::Connecting);
        self.begin_attempt().await;
    }

    pub(crate) async fn run(mut self) {
        loop {
            let step = tokio::select! {
                biased;
                cmd = self.commands.recv() => Step::Command(cmd),
                event = next_event(&mut self.events) => Step::Channel(event),
                result = resolve(&mut self.probe) => Step::Probe(result),
                _ = fire(&mut self.connect_deadline) => Step::ConnectDeadline,
                _ = fire(&mut self.retry) => Step::RetryTimer,
                _ = self.liveness.tick() => Step::Heartbeat,
            };

            match step {
                Step::Command(None) | Step::Command(Some(Command::Dispose)) => {
                    self.dispose().await;
                    break;
                }
                Step::Command(Some(Command::ManualReconnect)) => self.manual_reconnect().await,
                Step::Command(Some(Command::Deliver(event))) => {
                    self.flush_events().await;
                    self.reducer.apply(event);
                }
                Step::Channel(event) => self.on_channel_event(event).await,
                Step::Probe(result) => {
                    self.probe = None;
                    if let Err(failure) = result {
                        self.fail(failure).await;
                    }
                }
                Step::ConnectDeadline => {
                    self.connect_deadline = None;
                    self.fail(ConnectionFailure::SubscribeFailed(
                        "timed out waiting for connected status".into(),
                    ))
                    .await;
                }
                Step::RetryTimer => {
                    self.retry = None;
                    self.attempt = self.attempt.saturating_add(1);
                    self.transition(ConnectionState::Connecting);
                    self.begin_attempt().await;
                }
                Step::Heartbeat => self.on_heartbeat(),
            }
        }
    }

    async fn begin_attempt(&mut self) {
        self.epoch += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        // Published before subscribing so a local append can never be routed
        // around rows the new subscription is already queueing.
        *self.live.lock() = Some(tx.downgrade());
        self.events = Some(rx);
        debug!(
            target = "session.feed",
            session = %self.session_id,
            epoch = self.epoch,
            attempt = self.attempt,
            "requesting subscription"
        );
        match self.store.subscribe(&self.session_id, tx) {
            Ok(handle) => {
                debug!(
                    target = "session.feed",
                    session = %self.session_id,
                    epoch = self.epoch,
                    subscription = handle.id(),
                    "subscription handle acquired"
                );
                self.handle = Some(Arc::new(handle));
                self.connect_deadline =
                    Some(Box::pin(tokio::time::sleep(self.config.connect_timeout)));
            }
            Err(err) => {
                self.fail(ConnectionFailure::SubscribeFailed(err.to_string()))
                    .await
            }
        }
    }

    async fn on_channel_event(&mut self, event: Option<ChannelEvent>) {
        match event {
            Some(ChannelEvent::Insert(insert)) => {
                self.reducer.apply(insert);
            }
            Some(ChannelEvent::Status(ChannelStatus::Connected)) => self.on_connected(),
            Some(ChannelEvent::Status(ChannelStatus::Closed)) | None => {
                self.fail(ConnectionFailure::ChannelClosed).await
            }
            Some(ChannelEvent::Status(ChannelStatus::Errored(reason))) => {
                self.fail(ConnectionFailure::ChannelErrored(reason)).await
            }
        }
    }

    /// Handles everything already queued on the current attempt.
    async fn flush_events(&mut self) {
        loop {
            let Some(events) = self.events.as_mut() else {
                return;
            };
            match events.try_recv() {
                Ok(event) => self.on_channel_event(Some(event)).await,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.on_channel_event(None).await;
                    return;
                }
            }
        }
    }

    fn on_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.connect_deadline = None;
        self.attempt = 0;
        self.transition(ConnectionState::Subscribed);
        self.liveness.arm();
        info!(
            target = "session.feed",
            session = %self.session_id,
            epoch = self.epoch,
            "subscribed"
        );
    }

    fn on_heartbeat(&mut self) {
        if self.probe.is_some() {
            debug!(
                target = "session.feed.liveness",
                session = %self.session_id,
                "previous probe still in flight"
            );
            return;
        }
        let Some(handle) = self.handle.as_ref() else {
            self.liveness.disarm();
            return;
        };
        self.probe = Some(
            self.liveness
                .probe(Arc::clone(&self.store), Arc::clone(handle)),
        );
    }

    async fn fail(&mut self, failure: ConnectionFailure) {
        if matches!(
            self.state,
            ConnectionState::Reconnecting { .. } | ConnectionState::Idle
        ) {
            return;
        }
        self.release().await;
        let delay = self.schedule.delay(self.attempt);
        warn!(
            target = "session.feed",
            session = %self.session_id,
            epoch = self.epoch,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "subscription lost; scheduling reconnect"
        );
        self.transition(ConnectionState::Reconnecting {
            attempt: self.attempt,
        });
        self.retry = Some(Box::pin(tokio::time::sleep(delay)));
    }

    async fn manual_reconnect(&mut self) {
        info!(
            target = "session.feed",
            session = %self.session_id,
            from = %self.state,
            "manual reconnect requested"
        );
        self.retry = None;
        self.attempt = 0;
        self.release().await;
        self.transition(ConnectionState::Connecting);
        self.begin_attempt().await;
    }

    async fn dispose(&mut self) {
        self.retry = None;
        self.release().await;
        self.transition(ConnectionState::Idle);
        self.disposed = true;
        debug!(target = "session.feed", session = %self.session_id, "feed disposed");
    }

    /// Drops every resource tied to the current attempt. Inserts already
    /// queued on the attempt are applied first; the handle goes back to the
    /// store before anything new can be requested.
    async fn release(&mut self) {
        self.liveness.disarm();
        self.connect_deadline = None;
        self.probe = None;
        self.live.lock().take();
        if let Some(mut events) = self.events.take() {
            events.close();
            let mut drained = 0usize;
            while let Ok(event) = events.try_recv() {
                if let ChannelEvent::Insert(insert) = event {
                    self.reducer.apply(insert);
                    drained += 1;
                }
            }
            if drained > 0 {
                debug!(
                    target = "session.feed",
                    session = %self.session_id,
                    epoch = self.epoch,
                    drained,
                    "applied inserts queued on released subscription"
                );
            }
        }
        if let Some(handle) = self.handle.take() {
            // The pending probe held the only other reference and is gone.
            match Arc::try_unwrap(handle) {
                Ok(handle) => {
                    debug!(
                        target = "session.feed",
                        session = %self.session_id,
                        subscription = handle.id(),
                        "releasing subscription"
                    );
                    self.store.unsubscribe(handle).await;
                }
                Err(shared) => warn!(
                    target = "session.feed",
                    session = %self.session_id,
                    subscription = shared.id(),
                    "subscription handle still shared; not released"
                ),
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.permits(&next) {
            warn!(
                target = "session.feed",
                session = %self.session_id,
                from = %self.state,
                to = %next,
                "refusing illegal state transition"
            );
            return;
        }
        self.state = next;
        self.state_tx.send_replace(next);
        self.observers.notify(&FeedEvent::StateChanged(next));
    }
}

impl Drop for ReconnectController {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        // The task ended without a dispose: it panicked or its runtime went away.
        self.live.lock().take();
        if let Some(handle) = self.handle.as_ref() {
            warn!(
                target = "session.feed",
                session = %self.session_id,
                subscription = handle.id(),
                "controller stopped while holding a subscription"
            );
        }
        self.transition(ConnectionState::Failed);
    }
}

async fn resolve(probe: &mut Option<PendingProbe>) -> Result<(), ConnectionFailure> {
    match probe.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    match events.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
