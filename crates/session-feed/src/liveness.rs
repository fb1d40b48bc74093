use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::ConnectionFailure;
use crate::message::SessionId;
use crate::store::{MessageStore, Probe, SubscriptionHandle};

/// Periodic probe over an open subscription.
///
/// The monitor holds at most one interval timer. [`LivenessMonitor::arm`]
/// replaces any previous timer and [`LivenessMonitor::disarm`] drops it, so
/// the owner arms on entering `Subscribed` and disarms on leaving it.
pub struct LivenessMonitor {
    session_id: SessionId,
    interval: Duration,
    probe_timeout: Duration,
    ticker: Option<Interval>,
    sequence: u64,
}

impl LivenessMonitor {
    pub fn new(session_id: SessionId, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            session_id,
            interval,
            probe_timeout,
            ticker: None,
            sequence: 0,
        }
    }

    pub fn arm(&mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        debug!(
            target = "session.feed.liveness",
            session = %self.session_id,
            interval_ms = self.interval.as_millis() as u64,
            "liveness armed"
        );
    }

    pub fn disarm(&mut self) {
        self.ticker = None;
    }

    pub fn is_armed(&self) -> bool {
        self.ticker.is_some()
    }

    /// Resolves on the next heartbeat. Never resolves while disarmed.
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Builds the next probe send. The returned future owns everything it
    /// needs, so the caller can keep serving channel events while it runs.
    /// A transport error or a send that outlives the probe deadline both
    /// count as a dead channel.
    pub fn probe(
        &mut self,
        store: Arc<dyn MessageStore>,
        handle: Arc<SubscriptionHandle>,
    ) -> BoxFuture<'static, Result<(), ConnectionFailure>> {
        self.sequence += 1;
        let probe = Probe {
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            sent_at: Utc::now(),
        };
        let probe_timeout = self.probe_timeout;
        Box::pin(async move {
            let session = probe.session_id.clone();
            match tokio::time::timeout(probe_timeout, store.send_probe(&handle, &probe)).await {
                Ok(Ok(())) => {
                    debug!(
                        target = "session.feed.liveness",
                        session = %session,
                        sequence = probe.sequence,
                        "probe sent"
                    );
                    Ok(())
                }
                Ok(Err(err)) => {
                    warn!(
                        target = "session.feed.liveness",
                        session = %session,
                        sequence = probe.sequence,
                        error = %err,
                        "probe send failed"
                    );
                    Err(ConnectionFailure::LivenessTimeout(err.to_string()))
                }
                Err(_) => {
                    warn!(
                        target = "session.feed.liveness",
                        session = %session,
                        sequence = probe.sequence,
                        timeout_ms = probe_timeout.as_millis() as u64,
                        "probe deadline expired"
                    );
                    Err(ConnectionFailure::LivenessTimeout(
                        "probe deadline expired".into(),
                    ))
                }
            }
        })
    }
}
