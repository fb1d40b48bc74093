//! Ordered, deduplicated message log for one session.
//!
//! The reducer is the only writer of the log. Readers get copies through
//! [`LogReader::snapshot`]; observers get each applied message once.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::message::{InsertEvent, Message, Role, SessionId};
use crate::observer::{FeedEvent, Observers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(Message),
    Duplicate,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    UnknownRole(String),
    ForeignSession(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded { entries: usize },
    AlreadySeeded,
    LiveTrafficStarted,
}

/// Read-only view onto a reducer's log.
#[derive(Clone)]
pub struct LogReader {
    log: Arc<RwLock<Vec<Message>>>,
}

impl LogReader {
    pub fn snapshot(&self) -> Vec<Message> {
        self.log.read().clone()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MessageReducer {
    session_id: SessionId,
    log: Arc<RwLock<Vec<Message>>>,
    ids: HashSet<String>,
    seeded: bool,
    live: bool,
    observers: Observers,
}

impl MessageReducer {
    pub fn new(session_id: SessionId, observers: Observers) -> Self {
        Self {
            session_id,
            log: Arc::new(RwLock::new(Vec::new())),
            ids: HashSet::new(),
            seeded: false,
            live: false,
            observers,
        }
    }

    pub fn reader(&self) -> LogReader {
        LogReader {
            log: Arc::clone(&self.log),
        }
    }

    /// Replaces the log with fetched history. Only the first call before any
    /// live event takes effect.
    pub fn seed(&mut self, history: Vec<Message>) -> SeedOutcome {
        if self.live {
            warn!(
                target = "session.feed",
                session = %self.session_id,
                "ignoring history seed after live traffic started"
            );
            return SeedOutcome::LiveTrafficStarted;
        }
        if self.seeded {
            warn!(target = "session.feed", session = %self.session_id, "history already seeded");
            return SeedOutcome::AlreadySeeded;
        }

        let mut ids = HashSet::new();
        let mut entries = Vec::with_capacity(history.len());
        for message in history {
            if let Some(id) = &message.id {
                if !ids.insert(id.clone()) {
                    debug!(target = "session.feed", message_id = %id, "dropping duplicate history row");
                    continue;
                }
            }
            entries.push(message);
        }

        let count = entries.len();
        *self.log.write() = entries;
        self.ids = ids;
        self.seeded = true;
        SeedOutcome::Seeded { entries: count }
    }

    pub fn apply(&mut self, event: InsertEvent) -> ApplyOutcome {
        let role = match event.role.parse::<Role>() {
            Ok(role) => role,
            Err(err) => {
                warn!(
                    target = "session.feed",
                    session = %self.session_id,
                    message_id = ?event.id,
                    error = %err,
                    "dropping event with invalid role"
                );
                return ApplyOutcome::Rejected(RejectReason::UnknownRole(event.role));
            }
        };
        if event.session_id.trim() != self.session_id.as_str() {
            warn!(
                target = "session.feed",
                session = %self.session_id,
                event_session = %event.session_id,
                "dropping event for another session"
            );
            return ApplyOutcome::Rejected(RejectReason::ForeignSession(event.session_id));
        }
        if let Some(id) = &event.id {
            if self.ids.contains(id) {
                debug!(target = "session.feed", message_id = %id, "duplicate event ignored");
                return ApplyOutcome::Duplicate;
            }
            self.ids.insert(id.clone());
        }

        let message = Message {
            id: event.id,
            session_id: self.session_id.clone(),
            role,
            content: event.content,
            created_at: event.created_at,
        };
        self.live = true;
        self.log.write().push(message.clone());
        self.observers
            .notify(&FeedEvent::MessageApplied(message.clone()));
        ApplyOutcome::Applied(message)
    }
}
