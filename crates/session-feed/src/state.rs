use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of the feed's single logical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Subscribed,
    Reconnecting { attempt: u32 },
    /// The controller stopped without being disposed.
    Failed,
}

impl ConnectionState {
    /// Whether `next` is a legal edge from `self`.
    pub fn permits(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Failed) => !matches!(self, Failed),
            // manual reconnect is allowed from anywhere, open only from idle
            (_, Connecting) => true,
            (Connecting, Subscribed) => true,
            (Connecting | Subscribed, Reconnecting { .. }) => true,
            (Connecting | Subscribed | Reconnecting { .. }, Idle) => true,
            _ => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(self, ConnectionState::Subscribed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Subscribed => f.write_str("subscribed"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting({attempt})"),
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}
