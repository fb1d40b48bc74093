use thiserror::Error;

use crate::message::Role;

/// Errors returned by a [`crate::store::MessageStore`] implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
}

/// Errors surfaced to feed consumers.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("session id must not be empty")]
    InvalidSession,
    #[error("failed to load session history: {0}")]
    HistoryUnavailable(#[source] StoreError),
    #[error("failed to append message: {0}")]
    AppendFailed(#[source] StoreError),
    #[error("role {0} cannot be sent from this feed")]
    UnsupportedRole(Role),
    #[error("message content is empty")]
    EmptyMessage,
    #[error("feed is closed")]
    Closed,
}

/// Transport-level failures. These drive the controller into reconnection
/// and are only ever logged, never returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionFailure {
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("channel errored: {0}")]
    ChannelErrored(String),
    #[error("liveness probe failed: {0}")]
    LivenessTimeout(String),
}

pub type FeedResult<T> = Result<T, FeedError>;
