//! Session Feed: resilient realtime message feed for chat sessions.
//!
//! Responsibilities:
//! - seeding a session's message log from stored history
//! - keeping exactly one live subscription open, with capped exponential backoff
//! - probing the open channel and reconnecting when it goes quiet
//! - applying inbound inserts in order, once per id, and notifying observers

pub mod backoff;
pub mod config;
mod controller;
pub mod error;
pub mod feed;
pub mod liveness;
pub mod message;
pub mod observer;
pub mod reducer;
pub mod state;
pub mod store;

pub use backoff::RetrySchedule;
pub use config::FeedConfig;
pub use error::{ConnectionFailure, FeedError, FeedResult, StoreError};
pub use feed::SessionFeed;
pub use message::{InsertEvent, Message, Role, SessionId};
pub use observer::{FeedEvent, ObserverGuard, Observers};
pub use reducer::{ApplyOutcome, LogReader, MessageReducer, RejectReason, SeedOutcome};
pub use state::ConnectionState;
pub use store::{
    ChannelEvent, ChannelSender, ChannelStatus, InMemoryMessageStore, MessageStore, Probe,
    StoreStats, SubscriptionHandle,
};
