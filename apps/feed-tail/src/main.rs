//! Tails a chat session feed against the in-memory store while a simulated
//! backend posts assistant replies and periodically drops the realtime
//! channel. Useful for watching reconnect and dedup behaviour end to end.

mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use session_feed::{
    FeedConfig, FeedEvent, InMemoryMessageStore, MessageStore, Role, SessionFeed, SessionId,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::telemetry::{init_tracing, DEFAULT_FILTER};

#[derive(Parser, Debug)]
#[command(name = "feed-tail", about = "Tail a session feed over a simulated flaky store")]
struct Cli {
    /// Session to open.
    #[arg(long, env = "FEED_TAIL_SESSION", default_value = "demo-session")]
    session: String,
    /// Seconds between simulated assistant replies (0 disables).
    #[arg(long, env = "FEED_TAIL_REPLY_EVERY_SECS", default_value_t = 3)]
    reply_every_secs: u64,
    /// Seconds between simulated channel drops (0 disables).
    #[arg(long, env = "FEED_TAIL_DROP_EVERY_SECS", default_value_t = 10)]
    drop_every_secs: u64,
    /// Subscribe attempts refused after each drop.
    #[arg(long, env = "FEED_TAIL_REFUSED_SUBSCRIBES", default_value_t = 0)]
    refused_subscribes: u32,
    /// Stop after this many seconds (0 runs until ctrl-c).
    #[arg(long, env = "FEED_TAIL_DURATION_SECS", default_value_t = 60)]
    duration_secs: u64,
    /// Message to send as the visitor once the feed is open.
    #[arg(long)]
    greet: Option<String>,
    /// Print events as JSON lines.
    #[arg(long)]
    json: bool,
    #[arg(long, env = "RUST_LOG", default_value = DEFAULT_FILTER)]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    let config = FeedConfig::from_env();
    let session = SessionId::parse(&cli.session).context("invalid --session")?;
    let store = InMemoryMessageStore::new();
    store.insert(&session, Role::User, "Hi, do you ship overseas?");
    store.insert(&session, Role::Assistant, "We do! Where are you located?");

    info!(
        session = %session,
        retry_initial_ms = config.retry_initial.as_millis() as u64,
        retry_max_ms = config.retry_max.as_millis() as u64,
        heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
        reply_every_secs = cli.reply_every_secs,
        drop_every_secs = cli.drop_every_secs,
        "starting feed-tail"
    );

    let dyn_store: Arc<dyn MessageStore> = store.clone();
    let feed = SessionFeed::open(dyn_store, session.as_str(), config)
        .await
        .context("open session feed")?;
    for message in feed.snapshot() {
        print_event(&FeedEvent::MessageApplied(message), cli.json);
    }
    let json = cli.json;
    let _observer = feed.observe(move |event| print_event(event, json));

    if let Some(greeting) = cli.greet.as_deref() {
        feed.send(greeting, Role::User)
            .await
            .context("send greeting")?;
    }

    let simulator = spawn_simulator(store.clone(), session.clone(), &cli);
    if cli.duration_secs == 0 {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    } else {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(cli.duration_secs)) => {}
            res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c")?,
        }
    }

    simulator.abort();
    feed.close().await;
    let stats = store.stats();
    info!(
        messages = feed.snapshot().len(),
        subscribe_calls = stats.subscribe_calls,
        unsubscribe_calls = stats.unsubscribe_calls,
        probes_sent = stats.probes_sent,
        max_concurrent_subscriptions = stats.max_concurrent_subscriptions,
        "feed-tail finished"
    );
    Ok(())
}

fn spawn_simulator(
    store: Arc<InMemoryMessageStore>,
    session: SessionId,
    cli: &Cli,
) -> JoinHandle<()> {
    let reply_every = (cli.reply_every_secs > 0).then(|| Duration::from_secs(cli.reply_every_secs));
    let drop_every = (cli.drop_every_secs > 0).then(|| Duration::from_secs(cli.drop_every_secs));
    let refused = cli.refused_subscribes;

    tokio::spawn(async move {
        let mut replies = reply_every.map(tokio::time::interval);
        let mut drops = drop_every.map(|period| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });
        let mut counter = 0u64;
        loop {
            tokio::select! {
                _ = tick(&mut replies) => {
                    counter += 1;
                    store.insert(&session, Role::Assistant, &format!("simulated reply #{counter}"));
                }
                _ = tick(&mut drops) => {
                    store.fail_next_subscribes(refused);
                    let closed = store.close_channels(&session);
                    info!(closed, refused, "simulated channel drop");
                }
            }
        }
    })
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn print_event(event: &FeedEvent, json: bool) {
    match (event, json) {
        (FeedEvent::MessageApplied(message), true) => {
            println!("{}", serde_json::json!({ "type": "message", "message": message }));
        }
        (FeedEvent::StateChanged(state), true) => {
            println!("{}", serde_json::json!({ "type": "state", "state": state }));
        }
        (FeedEvent::MessageApplied(message), false) => {
            println!(
                "[{}] {:>9}: {}",
                message.created_at.format("%H:%M:%S"),
                message.role,
                message.content
            );
        }
        (FeedEvent::StateChanged(state), false) => println!("-- {state}"),
    }
}
