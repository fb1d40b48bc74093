use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Directives match on module path, so library logs live under `session_feed`.
pub const DEFAULT_FILTER: &str = "info,session_feed=debug";

/// Logs go to stderr so stdout carries only feed output.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    Registry::default().with(env_filter).with(fmt_layer).init();
}
