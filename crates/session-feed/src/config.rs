use std::time::Duration;

/// Tuning for one feed. Each feed gets its own copy so independent feeds
/// never share retry or heartbeat settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    /// Delay before the first reconnect attempt.
    pub retry_initial: Duration,
    /// Upper bound for the reconnect delay. Caps the delay, not the attempt count.
    pub retry_max: Duration,
    /// Interval between liveness probes while subscribed.
    pub heartbeat_interval: Duration,
    /// How long a single probe send may take before the channel is considered dead.
    pub probe_timeout: Duration,
    /// How long to wait for the `connected` status after requesting a subscription.
    pub connect_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            retry_initial: Duration::from_millis(1_000),
            retry_max: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_millis(30_000),
            probe_timeout: Duration::from_millis(10_000),
            connect_timeout: Duration::from_millis(10_000),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `SESSION_FEED_*_MS` values resolved through
    /// `lookup`. Missing or unparsable values keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let defaults = Self::default();
        Self {
            retry_initial: millis("SESSION_FEED_RETRY_INITIAL_MS")
                .unwrap_or(defaults.retry_initial),
            retry_max: millis("SESSION_FEED_RETRY_MAX_MS").unwrap_or(defaults.retry_max),
            heartbeat_interval: millis("SESSION_FEED_HEARTBEAT_MS")
                .unwrap_or(defaults.heartbeat_interval),
            probe_timeout: millis("SESSION_FEED_PROBE_TIMEOUT_MS")
                .unwrap_or(defaults.probe_timeout),
            connect_timeout: millis("SESSION_FEED_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
        }
        .normalized()
    }

    pub fn with_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max;
        self.normalized()
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.normalized()
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self.normalized()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.normalized()
    }

    // Zero intervals would spin the actor loop; a cap below the seed would
    // make the schedule shrink.
    fn normalized(mut self) -> Self {
        let floor = Duration::from_millis(1);
        self.retry_initial = self.retry_initial.max(floor);
        self.retry_max = self.retry_max.max(self.retry_initial);
        self.heartbeat_interval = self.heartbeat_interval.max(floor);
        self.probe_timeout = self.probe_timeout.max(floor);
        self.connect_timeout = self.connect_timeout.max(floor);
        self
    }
}
