use std::time::Duration;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const CONSTRAINED_DEBOUNCE: Duration = Duration::from_millis(1_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_INITIAL_RETRY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_RETRY: Duration = Duration::from_secs(30);
pub const DEFAULT_LATENCY_WARN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Batches whose oldest commit is further behind than this log a warning.
    pub latency_warn_threshold: Duration,
    /// Release the push channel while hidden and reopen it on resume.
    pub release_channel_when_hidden: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            initial_retry_delay: DEFAULT_INITIAL_RETRY,
            max_retry_delay: DEFAULT_MAX_RETRY,
            latency_warn_threshold: DEFAULT_LATENCY_WARN,
            release_channel_when_hidden: false,
        }
    }
}

impl SyncConfig {
    /// Defaults tuned for constrained clients: a longer debounce window.
    pub fn constrained() -> Self {
        Self {
            debounce: CONSTRAINED_DEBOUNCE,
            ..Self::default()
        }
    }

    /// Defaults overridden by `SHIPWATCH_DEBOUNCE_MS`,
    /// `SHIPWATCH_POLL_INTERVAL_MS`, `SHIPWATCH_INITIAL_RETRY_MS`,
    /// `SHIPWATCH_MAX_RETRY_MS` and `SHIPWATCH_RELEASE_WHEN_HIDDEN`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            debounce: env_millis("SHIPWATCH_DEBOUNCE_MS").unwrap_or(defaults.debounce),
            poll_interval: env_millis("SHIPWATCH_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            initial_retry_delay: env_millis("SHIPWATCH_INITIAL_RETRY_MS")
                .unwrap_or(defaults.initial_retry_delay),
            max_retry_delay: env_millis("SHIPWATCH_MAX_RETRY_MS")
                .unwrap_or(defaults.max_retry_delay),
            latency_warn_threshold: defaults.latency_warn_threshold,
            release_channel_when_hidden: std::env::var("SHIPWATCH_RELEASE_WHEN_HIDDEN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
                .unwrap_or(defaults.release_channel_when_hidden),
        }
    }

    /// Replaces zero durations with defaults and keeps the retry cap at or
    /// above the initial delay.
    pub fn normalized(mut self) -> Self {
        if self.debounce.is_zero() {
            self.debounce = DEFAULT_DEBOUNCE;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.initial_retry_delay.is_zero() {
            self.initial_retry_delay = DEFAULT_INITIAL_RETRY;
        }
        if self.max_retry_delay < self.initial_retry_delay {
            self.max_retry_delay = self.initial_retry_delay;
        }
        self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}
