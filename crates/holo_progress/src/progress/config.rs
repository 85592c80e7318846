//! Progress log tuning.

use std::time::Duration;

/// Default period between audits of every tracked transaction.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);
/// Default bound on any single remote remediation.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default number of concurrent durability announcements per transaction.
pub const DEFAULT_FANOUT_CONCURRENCY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressConfig {
    /// How often the registry audits every shard. A transaction needs two
    /// quiet intervals before anything is done about it.
    pub tick_interval: Duration,
    /// Upper bound for one remote operation (recover, fetch, invalidate,
    /// inform). Expiry counts as a remote failure and is retried later.
    pub remote_timeout: Duration,
    pub fanout_concurrency: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            fanout_concurrency: DEFAULT_FANOUT_CONCURRENCY,
        }
    }
}

impl ProgressConfig {
    /// Defaults overridden by `HOLO_PROGRESS_TICK_MS`,
    /// `HOLO_PROGRESS_REMOTE_TIMEOUT_MS` and `HOLO_PROGRESS_FANOUT_CONCURRENCY`.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ms) = parse_positive(&lookup, "HOLO_PROGRESS_TICK_MS") {
            self.tick_interval = Duration::from_millis(ms as u64);
        }
        if let Some(ms) = parse_positive(&lookup, "HOLO_PROGRESS_REMOTE_TIMEOUT_MS") {
            self.remote_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(n) = parse_positive(&lookup, "HOLO_PROGRESS_FANOUT_CONCURRENCY") {
            self.fanout_concurrency = n;
        }
        self
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, var_name: &str) -> Option<usize> {
    let raw = lookup(var_name)?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(env = var_name, value = %raw, "ignoring invalid progress log setting");
            None
        }
    }
}
