//! Configuration for the sync engine.

use std::time::Duration;
use treesync_sync_protocol::PROTOCOL_VERSION;

/// Settings of one [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Application id sent in `Hello`.
    pub app_id: String,
    /// Protocol version sent in `Hello`.
    pub protocol_version: u16,
    /// Changes asked for per `Pull`.
    pub pull_batch_size: u32,
    /// Pending entries read per `Push`.
    pub push_batch_size: u32,
    /// Reconnect policy.
    pub retry: RetryConfig,
    /// Interval between cycles when nothing wakes the engine.
    pub poll_interval: Duration,
    /// How long `close` may spend flushing pending changes.
    pub shutdown_grace: Duration,
    /// Request timeout.
    pub timeout: Duration,
    /// Capacity of the error broadcast channel.
    pub error_capacity: usize,
}

impl SyncConfig {
    /// Creates a configuration for `app_id`.
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            protocol_version: PROTOCOL_VERSION,
            pull_batch_size: 100,
            push_batch_size: 100,
            retry: RetryConfig::default(),
            poll_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
            error_capacity: 64,
        }
    }

    /// Sets the pull batch size.
    #[must_use]
    pub fn with_pull_batch_size(mut self, size: u32) -> Self {
        self.pull_batch_size = size;
        self
    }

    /// Sets the push batch size.
    #[must_use]
    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the idle poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how many unread failures the error channel keeps.
    #[must_use]
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("treesync")
    }
}

/// Reconnect policy.
///
/// The n-th consecutive failure waits `initial_delay * multiplier^(n-1)`,
/// capped at `max_delay`, before the next attempt. `max_attempts` bounds
/// the attempts [`Connection::open`](crate::Connection::open) makes and is
/// the failure count at which a running connection reports the outage.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempt budget.
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Upper bound of any wait, before jitter.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub backoff_multiplier: f64,
    /// Adds up to a quarter of the wait at random.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// A policy with `max_attempts` attempts and default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the first wait.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Caps every wait.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Turns jitter on or off.
    #[must_use]
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Whether `failures` consecutive failures use up the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts.max(1)
    }

    /// Wait before retrying after `failures` consecutive failures. Zero
    /// failures means no wait.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let Some(steps) = failures.checked_sub(1) else {
            return Duration::ZERO;
        };
        let steps = i32::try_from(steps).unwrap_or(i32::MAX);
        let capped = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(steps))
            .min(self.max_delay.as_secs_f64());
        let spread = if self.add_jitter {
            capped * 0.25 * rand::random::<f64>()
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + spread)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}
