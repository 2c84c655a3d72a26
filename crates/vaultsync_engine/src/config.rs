//! Session and retry settings.

use rand::Rng;
use std::time::Duration;
use vaultsync_protocol::OwnerId;

/// Channel sessions join when no other name is configured.
pub const DEFAULT_BROADCAST_CHANNEL: &str = "vaultsync-changes";

const DEFAULT_BATCH: u32 = 100;
const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a [`SyncSession`](crate::SyncSession) needs to know about
/// the owner it serves and the server it talks to.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Whose changes flow through the session.
    pub owner_id: OwnerId,
    /// Identifies this execution context; broadcasts carrying it are ignored
    /// by the sender.
    pub device_id: String,
    /// Remote change log endpoint.
    pub server_url: String,
    /// Records sent per append call.
    pub upload_batch_size: u32,
    /// Page size requested from list-since.
    pub download_batch_size: u32,
    /// How failed cycles are retried.
    pub retry: RetryConfig,
    /// Period between scheduled cycles. `None` means only explicit triggers.
    pub sync_interval: Option<Duration>,
    /// A scheduled cycle running longer than this is cancelled.
    pub timeout: Duration,
    /// Broadcast channel shared with sibling contexts.
    pub broadcast_channel: String,
}

impl SyncConfig {
    /// Settings for `owner_id` on `device_id` with default batching,
    /// retries and timeout.
    pub fn new(
        owner_id: impl Into<OwnerId>,
        device_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            device_id: device_id.into(),
            server_url: server_url.into(),
            upload_batch_size: DEFAULT_BATCH,
            download_batch_size: DEFAULT_BATCH,
            retry: RetryConfig::default(),
            sync_interval: None,
            timeout: DEFAULT_CYCLE_TIMEOUT,
            broadcast_channel: String::from(DEFAULT_BROADCAST_CHANNEL),
        }
    }

    /// Zero is raised to one.
    pub fn with_upload_batch_size(mut self, size: u32) -> Self {
        self.upload_batch_size = size.max(1);
        self
    }

    /// Zero is raised to one.
    pub fn with_download_batch_size(mut self, size: u32) -> Self {
        self.download_batch_size = size.max(1);
        self
    }

    /// Replaces the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Lets the scheduler start a cycle every `interval` on its own.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Bounds one scheduled cycle.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Joins a differently named broadcast channel, isolating this session
    /// from contexts on the default one.
    pub fn with_broadcast_channel(mut self, name: impl Into<String>) -> Self {
        self.broadcast_channel = name.into();
        self
    }
}

/// Exponential backoff between attempts of a failed cycle.
///
/// Attempt `n` (for `n >= 1`) waits `base * factor^(n-1)`, clamped to
/// `cap`, plus up to a quarter more when jitter is on. Attempt 0 never
/// waits.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub base: Duration,
    /// Longest wait, before jitter.
    pub cap: Duration,
    /// Growth per attempt.
    pub factor: f64,
    /// Randomize waits upward.
    pub jitter: bool,
}

impl RetryConfig {
    /// `max_attempts` tries, starting at 100ms and doubling up to 30s.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base: Duration::ZERO,
            cap: Duration::ZERO,
            factor: 1.0,
            jitter: false,
        }
    }

    /// Wait before the first retry.
    pub fn with_initial_delay(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Longest wait, before jitter.
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Growth per attempt.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Turns jitter on or off.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before retry number `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(steps) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let secs = self.unjittered_secs(steps);
        let extra = if self.jitter {
            secs * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            0.0
        };
        Duration::from_secs_f64(secs + extra)
    }

    fn unjittered_secs(&self, steps: u32) -> f64 {
        let growth = self.factor.powi(i32::try_from(steps).unwrap_or(i32::MAX));
        (self.base.as_secs_f64() * growth).min(self.cap.as_secs_f64())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
