//! Engine configuration.

use std::time::Duration;

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the instance directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Log segment size past which the log recommends a rollover.
    pub max_log_segment_size: u64,

    /// Checkpoint file size past which the compactor starts a new file.
    pub max_checkpoint_file_size: u64,

    /// Number of completed commits between durability barriers (flush + sync).
    pub sync_frequency: usize,

    /// How long a checkpoint waits for in-flight transactions to drain.
    pub quiesce_timeout: Duration,

    /// Pause before retrying an acquire whose blocker had already finished.
    pub retry_interval: Duration,

    /// Longest a blocked acquire sleeps before re-checking its entity.
    pub block_timeout: Duration,

    /// How often the killer thread checks for shutdown while idle.
    pub killer_poll_interval: Duration,

    /// Pause before the compactor retries a fold that hit an I/O error.
    pub compactor_retry_interval: Duration,

    /// Number of recycled transaction buffers kept on the free-list.
    pub transaction_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_log_segment_size: 200_000,
            max_checkpoint_file_size: 200_000,
            sync_frequency: 1,
            quiesce_timeout: Duration::from_millis(50),
            retry_interval: Duration::from_millis(5),
            block_timeout: Duration::from_millis(100),
            killer_poll_interval: Duration::from_secs(1),
            compactor_retry_interval: Duration::from_secs(1),
            transaction_pool_size: 64,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the log rollover threshold.
    #[must_use]
    pub const fn max_log_segment_size(mut self, size: u64) -> Self {
        self.max_log_segment_size = size;
        self
    }

    /// Sets the checkpoint file roll threshold.
    #[must_use]
    pub const fn max_checkpoint_file_size(mut self, size: u64) -> Self {
        self.max_checkpoint_file_size = size;
        self
    }

    /// Sets the durability barrier frequency. Zero is treated as one.
    #[must_use]
    pub const fn sync_frequency(mut self, commits: usize) -> Self {
        self.sync_frequency = if commits == 0 { 1 } else { commits };
        self
    }

    /// Sets the checkpoint drain wait.
    #[must_use]
    pub const fn quiesce_timeout(mut self, timeout: Duration) -> Self {
        self.quiesce_timeout = timeout;
        self
    }

    /// Sets the retry pause used when a blocker had already finished.
    #[must_use]
    pub const fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the bounded wait of a blocked acquire.
    #[must_use]
    pub const fn block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Sets the compactor retry pause.
    #[must_use]
    pub const fn compactor_retry_interval(mut self, interval: Duration) -> Self {
        self.compactor_retry_interval = interval;
        self
    }

    /// Sets the transaction free-list capacity.
    #[must_use]
    pub const fn transaction_pool_size(mut self, size: usize) -> Self {
        self.transaction_pool_size = size;
        self
    }
}
