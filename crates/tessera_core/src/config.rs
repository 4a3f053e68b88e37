//! Database configuration.

use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to sync the WAL on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Degree of parallelism used when mapping documents into indexes.
    pub max_parallel_index_tasks: usize,

    /// Upper bound of documents read per indexing pass.
    pub max_items_to_index_in_single_batch: usize,

    /// Upper bound of reduce keys processed per reducing pass.
    pub max_items_to_reduce_in_single_batch: usize,

    /// How long an idle worker waits for a work signal before polling.
    pub worker_poll_interval: Duration,

    /// Storage is considered idle after this long without use.
    pub idle_timeout: Duration,

    /// How often idle housekeeping runs.
    pub idle_check_interval: Duration,

    /// Lifetime of promoted transactions, and of staged operations whose
    /// caller gave no timeout.
    pub transaction_timeout: Duration,

    /// How often expired transactions are reaped.
    pub transaction_reap_interval: Duration,

    /// Failure rate above which an index is disabled.
    pub index_failure_threshold: f64,

    /// Attempts required before the failure rate is judged.
    pub index_failure_min_attempts: u64,

    /// Retries of a patch that hits a concurrency conflict.
    pub max_patch_retries: usize,

    /// Retries of an all-patch batch that hits a concurrency conflict.
    pub max_batch_retries: usize,

    /// Attempts to remove index metadata from storage.
    pub delete_index_retries: usize,

    /// Pause between `delete_index_retries` attempts.
    pub delete_index_retry_delay: Duration,

    /// Size of the recorded indexing error log.
    pub max_recorded_errors: usize,

    /// Whether the indexing and reducing workers start on open.
    pub background_workers: bool,
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            max_parallel_index_tasks: parallelism.max(1),
            max_items_to_index_in_single_batch: 512,
            max_items_to_reduce_in_single_batch: 256,
            worker_poll_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            idle_check_interval: Duration::from_secs(30),
            transaction_timeout: Duration::from_secs(60),
            transaction_reap_interval: Duration::from_secs(60),
            index_failure_threshold: 0.15,
            index_failure_min_attempts: 100,
            max_patch_retries: 128,
            max_batch_retries: 128,
            delete_index_retries: 10,
            delete_index_retry_delay: Duration::from_millis(100),
            max_recorded_errors: 50,
            background_workers: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the WAL on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the indexing parallelism. Zero is treated as one.
    #[must_use]
    pub fn max_parallel_index_tasks(mut self, degree: usize) -> Self {
        self.max_parallel_index_tasks = degree.max(1);
        self
    }

    /// Sets the indexing batch size.
    #[must_use]
    pub fn max_items_to_index_in_single_batch(mut self, count: usize) -> Self {
        self.max_items_to_index_in_single_batch = count.max(1);
        self
    }

    /// Sets the reducing batch size.
    #[must_use]
    pub fn max_items_to_reduce_in_single_batch(mut self, count: usize) -> Self {
        self.max_items_to_reduce_in_single_batch = count.max(1);
        self
    }

    /// Sets the idle wait of the background workers.
    #[must_use]
    pub const fn worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    /// Sets the idle timeout and check interval.
    #[must_use]
    pub const fn idle(mut self, timeout: Duration, check_interval: Duration) -> Self {
        self.idle_timeout = timeout;
        self.idle_check_interval = check_interval;
        self
    }

    /// Sets the default transaction timeout.
    #[must_use]
    pub const fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Sets how often expired transactions are reaped.
    #[must_use]
    pub const fn transaction_reap_interval(mut self, interval: Duration) -> Self {
        self.transaction_reap_interval = interval;
        self
    }

    /// Sets the index failure threshold and the attempts needed to apply it.
    #[must_use]
    pub fn index_failure(mut self, threshold: f64, min_attempts: u64) -> Self {
        self.index_failure_threshold = threshold;
        self.index_failure_min_attempts = min_attempts;
        self
    }

    /// Sets the patch and batch retry bounds.
    #[must_use]
    pub const fn retries(mut self, patch: usize, batch: usize) -> Self {
        self.max_patch_retries = patch;
        self.max_batch_retries = batch;
        self
    }

    /// Sets how many indexing errors are remembered.
    #[must_use]
    pub const fn max_recorded_errors(mut self, count: usize) -> Self {
        self.max_recorded_errors = count;
        self
    }

    /// Sets whether background workers start on open.
    #[must_use]
    pub const fn background_workers(mut self, value: bool) -> Self {
        self.background_workers = value;
        self
    }
}
