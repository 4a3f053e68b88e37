//! State shared by the background workers and the foreground.

use crate::config::Config;
use crate::types::now_ms;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// An indexing or reducing failure kept for statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Index that failed.
    pub index: String,
    /// Document being processed, if any.
    pub document: Option<String>,
    /// Error message.
    pub error: String,
    /// When it happened (ms).
    pub timestamp_ms: u64,
}

/// The two long-running workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    /// Maps documents and removes deleted ones.
    Indexing,
    /// Re-reduces map/reduce keys.
    Reducing,
}

/// A coalescing wake-up signal: any number of notifications between two
/// waits count once.
#[derive(Debug)]
struct Signal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Signal {
    fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    fn notify(&self) {
        let _ = self.tx.try_send(());
    }

    fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Cancellation, wake-ups, index progress and error bookkeeping.
pub struct WorkContext {
    cancelled: AtomicBool,
    indexing: Signal,
    reducing: Signal,
    progress: Mutex<u64>,
    progress_changed: Condvar,
    errors: Mutex<VecDeque<ServerError>>,
    max_errors: usize,
    index_batch_size: AtomicUsize,
    reduce_batch_size: AtomicUsize,
    max_index_batch_size: usize,
    max_reduce_batch_size: usize,
}

impl fmt::Debug for WorkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkContext")
            .field("cancelled", &self.is_cancelled())
            .field("progress", &*self.progress.lock())
            .field("errors", &self.errors.lock().len())
            .finish_non_exhaustive()
    }
}

impl WorkContext {
    /// Creates a context sized from the configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            indexing: Signal::new(),
            reducing: Signal::new(),
            progress: Mutex::new(0),
            progress_changed: Condvar::new(),
            errors: Mutex::new(VecDeque::new()),
            max_errors: config.max_recorded_errors,
            index_batch_size: AtomicUsize::new(config.max_items_to_index_in_single_batch),
            reduce_batch_size: AtomicUsize::new(config.max_items_to_reduce_in_single_batch),
            max_index_batch_size: config.max_items_to_index_in_single_batch,
            max_reduce_batch_size: config.max_items_to_reduce_in_single_batch,
        }
    }

    /// Whether the workers were asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Asks the workers to stop and wakes them.
    pub fn cancel(&self) {
        {
            let _progress = self.progress.lock();
            self.cancelled.store(true, Ordering::Release);
            self.progress_changed.notify_all();
        }
        self.notify_about_work();
    }

    /// Clears a previous cancellation so workers can be started again.
    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// Wakes both workers.
    pub fn notify_about_work(&self) {
        self.indexing.notify();
        self.reducing.notify();
    }

    /// Blocks a worker until it is notified or `timeout` elapses. Returns
    /// whether it was notified.
    pub fn wait_for_work(&self, worker: Worker, timeout: Duration) -> bool {
        match worker {
            Worker::Indexing => self.indexing.wait(timeout),
            Worker::Reducing => self.reducing.wait(timeout),
        }
    }

    /// Current progress generation.
    #[must_use]
    pub fn progress_generation(&self) -> u64 {
        *self.progress.lock()
    }

    /// Records that an index moved forward and wakes waiting queries.
    pub fn notify_index_progress(&self) {
        *self.progress.lock() += 1;
        self.progress_changed.notify_all();
    }

    /// Waits until the progress generation differs from `seen`, the
    /// context is cancelled, or `timeout` elapses.
    pub fn wait_for_index_progress(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut progress = self.progress.lock();
        while *progress == seen && !self.is_cancelled() {
            if self
                .progress_changed
                .wait_until(&mut progress, deadline)
                .timed_out()
            {
                return *progress != seen;
            }
        }
        *progress != seen
    }

    /// Remembers a failure, dropping the oldest beyond the limit.
    pub fn add_error(&self, index: &str, document: Option<&str>, error: impl fmt::Display) {
        let error = ServerError {
            index: index.to_string(),
            document: document.map(str::to_string),
            error: error.to_string(),
            timestamp_ms: now_ms(),
        };
        tracing::warn!(index = %error.index, document = ?error.document, error = %error.error, "indexing error");
        let mut errors = self.errors.lock();
        errors.push_back(error);
        while errors.len() > self.max_errors {
            errors.pop_front();
        }
    }

    /// Remembered failures, oldest first.
    #[must_use]
    pub fn errors(&self) -> Vec<ServerError> {
        self.errors.lock().iter().cloned().collect()
    }

    /// Forgets the failures of one index.
    pub fn clear_errors_for(&self, index: &str) {
        self.errors.lock().retain(|e| e.index != index);
    }

    /// Current indexing batch size.
    #[must_use]
    pub fn current_index_batch_size(&self) -> usize {
        self.index_batch_size.load(Ordering::Relaxed)
    }

    /// Current reducing batch size.
    #[must_use]
    pub fn current_reduce_batch_size(&self) -> usize {
        self.reduce_batch_size.load(Ordering::Relaxed)
    }

    /// Adjusts the indexing batch size after a batch of `size` took `used`
    /// documents.
    pub fn record_index_batch(&self, size: usize, used: usize) {
        let next = next_batch_size(size, used, self.max_index_batch_size);
        self.index_batch_size.store(next, Ordering::Relaxed);
    }

    /// Adjusts the reducing batch size after a batch of `size` took `used`
    /// keys.
    pub fn record_reduce_batch(&self, size: usize, used: usize) {
        let next = next_batch_size(size, used, self.max_reduce_batch_size);
        self.reduce_batch_size.store(next, Ordering::Relaxed);
    }
}

/// A full batch doubles the size up to `max`. A batch under a quarter full
/// halves it, down to an eighth of `max`.
fn next_batch_size(size: usize, used: usize, max: usize) -> usize {
    let min = (max / 8).max(1);
    let next = if used >= size {
        size.saturating_mul(2)
    } else if used < size / 4 {
        size / 2
    } else {
        size
    };
    next.clamp(min, max.max(min))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn context() -> WorkContext {
        WorkContext::new(&Config::default().max_recorded_errors(2))
    }

    #[test]
    fn notifications_coalesce() {
        let ctx = context();
        ctx.notify_about_work();
        ctx.notify_about_work();
        assert!(ctx.wait_for_work(Worker::Indexing, Duration::from_millis(10)));
        assert!(!ctx.wait_for_work(Worker::Indexing, Duration::from_millis(10)));
        assert!(ctx.wait_for_work(Worker::Reducing, Duration::from_millis(10)));
    }

    #[test]
    fn cancel_wakes_waiters() {
        let ctx = Arc::new(context());
        let waiter = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || ctx.wait_for_work(Worker::Indexing, Duration::from_secs(10)))
        };
        ctx.cancel();
        assert!(waiter.join().unwrap());
        assert!(ctx.is_cancelled());
        ctx.resume();
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn progress_wait() {
        let ctx = Arc::new(context());
        let seen = ctx.progress_generation();
        assert!(!ctx.wait_for_index_progress(seen, Duration::from_millis(10)));

        let notifier = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ctx.notify_index_progress();
            })
        };
        assert!(ctx.wait_for_index_progress(seen, Duration::from_secs(10)));
        notifier.join().unwrap();
        assert!(ctx.wait_for_index_progress(seen, Duration::from_millis(1)));
    }

    #[test]
    fn cancel_wakes_progress_waiters_every_time() {
        let ctx = Arc::new(context());
        for _ in 0..50 {
            let seen = ctx.progress_generation();
            let waiter = {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || {
                    let started = Instant::now();
                    ctx.wait_for_index_progress(seen, Duration::from_secs(30));
                    started.elapsed()
                })
            };
            ctx.cancel();
            assert!(waiter.join().unwrap() < Duration::from_secs(5));
            ctx.resume();
        }
    }

    #[test]
    fn batch_size_follows_load() {
        assert_eq!(next_batch_size(512, 512, 512), 512);
        assert_eq!(next_batch_size(512, 10, 512), 256);
        assert_eq!(next_batch_size(512, 200, 512), 512);
        assert_eq!(next_batch_size(64, 0, 512), 64);
        assert_eq!(next_batch_size(128, 128, 512), 256);
        assert_eq!(next_batch_size(1, 0, 1), 1);

        let ctx = WorkContext::new(&Config::default().max_items_to_index_in_single_batch(64));
        ctx.record_index_batch(64, 1);
        assert_eq!(ctx.current_index_batch_size(), 32);
        ctx.record_index_batch(32, 1);
        ctx.record_index_batch(16, 1);
        assert_eq!(ctx.current_index_batch_size(), 8);
        ctx.record_index_batch(8, 8);
        assert_eq!(ctx.current_index_batch_size(), 16);

        let reduce = ctx.current_reduce_batch_size();
        ctx.record_reduce_batch(reduce, 0);
        assert_eq!(ctx.current_reduce_batch_size(), reduce / 2);
    }

    #[test]
    fn error_log_is_bounded() {
        let ctx = context();
        ctx.add_error("A", Some("users/1"), "first");
        ctx.add_error("B", None, "second");
        ctx.add_error("A", Some("users/2"), "third");

        let errors = ctx.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].error, "second");

        ctx.clear_errors_for("A");
        assert_eq!(ctx.errors().len(), 1);
    }
}
