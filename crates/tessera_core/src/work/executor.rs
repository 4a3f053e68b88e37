//! Parallel fan-out for the workers and timers for repeated actions.

use crate::error::{CoreError, CoreResult};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Work run on a timer until it reports itself invalid.
pub trait RepeatedAction: Send + Sync {
    /// Time between runs.
    fn interval(&self) -> Duration;

    /// Whether the action should keep running.
    fn is_valid(&self) -> bool {
        true
    }

    /// One run.
    fn execute(&self);
}

struct Timer {
    actions: Arc<Mutex<Vec<Arc<dyn RepeatedAction>>>>,
    handle: JoinHandle<()>,
}

/// Runs items in fixed-size parallel partitions and drives repeated
/// actions, one timer thread per distinct interval.
pub struct BackgroundExecutor {
    degree: usize,
    timers: Mutex<BTreeMap<Duration, Timer>>,
    stop: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl std::fmt::Debug for BackgroundExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundExecutor")
            .field("degree", &self.degree)
            .field("timers", &self.timers.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackgroundExecutor {
    /// Creates an executor running up to `degree` items at once.
    #[must_use]
    pub fn new(degree: usize) -> Self {
        Self {
            degree: degree.max(1),
            timers: Mutex::new(BTreeMap::new()),
            stop: Mutex::new(None),
        }
    }

    /// Items run at once.
    #[must_use]
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Runs `action` for every item. Items are split into partitions of
    /// `degree`; the items of a partition run in parallel and partitions
    /// run one after another. A degree of one runs everything on the
    /// calling thread.
    pub fn execute_all<T, F>(&self, items: &[T], action: F)
    where
        T: Sync,
        F: Fn(&T) + Sync,
    {
        if self.degree == 1 || items.len() <= 1 {
            items.iter().for_each(&action);
            return;
        }
        let action = &action;
        for partition in items.chunks(self.degree) {
            thread::scope(|scope| {
                let handles: Vec<_> = partition
                    .iter()
                    .map(|item| scope.spawn(move || action(item)))
                    .collect();
                for handle in handles {
                    if handle.join().is_err() {
                        tracing::error!("parallel task panicked");
                    }
                }
            });
        }
    }

    /// Maps every item in parallel partitions, dropping `None` results.
    /// Output order follows input order.
    pub fn apply<T, R, F>(&self, items: &[T], action: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> Option<R> + Sync,
    {
        if self.degree == 1 || items.len() <= 1 {
            return items.iter().filter_map(&action).collect();
        }
        let action = &action;
        let mut output = Vec::with_capacity(items.len());
        for partition in items.chunks(self.degree) {
            thread::scope(|scope| {
                let handles: Vec<_> = partition
                    .iter()
                    .map(|item| scope.spawn(move || action(item)))
                    .collect();
                for handle in handles {
                    match handle.join() {
                        Ok(Some(result)) => output.push(result),
                        Ok(None) => {}
                        Err(_) => tracing::error!("parallel task panicked"),
                    }
                }
            });
        }
        output
    }

    /// Schedules an action on the timer for its interval, starting the
    /// timer thread if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer thread cannot be spawned.
    pub fn repeat(&self, action: Arc<dyn RepeatedAction>) -> CoreResult<()> {
        let interval = action.interval();
        let mut timers = self.timers.lock();
        if let Some(timer) = timers.get(&interval) {
            timer.actions.lock().push(action);
            return Ok(());
        }

        let stop = {
            let mut stop = self.stop.lock();
            stop.get_or_insert_with(|| bounded(0)).1.clone()
        };
        let actions = Arc::new(Mutex::new(vec![action]));
        let handle = {
            let actions = Arc::clone(&actions);
            thread::Builder::new()
                .name(format!("tessera-timer-{}ms", interval.as_millis()))
                .spawn(move || run_timer(interval, &stop, &actions))
                .map_err(|e| CoreError::invalid_operation(format!("cannot start timer: {e}")))?
        };
        timers.insert(interval, Timer { actions, handle });
        Ok(())
    }

    /// Stops every timer thread and waits for them.
    pub fn stop_repeaters(&self) {
        drop(self.stop.lock().take());
        let timers = std::mem::take(&mut *self.timers.lock());
        for (interval, timer) in timers {
            if timer.handle.join().is_err() {
                tracing::error!(interval_ms = interval.as_millis() as u64, "timer thread panicked");
            }
        }
    }

    /// Number of scheduled actions.
    #[must_use]
    pub fn repeated_action_count(&self) -> usize {
        self.timers
            .lock()
            .values()
            .map(|t| t.actions.lock().len())
            .sum()
    }
}

fn run_timer(interval: Duration, stop: &Receiver<()>, actions: &Mutex<Vec<Arc<dyn RepeatedAction>>>) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        let current: Vec<_> = {
            let mut actions = actions.lock();
            actions.retain(|a| a.is_valid());
            actions.clone()
        };
        for action in current {
            action.execute();
        }
    }
}

impl Drop for BackgroundExecutor {
    fn drop(&mut self) {
        self.stop_repeaters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn execute_all_visits_every_item() {
        for degree in [1, 3] {
            let executor = BackgroundExecutor::new(degree);
            let sum = AtomicUsize::new(0);
            let items: Vec<usize> = (1..=10).collect();
            executor.execute_all(&items, |i| {
                sum.fetch_add(*i, Ordering::SeqCst);
            });
            assert_eq!(sum.load(Ordering::SeqCst), 55);
        }
    }

    #[test]
    fn apply_keeps_order_and_drops_none() {
        let executor = BackgroundExecutor::new(4);
        let items: Vec<i32> = (0..10).collect();
        let evens = executor.apply(&items, |i| (i % 2 == 0).then_some(i * 10));
        assert_eq!(evens, vec![0, 20, 40, 60, 80]);
    }

    #[test]
    fn panicking_item_does_not_stop_the_rest() {
        let executor = BackgroundExecutor::new(2);
        let done = AtomicUsize::new(0);
        executor.execute_all(&[0, 1, 2, 3], |i| {
            assert!(*i != 1, "boom");
            done.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    struct Counter {
        runs: AtomicUsize,
        valid: AtomicBool,
    }

    impl RepeatedAction for Counter {
        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }
        fn is_valid(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
        fn execute(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn repeated_actions_run_until_invalid() {
        let executor = BackgroundExecutor::new(1);
        let counter = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            valid: AtomicBool::new(true),
        });
        executor.repeat(Arc::clone(&counter) as Arc<dyn RepeatedAction>).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(counter.runs.load(Ordering::SeqCst) >= 3);

        counter.valid.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(executor.repeated_action_count(), 0);

        executor.stop_repeaters();
        let runs = counter.runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.runs.load(Ordering::SeqCst), runs);
    }
}
