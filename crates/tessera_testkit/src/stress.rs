//! Load helpers for Tessera.
//!
//! These drive a database from several threads at once and report
//! throughput, to check behavior under concurrent access.

use crate::fixtures::{entity, obj};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tessera_core::{Database, PatchRequest};

/// Outcome of a load run.
#[derive(Debug, Clone, Copy)]
pub struct LoadReport {
    /// Operations that returned `Ok`.
    pub succeeded: usize,
    /// Operations that returned an error.
    pub failed: usize,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl LoadReport {
    /// All operations attempted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Operations per second, zero for an instant run.
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total() as f64 / secs
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for LoadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ok, {} failed in {:?} ({:.0} ops/s)",
            self.succeeded,
            self.failed,
            self.elapsed,
            self.throughput()
        )
    }
}

/// Shape of a load run.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Concurrent threads.
    pub threads: usize,
    /// Distinct document keys the threads share.
    pub document_count: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            document_count: 100,
        }
    }
}

fn run_threads<F>(config: &LoadConfig, op: F) -> LoadReport
where
    F: Fn(usize, usize) -> bool + Sync,
{
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|scope| {
        for thread_id in 0..config.threads {
            let (op, successful, failed) = (&op, &successful, &failed);
            scope.spawn(move || {
                for i in 0..config.operations {
                    let counter = if op(thread_id, i) { successful } else { failed };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    LoadReport {
        succeeded: successful.into_inner(),
        failed: failed.into_inner(),
        elapsed: start.elapsed(),
    }
}

/// Puts documents from every thread over a shared key space.
///
/// Puts carry no etag, so every one of them should succeed.
pub fn concurrent_write_stress(db: &Database, config: &LoadConfig) -> LoadReport {
    let documents = config.document_count.max(1);
    run_threads(config, |thread_id, i| {
        let key = format!("stress/{}", (thread_id * config.operations + i) % documents);
        db.put(
            &key,
            None,
            obj(json!({ "Thread": thread_id, "Op": i })),
            entity("Stress"),
            None,
        )
        .is_ok()
    })
}

/// Increments one counter document from every thread.
///
/// Patch conflicts are retried inside the database, so the final value of
/// `Count` equals the number of successful operations.
pub fn concurrent_patch_stress(db: &Database, key: &str, config: &LoadConfig) -> LoadReport {
    if db.get(key, None).ok().flatten().is_none() {
        // A failed seed shows up as failed patches below.
        let _ = db.put(key, None, obj(json!({ "Count": 0 })), entity("Counters"), None);
    }
    let increment = [PatchRequest::inc("Count", 1)];
    run_threads(config, |_, _| {
        db.apply_patch(key, None, &increment, None).is_ok()
    })
}

/// Mixes writes, reads and deletes from every thread.
pub fn mixed_workload_stress(db: &Database, config: &LoadConfig) -> LoadReport {
    let documents = config.document_count.max(1);
    run_threads(config, |thread_id, i| {
        let key = format!("mixed/{}", (thread_id + i) % documents);
        match i % 4 {
            0 | 1 => db
                .put(&key, None, obj(json!({ "Op": i })), entity("Mixed"), None)
                .is_ok(),
            2 => db.get(&key, None).is_ok(),
            _ => db.delete(&key, None, None).is_ok(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestDatabase;

    fn small() -> LoadConfig {
        LoadConfig {
            operations: 50,
            threads: 4,
            document_count: 10,
        }
    }

    #[test]
    fn concurrent_writes_succeed() {
        let test_db = TestDatabase::memory();
        let result = concurrent_write_stress(&test_db, &small());
        assert_eq!(result.total(), 200);
        assert_eq!(result.failed, 0);
        assert_eq!(test_db.get_documents(0, 100, None).unwrap().len(), 10);
    }

    #[test]
    fn concurrent_patches_do_not_lose_updates() {
        let test_db = TestDatabase::memory();
        let result = concurrent_patch_stress(&test_db, "counters/1", &small());
        let doc = test_db.get("counters/1", None).unwrap().unwrap();
        assert_eq!(doc.data["Count"], json!(result.succeeded));
        assert_eq!(result.failed, 0);
    }

    #[test]
    fn mixed_workload_completes() {
        let test_db = TestDatabase::memory();
        let result = mixed_workload_stress(&test_db, &small());
        assert_eq!(result.total(), 200);
        assert_eq!(result.failed, 0);
    }
}
