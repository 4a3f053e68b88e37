//! Database statistics and telemetry.
//!
//! [`DatabaseStats`] holds atomic operation counters that can be read while
//! operations are in progress. [`DatabaseStatistics`] is the point-in-time
//! health report built by `Database::statistics`.
//!
//! ```rust,ignore
//! let db = Database::open_in_memory()?;
//! db.put("users/1", None, data, metadata, None)?;
//!
//! println!("Writes: {}", db.metrics().puts());
//! println!("Stale: {:?}", db.statistics()?.stale_indexes);
//! ```

use crate::etag::Etag;
use crate::storage::{IndexFailureInformation, IndexStats};
use crate::triggers::TriggerInfo;
use crate::work::ServerError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters.
///
/// Values only grow.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    puts: AtomicU64,
    deletes: AtomicU64,
    reads: AtomicU64,
    patches: AtomicU64,
    batches: AtomicU64,
    attachment_puts: AtomicU64,
    attachment_deletes: AtomicU64,
    attachment_reads: AtomicU64,
    queries: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    concurrency_retries: AtomicU64,
    errors: AtomicU64,
}

impl DatabaseStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_patch(&self) {
        self.patches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attachment_put(&self) {
        self.attachment_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attachment_delete(&self) {
        self.attachment_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attachment_read(&self) {
        self.attachment_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.concurrency_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Document puts.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Document deletes.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Document reads by key.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Patches applied.
    pub fn patches(&self) -> u64 {
        self.patches.load(Ordering::Relaxed)
    }

    /// Command batches executed.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Attachment puts.
    pub fn attachment_puts(&self) -> u64 {
        self.attachment_puts.load(Ordering::Relaxed)
    }

    /// Attachment deletes.
    pub fn attachment_deletes(&self) -> u64 {
        self.attachment_deletes.load(Ordering::Relaxed)
    }

    /// Attachment reads.
    pub fn attachment_reads(&self) -> u64 {
        self.attachment_reads.load(Ordering::Relaxed)
    }

    /// Queries run.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Transactions rolled back.
    pub fn transactions_rolled_back(&self) -> u64 {
        self.transactions_rolled_back.load(Ordering::Relaxed)
    }

    /// Patch and batch attempts repeated after a concurrency conflict.
    pub fn concurrency_retries(&self) -> u64 {
        self.concurrency_retries.load(Ordering::Relaxed)
    }

    /// Operations that returned an error.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            puts: self.puts(),
            deletes: self.deletes(),
            reads: self.reads(),
            patches: self.patches(),
            batches: self.batches(),
            attachment_puts: self.attachment_puts(),
            attachment_deletes: self.attachment_deletes(),
            attachment_reads: self.attachment_reads(),
            queries: self.queries(),
            transactions_committed: self.transactions_committed(),
            transactions_rolled_back: self.transactions_rolled_back(),
            concurrency_retries: self.concurrency_retries(),
            errors: self.errors(),
        }
    }
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Document puts.
    pub puts: u64,
    /// Document deletes.
    pub deletes: u64,
    /// Document reads by key.
    pub reads: u64,
    /// Patches applied.
    pub patches: u64,
    /// Command batches executed.
    pub batches: u64,
    /// Attachment puts.
    pub attachment_puts: u64,
    /// Attachment deletes.
    pub attachment_deletes: u64,
    /// Attachment reads.
    pub attachment_reads: u64,
    /// Queries run.
    pub queries: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions rolled back.
    pub transactions_rolled_back: u64,
    /// Concurrency retries.
    pub concurrency_retries: u64,
    /// Failed operations.
    pub errors: u64,
}

/// Stats row of one index with its failure judgement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStatistics {
    /// The stored counters.
    #[serde(flatten)]
    pub stats: IndexStats,
    /// Map failure rate.
    pub failure_rate: f64,
    /// Reduce failure rate.
    pub reduce_failure_rate: f64,
    /// Whether the index is disabled.
    pub is_invalid: bool,
}

impl IndexStatistics {
    pub(crate) fn new(stats: IndexStats, failure: &IndexFailureInformation) -> Self {
        Self {
            failure_rate: failure.failure_rate(),
            reduce_failure_rate: failure.reduce_failure_rate(),
            is_invalid: failure.is_invalid(),
            stats,
        }
    }
}

/// Health report of a database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStatistics {
    /// Etag of the newest document.
    pub last_doc_etag: Option<Etag>,
    /// Etag of the newest attachment.
    pub last_attachment_etag: Option<Etag>,
    /// Stored documents.
    pub count_of_documents: u64,
    /// Stored attachments.
    pub count_of_attachments: u64,
    /// Queued background tasks.
    pub approximate_task_count: u64,
    /// Registered indexes.
    pub count_of_indexes: usize,
    /// Names of indexes lagging the documents.
    pub stale_indexes: Vec<String>,
    /// Per-index counters.
    pub indexes: Vec<IndexStatistics>,
    /// Recent indexing errors.
    pub errors: Vec<ServerError>,
    /// Registered triggers.
    pub triggers: Vec<TriggerInfo>,
    /// Documents read per indexing pass.
    pub current_number_of_items_to_index_in_single_batch: usize,
    /// Keys taken per reducing pass.
    pub current_number_of_items_to_reduce_in_single_batch: usize,
    /// Bytes used on disk.
    pub total_size_on_disk: u64,
}
