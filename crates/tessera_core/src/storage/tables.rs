//! Committed table state.

use crate::etag::Etag;
use crate::storage::mutation::Mutation;
use crate::tasks::{QueuedTask, Task, TaskKind};
use crate::types::{Attachment, JsonDocument, JsonObject};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Lookup key for the case-insensitive key spaces.
#[must_use]
pub fn normalize_key(key: &str) -> String {
    key.to_lowercase()
}

/// Per-index bookkeeping row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Index name.
    pub name: String,
    /// Whether the index has a reduce step.
    pub is_map_reduce: bool,
    /// Etag of the last document the index has seen.
    pub last_indexed_etag: Etag,
    /// When the index last advanced, ms since epoch.
    pub last_indexed_timestamp_ms: u64,
    /// Etag of the last mapped result reduced.
    pub last_reduced_etag: Option<Etag>,
    /// When the index last reduced, ms since epoch.
    pub last_reduced_timestamp_ms: Option<u64>,
    /// Bumped by `touch_index`, changes the index etag.
    pub touch_count: u64,
    /// Documents the map step tried.
    pub indexing_attempts: u64,
    /// Documents the map step failed on.
    pub indexing_errors: u64,
    /// Documents the map step handled.
    pub indexing_successes: u64,
    /// Reduce keys the reduce step tried.
    pub reduce_attempts: u64,
    /// Reduce keys the reduce step failed on.
    pub reduce_errors: u64,
    /// Reduce keys the reduce step handled.
    pub reduce_successes: u64,
}

impl IndexStats {
    /// A fresh row for a new index.
    #[must_use]
    pub fn new(name: impl Into<String>, is_map_reduce: bool) -> Self {
        Self {
            name: name.into(),
            is_map_reduce,
            last_indexed_etag: Etag::EMPTY,
            last_indexed_timestamp_ms: 0,
            last_reduced_etag: None,
            last_reduced_timestamp_ms: None,
            touch_count: 0,
            indexing_attempts: 0,
            indexing_errors: 0,
            indexing_successes: 0,
            reduce_attempts: 0,
            reduce_errors: 0,
            reduce_successes: 0,
        }
    }

    /// Judges the map and reduce counters against the threshold.
    #[must_use]
    pub fn failure_rate(&self, threshold: f64, min_attempts: u64) -> IndexFailureInformation {
        IndexFailureInformation {
            name: self.name.clone(),
            is_map_reduce: self.is_map_reduce,
            attempts: self.indexing_attempts,
            errors: self.indexing_errors,
            successes: self.indexing_successes,
            reduce_attempts: self.reduce_attempts,
            reduce_errors: self.reduce_errors,
            reduce_successes: self.reduce_successes,
            threshold,
            min_attempts,
        }
    }
}

/// Failure counters of one index with the rule that judges them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFailureInformation {
    /// Index name.
    pub name: String,
    /// Whether the index reduces.
    pub is_map_reduce: bool,
    /// Map attempts.
    pub attempts: u64,
    /// Map errors.
    pub errors: u64,
    /// Map successes.
    pub successes: u64,
    /// Reduce attempts.
    pub reduce_attempts: u64,
    /// Reduce errors.
    pub reduce_errors: u64,
    /// Reduce successes.
    pub reduce_successes: u64,
    /// Failure rate above which the index is invalid.
    pub threshold: f64,
    /// Attempts below which the rate is not judged.
    pub min_attempts: u64,
}

impl IndexFailureInformation {
    /// `errors / attempts` of the map step, zero without attempts.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        rate(self.errors, self.attempts)
    }

    /// `errors / attempts` of the reduce step, zero without attempts.
    #[must_use]
    pub fn reduce_failure_rate(&self) -> f64 {
        rate(self.reduce_errors, self.reduce_attempts)
    }

    /// Whether either step crossed the threshold after enough attempts.
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        let map_invalid =
            self.attempts >= self.min_attempts && self.failure_rate() > self.threshold;
        let reduce_invalid = self.reduce_attempts >= self.min_attempts
            && self.reduce_failure_rate() > self.threshold;
        map_invalid || reduce_invalid
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate(errors: u64, attempts: u64) -> f64 {
    if attempts == 0 {
        0.0
    } else {
        errors as f64 / attempts as f64
    }
}

/// One mapped entry of a map-reduce index, awaiting reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedResult {
    /// Group the entry belongs to.
    pub reduce_key: String,
    /// Mapped field values.
    pub value: JsonObject,
    /// Etag assigned when the entry was written.
    pub etag: Etag,
}

/// An operation staged by a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StagedOperation {
    /// A staged put.
    Put {
        /// Document key.
        key: String,
        /// Body.
        data: JsonObject,
        /// Metadata.
        metadata: JsonObject,
        /// Etag the staged version is visible under.
        etag: Etag,
        /// When it was staged, ms since epoch.
        staged_ms: u64,
    },
    /// A staged delete.
    Delete {
        /// Document key.
        key: String,
    },
}

impl StagedOperation {
    /// The document key the operation targets.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Row of the pending-transactions table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Transaction id.
    pub id: Uuid,
    /// Absolute expiry, ms since epoch.
    pub expires_at_ms: u64,
    /// Staged operations in order; at most one per key.
    pub operations: Vec<StagedOperation>,
}

impl PendingTransaction {
    /// Whether the transaction expired at `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms <= now_ms
    }

    /// The staged operation for `key`, if any.
    #[must_use]
    pub fn operation_for(&self, key: &str) -> Option<&StagedOperation> {
        let key = normalize_key(key);
        self.operations
            .iter()
            .find(|op| normalize_key(op.key()) == key)
    }

    /// Replaces the staged operation for the same key, or appends.
    pub fn stage(&mut self, operation: StagedOperation) {
        let key = normalize_key(operation.key());
        self.operations.retain(|op| normalize_key(op.key()) != key);
        self.operations.push(operation);
    }
}

/// Every table of the store. The etag orderings are derived and rebuilt
/// after loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    /// Documents by normalized key.
    pub documents: HashMap<String, JsonDocument>,
    /// Normalized document keys by etag.
    #[serde(skip)]
    pub documents_by_etag: BTreeMap<Etag, String>,
    /// Attachments by normalized key.
    pub attachments: HashMap<String, Attachment>,
    /// Normalized attachment keys by etag.
    #[serde(skip)]
    pub attachments_by_etag: BTreeMap<Etag, String>,
    /// Pending transactions by id.
    pub transactions: HashMap<Uuid, PendingTransaction>,
    /// Task queue in insertion order.
    pub tasks: BTreeMap<u64, QueuedTask>,
    /// Next task id.
    pub next_task_id: u64,
    /// Index rows by name.
    pub indexes: BTreeMap<String, IndexStats>,
    /// Mapped results by index, then normalized document key.
    pub mapped_results: BTreeMap<String, BTreeMap<String, Vec<MappedResult>>>,
    /// Identity counters by name.
    pub identities: BTreeMap<String, u64>,
}

impl Tables {
    /// Rebuilds the etag orderings from the primary tables.
    pub fn rebuild_derived(&mut self) {
        self.documents_by_etag = self
            .documents
            .iter()
            .map(|(k, d)| (d.etag, k.clone()))
            .collect();
        self.attachments_by_etag = self
            .attachments
            .iter()
            .map(|(k, a)| (a.etag, k.clone()))
            .collect();
    }

    /// Applies one committed mutation.
    pub fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::PutDocument(doc) => {
                let key = normalize_key(&doc.key);
                if let Some(old) = self.documents.get(&key) {
                    self.documents_by_etag.remove(&old.etag);
                }
                self.documents_by_etag.insert(doc.etag, key.clone());
                self.documents.insert(key, doc);
            }
            Mutation::DeleteDocument { key } => {
                if let Some(old) = self.documents.remove(&normalize_key(&key)) {
                    self.documents_by_etag.remove(&old.etag);
                }
            }
            Mutation::PutAttachment(attachment) => {
                let key = normalize_key(&attachment.key);
                if let Some(old) = self.attachments.get(&key) {
                    self.attachments_by_etag.remove(&old.etag);
                }
                self.attachments_by_etag.insert(attachment.etag, key.clone());
                self.attachments.insert(key, attachment);
            }
            Mutation::DeleteAttachment { key } => {
                if let Some(old) = self.attachments.remove(&normalize_key(&key)) {
                    self.attachments_by_etag.remove(&old.etag);
                }
            }
            Mutation::PutTransaction(tx) => {
                self.transactions.insert(tx.id, tx);
            }
            Mutation::DeleteTransaction { id } => {
                self.transactions.remove(&id);
            }
            Mutation::AddTask { task, added_ms } => self.add_task(task, added_ms),
            Mutation::RemoveTasks { ids } => {
                for id in ids {
                    self.tasks.remove(&id);
                }
            }
            Mutation::SetIndexStats(stats) => {
                self.indexes.insert(stats.name.clone(), stats);
            }
            Mutation::DeleteIndex { name } => {
                self.indexes.remove(&name);
                self.mapped_results.remove(&name);
                self.tasks.retain(|_, t| t.task.index() != name);
            }
            Mutation::PutMappedResults {
                index,
                doc_key,
                results,
            } => {
                self.mapped_results
                    .entry(index)
                    .or_default()
                    .insert(normalize_key(&doc_key), results);
            }
            Mutation::DeleteMappedResults { index, doc_key } => {
                if let Some(per_doc) = self.mapped_results.get_mut(&index) {
                    per_doc.remove(&normalize_key(&doc_key));
                }
            }
            Mutation::SetIdentity { name, value } => {
                self.identities.insert(name, value);
            }
        }
    }

    /// Queues a task, merging it into the first compatible queued task.
    fn add_task(&mut self, task: Task, added_ms: u64) {
        for queued in self.tasks.values_mut() {
            if queued.task.try_merge(&task) {
                return;
            }
        }
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.tasks.insert(
            id,
            QueuedTask {
                id,
                added_ms,
                task,
            },
        );
    }

    /// Whether any queued task targets `index`.
    #[must_use]
    pub fn has_task_for(&self, index: &str) -> bool {
        self.tasks.values().any(|t| t.task.index() == index)
    }

    /// Queued tasks of one kind, oldest first.
    pub fn tasks_of_kind(&self, kind: TaskKind) -> impl Iterator<Item = &QueuedTask> {
        self.tasks.values().filter(move |t| t.task.kind() == kind)
    }

    /// Etag of the most recent document write.
    #[must_use]
    pub fn last_document_etag(&self) -> Option<Etag> {
        self.documents_by_etag.keys().next_back().copied()
    }

    /// Etag of the most recent attachment write.
    #[must_use]
    pub fn last_attachment_etag(&self) -> Option<Etag> {
        self.attachments_by_etag.keys().next_back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(key: &str, counter: u64) -> JsonDocument {
        JsonDocument {
            key: key.into(),
            data: json!({"v": counter}).as_object().cloned().unwrap(),
            metadata: JsonObject::new(),
            etag: Etag::new(1, counter),
            last_modified_ms: 0,
            non_authoritative_information: false,
        }
    }

    #[test]
    fn put_replaces_etag_ordering() {
        let mut tables = Tables::default();
        tables.apply(Mutation::PutDocument(doc("Users/1", 1)));
        tables.apply(Mutation::PutDocument(doc("users/1", 2)));

        assert_eq!(tables.documents.len(), 1);
        assert_eq!(tables.documents_by_etag.len(), 1);
        assert_eq!(tables.last_document_etag(), Some(Etag::new(1, 2)));

        tables.apply(Mutation::DeleteDocument { key: "USERS/1".into() });
        assert!(tables.documents.is_empty());
        assert_eq!(tables.last_document_etag(), None);
    }

    #[test]
    fn queued_tasks_merge_at_apply_time() {
        let mut tables = Tables::default();
        tables.apply(Mutation::AddTask {
            task: Task::reduce("Totals", vec!["a".into()]),
            added_ms: 1,
        });
        tables.apply(Mutation::AddTask {
            task: Task::reduce("Totals", vec!["b".into()]),
            added_ms: 2,
        });
        tables.apply(Mutation::AddTask {
            task: Task::remove_from_index("Totals", vec!["doc".into()]),
            added_ms: 3,
        });

        assert_eq!(tables.tasks.len(), 2);
        assert!(tables.has_task_for("Totals"));
        let reduce: Vec<_> = tables.tasks_of_kind(TaskKind::Reduce).collect();
        assert_eq!(reduce[0].task.keys(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn delete_index_drops_its_rows() {
        let mut tables = Tables::default();
        tables.apply(Mutation::SetIndexStats(IndexStats::new("Totals", true)));
        tables.apply(Mutation::AddTask {
            task: Task::reduce("Totals", vec!["a".into()]),
            added_ms: 1,
        });
        tables.apply(Mutation::PutMappedResults {
            index: "Totals".into(),
            doc_key: "orders/1".into(),
            results: Vec::new(),
        });

        tables.apply(Mutation::DeleteIndex { name: "Totals".into() });
        assert!(tables.indexes.is_empty());
        assert!(tables.tasks.is_empty());
        assert!(tables.mapped_results.is_empty());
    }

    #[test]
    fn failure_rate_needs_min_attempts() {
        let mut stats = IndexStats::new("Idx", false);
        stats.indexing_attempts = 10;
        stats.indexing_errors = 10;
        assert!(!stats.failure_rate(0.15, 100).is_invalid());

        stats.indexing_attempts = 100;
        stats.indexing_errors = 16;
        assert!(stats.failure_rate(0.15, 100).is_invalid());

        stats.indexing_errors = 15;
        assert!(!stats.failure_rate(0.15, 100).is_invalid());
    }

    #[test]
    fn staged_operations_are_unique_per_key() {
        let mut tx = PendingTransaction {
            id: Uuid::new_v4(),
            expires_at_ms: 10,
            operations: Vec::new(),
        };
        tx.stage(StagedOperation::Delete { key: "A".into() });
        tx.stage(StagedOperation::Delete { key: "a".into() });
        assert_eq!(tx.operations.len(), 1);
        assert!(tx.operation_for("A").is_some());
        assert!(tx.is_expired(10));
        assert!(!tx.is_expired(9));
    }
}
