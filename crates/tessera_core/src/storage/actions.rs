//! Operations available inside a storage batch.
//!
//! A batch collects [`Mutation`]s and keeps an overlay of what it wrote,
//! so that reads inside the batch see the committed tables plus the
//! batch's own changes. Nothing reaches the committed tables before the
//! outermost batch commits.

use crate::error::{CoreError, CoreResult};
use crate::etag::Etag;
use crate::storage::mutation::Mutation;
use crate::storage::tables::{
    normalize_key, IndexStats, MappedResult, PendingTransaction, StagedOperation,
};
use crate::storage::TransactionalStorage;
use crate::tasks::{QueuedTask, Task, TaskKind};
use crate::types::{now_ms, Attachment, JsonDocument, JsonObject, TransactionInformation};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Callback run once the batch has committed.
pub type CommitCallback = Box<dyn FnOnce() + Send>;

/// State of the batch open on the current thread.
#[derive(Default)]
pub(crate) struct BatchState {
    read_only: bool,
    mutations: Vec<Mutation>,
    documents: HashMap<String, Option<JsonDocument>>,
    attachments: HashMap<String, Option<Attachment>>,
    transactions: HashMap<Uuid, Option<PendingTransaction>>,
    indexes: HashMap<String, Option<IndexStats>>,
    deleted_indexes: HashSet<String>,
    mapped: HashMap<(String, String), Option<Vec<MappedResult>>>,
    identities: HashMap<String, u64>,
    pending_tasks: Vec<Task>,
    taken_tasks: HashSet<u64>,
    on_commit: Vec<CommitCallback>,
}

impl BatchState {
    pub(crate) fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Splits the state into the mutations to log and the callbacks to run.
    pub(crate) fn into_parts(self) -> (Vec<Mutation>, Vec<CommitCallback>) {
        let added_ms = now_ms();
        let mut mutations = self.mutations;
        mutations.extend(
            self.pending_tasks
                .into_iter()
                .map(|task| Mutation::AddTask { task, added_ms }),
        );
        (mutations, self.on_commit)
    }

    /// Queues a commit callback; a read-only state hands it back.
    pub(crate) fn register_callback(&mut self, callback: CommitCallback) -> Result<(), CommitCallback> {
        if self.read_only {
            return Err(callback);
        }
        self.on_commit.push(callback);
        Ok(())
    }

    fn overlay(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::PutDocument(doc) => {
                self.documents
                    .insert(normalize_key(&doc.key), Some(doc.clone()));
            }
            Mutation::DeleteDocument { key } => {
                self.documents.insert(normalize_key(key), None);
            }
            Mutation::PutAttachment(attachment) => {
                self.attachments
                    .insert(normalize_key(&attachment.key), Some(attachment.clone()));
            }
            Mutation::DeleteAttachment { key } => {
                self.attachments.insert(normalize_key(key), None);
            }
            Mutation::PutTransaction(tx) => {
                self.transactions.insert(tx.id, Some(tx.clone()));
            }
            Mutation::DeleteTransaction { id } => {
                self.transactions.insert(*id, None);
            }
            Mutation::RemoveTasks { ids } => {
                self.taken_tasks.extend(ids.iter().copied());
            }
            Mutation::SetIndexStats(stats) => {
                self.deleted_indexes.remove(&stats.name);
                self.indexes.insert(stats.name.clone(), Some(stats.clone()));
            }
            Mutation::DeleteIndex { name } => {
                self.indexes.insert(name.clone(), None);
                self.deleted_indexes.insert(name.clone());
                self.pending_tasks.retain(|t| t.index() != name);
                self.mapped.retain(|(index, _), _| index != name);
            }
            Mutation::PutMappedResults {
                index,
                doc_key,
                results,
            } => {
                self.mapped.insert(
                    (index.clone(), normalize_key(doc_key)),
                    Some(results.clone()),
                );
            }
            Mutation::DeleteMappedResults { index, doc_key } => {
                self.mapped
                    .insert((index.clone(), normalize_key(doc_key)), None);
            }
            Mutation::SetIdentity { name, value } => {
                self.identities.insert(name.clone(), *value);
            }
            Mutation::AddTask { task, .. } => self.queue_task(task.clone()),
        }
    }

    fn queue_task(&mut self, task: Task) {
        if !self.pending_tasks.iter_mut().any(|t| t.try_merge(&task)) {
            self.pending_tasks.push(task);
        }
    }
}

/// Handle passed to batch actions.
pub struct StorageActions<'a> {
    storage: &'a TransactionalStorage,
    state: &'a RefCell<Option<BatchState>>,
}

impl<'a> StorageActions<'a> {
    pub(crate) fn new(
        storage: &'a TransactionalStorage,
        state: &'a RefCell<Option<BatchState>>,
    ) -> Self {
        Self { storage, state }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BatchState) -> T) -> CoreResult<T> {
        let mut guard = self.state.borrow_mut();
        let state = guard
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("no storage batch is open"))?;
        Ok(f(state))
    }

    fn record(&self, mutation: Mutation) -> CoreResult<()> {
        self.with_state(|state| {
            if state.read_only {
                return Err(CoreError::invalid_operation(
                    "cannot write through a read-only storage view",
                ));
            }
            state.overlay(&mutation);
            if !matches!(mutation, Mutation::AddTask { .. }) {
                state.mutations.push(mutation);
            }
            Ok(())
        })?
    }

    /// Whether this handle belongs to a read-only view.
    pub fn is_read_only(&self) -> CoreResult<bool> {
        self.with_state(|s| s.read_only)
    }

    /// Registers `callback` to run after the batch commits.
    pub fn on_commit(&self, callback: impl FnOnce() + Send + 'static) -> CoreResult<()> {
        self.with_state(|s| {
            s.register_callback(Box::new(callback))
                .map_err(|_| CoreError::invalid_operation("commit callbacks need a write batch"))
        })?
    }

    /// Returns a fresh etag.
    #[must_use]
    pub fn generate_etag(&self) -> Etag {
        self.storage.generator().next()
    }

    // ----- documents -----

    fn overlay_document(&self, norm: &str) -> CoreResult<Option<Option<JsonDocument>>> {
        self.with_state(|s| s.documents.get(norm).cloned())
    }

    fn committed_document(&self, norm: &str) -> CoreResult<Option<JsonDocument>> {
        if let Some(doc) = self.overlay_document(norm)? {
            return Ok(doc);
        }
        Ok(self.storage.tables().documents.get(norm).cloned())
    }

    /// Transaction holding an uncommitted change to `key`, other than
    /// `except`.
    pub fn locking_transaction(&self, key: &str, except: Option<Uuid>) -> CoreResult<Option<Uuid>> {
        let now = now_ms();
        Ok(self
            .transactions_view()?
            .into_iter()
            .find(|tx| {
                Some(tx.id) != except && !tx.is_expired(now) && tx.operation_for(key).is_some()
            })
            .map(|tx| tx.id))
    }

    /// Reads a document as seen by `tx`.
    ///
    /// A transaction sees its own staged changes. Everyone else sees the
    /// committed version, flagged non-authoritative while another
    /// transaction holds a change to it.
    pub fn document_by_key(
        &self,
        key: &str,
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<Option<JsonDocument>> {
        if let Some(tx) = tx {
            if let Some(pending) = self.live_transaction(tx.id)? {
                if let Some(op) = pending.operation_for(key) {
                    return Ok(match op {
                        StagedOperation::Put {
                            key,
                            data,
                            metadata,
                            etag,
                            staged_ms,
                        } => Some(JsonDocument {
                            key: key.clone(),
                            data: data.clone(),
                            metadata: metadata.clone(),
                            etag: *etag,
                            last_modified_ms: *staged_ms,
                            non_authoritative_information: false,
                        }),
                        StagedOperation::Delete { .. } => None,
                    });
                }
            }
        }

        let mut doc = self.committed_document(&normalize_key(key))?;
        if let Some(doc) = doc.as_mut() {
            if self
                .locking_transaction(key, tx.map(|t| t.id))?
                .is_some()
            {
                doc.non_authoritative_information = true;
            }
        }
        Ok(doc)
    }

    fn ensure_not_locked(&self, operation: &str, key: &str, owner: Option<Uuid>) -> CoreResult<()> {
        match self.locking_transaction(key, owner)? {
            Some(tx) => Err(CoreError::concurrency(format!(
                "{operation} attempted on document '{key}' that is locked by transaction: {tx}"
            ))),
            None => Ok(()),
        }
    }

    fn check_etag(
        operation: &str,
        key: &str,
        expected: Option<Etag>,
        actual: Option<Etag>,
    ) -> CoreResult<()> {
        match (expected, actual) {
            (None, _) => Ok(()),
            (Some(e), None) if e.is_empty() => Ok(()),
            (Some(e), Some(a)) if e == a => Ok(()),
            (Some(e), a) => Err(CoreError::etag_mismatch(
                format!("{operation} attempted on document '{key}' using a non current etag"),
                e,
                a,
            )),
        }
    }

    /// Stores a document, returning its new etag.
    ///
    /// `expected` must match the stored etag; [`Etag::EMPTY`] requires that
    /// the document does not exist.
    pub fn add_document(
        &self,
        key: &str,
        expected: Option<Etag>,
        data: JsonObject,
        metadata: JsonObject,
    ) -> CoreResult<Etag> {
        self.ensure_not_locked("PUT", key, None)?;
        let existing = self.committed_document(&normalize_key(key))?;
        Self::check_etag("PUT", key, expected, existing.as_ref().map(|d| d.etag))?;

        let etag = self.generate_etag();
        let key = existing.map_or_else(|| key.to_string(), |d| d.key);
        self.record(Mutation::PutDocument(JsonDocument {
            key,
            data,
            metadata,
            etag,
            last_modified_ms: now_ms(),
            non_authoritative_information: false,
        }))?;
        Ok(etag)
    }

    fn staged_or_committed_etag(&self, key: &str, tx: Uuid) -> CoreResult<Option<Etag>> {
        if let Some(pending) = self.live_transaction(tx)? {
            if let Some(op) = pending.operation_for(key) {
                return Ok(match op {
                    StagedOperation::Put { etag, .. } => Some(*etag),
                    StagedOperation::Delete { .. } => None,
                });
            }
        }
        Ok(self.committed_document(&normalize_key(key))?.map(|d| d.etag))
    }

    fn stage(&self, tx: &TransactionInformation, operation: StagedOperation) -> CoreResult<()> {
        let now = now_ms();
        let mut pending = self.live_transaction(tx.id)?.unwrap_or(PendingTransaction {
            id: tx.id,
            expires_at_ms: now,
            operations: Vec::new(),
        });
        pending.expires_at_ms = now.saturating_add(duration_ms(tx.timeout));
        pending.stage(operation);
        self.record(Mutation::PutTransaction(pending))
    }

    /// Stages a put for `tx`, invisible to others until commit.
    pub fn add_document_in_transaction(
        &self,
        tx: &TransactionInformation,
        key: &str,
        expected: Option<Etag>,
        data: JsonObject,
        metadata: JsonObject,
    ) -> CoreResult<Etag> {
        self.ensure_not_locked("PUT", key, Some(tx.id))?;
        let current = self.staged_or_committed_etag(key, tx.id)?;
        Self::check_etag("PUT", key, expected, current)?;

        let etag = self.generate_etag();
        self.stage(
            tx,
            StagedOperation::Put {
                key: key.to_string(),
                data,
                metadata,
                etag,
                staged_ms: now_ms(),
            },
        )?;
        Ok(etag)
    }

    /// Removes a document, returning its metadata and last etag.
    ///
    /// Deleting a missing document returns `None` without checking the etag.
    pub fn delete_document(
        &self,
        key: &str,
        expected: Option<Etag>,
    ) -> CoreResult<Option<(JsonObject, Etag)>> {
        self.ensure_not_locked("DELETE", key, None)?;
        let Some(existing) = self.committed_document(&normalize_key(key))? else {
            return Ok(None);
        };
        Self::check_etag("DELETE", key, expected, Some(existing.etag))?;

        self.record(Mutation::DeleteDocument {
            key: existing.key.clone(),
        })?;
        Ok(Some((existing.metadata, existing.etag)))
    }

    /// Stages a delete for `tx`. Returns whether the document was visible
    /// to the transaction.
    pub fn delete_document_in_transaction(
        &self,
        tx: &TransactionInformation,
        key: &str,
        expected: Option<Etag>,
    ) -> CoreResult<bool> {
        self.ensure_not_locked("DELETE", key, Some(tx.id))?;
        let current = self.staged_or_committed_etag(key, tx.id)?;
        if current.is_none() {
            return Ok(false);
        }
        Self::check_etag("DELETE", key, expected, current)?;
        self.stage(tx, StagedOperation::Delete { key: key.to_string() })?;
        Ok(true)
    }

    /// Documents written after `after`, oldest first.
    pub fn documents_after(&self, after: Etag, take: usize) -> CoreResult<Vec<JsonDocument>> {
        let overlay: Vec<JsonDocument> = self.with_state(|s| {
            let mut docs: Vec<_> = s.documents.values().flatten().cloned().collect();
            docs.sort_by_key(|d| d.etag);
            docs
        })?;
        let overlaid: HashSet<String> = self.with_state(|s| s.documents.keys().cloned().collect())?;

        let mut result = Vec::new();
        {
            let tables = self.storage.tables();
            for (_, norm) in tables
                .documents_by_etag
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
            {
                if result.len() >= take {
                    return Ok(result);
                }
                if overlaid.contains(norm) {
                    continue;
                }
                if let Some(doc) = tables.documents.get(norm) {
                    result.push(doc.clone());
                }
            }
        }
        result.extend(overlay.into_iter().filter(|d| d.etag > after));
        result.truncate(take);
        Ok(result)
    }

    /// Documents by most recent update first.
    pub fn documents_by_reverse_update_order(
        &self,
        start: usize,
        take: usize,
    ) -> CoreResult<Vec<JsonDocument>> {
        let mut result: Vec<JsonDocument> = self.with_state(|s| {
            let mut docs: Vec<_> = s.documents.values().flatten().cloned().collect();
            docs.sort_by(|a, b| b.etag.cmp(&a.etag));
            docs
        })?;
        let overlaid: HashSet<String> = self.with_state(|s| s.documents.keys().cloned().collect())?;

        let tables = self.storage.tables();
        for norm in tables.documents_by_etag.values().rev() {
            if result.len() >= start.saturating_add(take) {
                break;
            }
            if overlaid.contains(norm) {
                continue;
            }
            if let Some(doc) = tables.documents.get(norm) {
                result.push(doc.clone());
            }
        }
        Ok(result.into_iter().skip(start).take(take).collect())
    }

    /// Documents whose key starts with `prefix` (ignoring case), in key order.
    pub fn documents_with_id_starting_with(
        &self,
        prefix: &str,
        start: usize,
        take: usize,
    ) -> CoreResult<Vec<JsonDocument>> {
        let prefix = normalize_key(prefix);
        let mut found: HashMap<String, JsonDocument> = {
            let tables = self.storage.tables();
            tables
                .documents
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(k, d)| (k.clone(), d.clone()))
                .collect()
        };
        self.with_state(|s| {
            for (k, doc) in &s.documents {
                if !k.starts_with(&prefix) {
                    continue;
                }
                match doc {
                    Some(doc) => {
                        found.insert(k.clone(), doc.clone());
                    }
                    None => {
                        found.remove(k);
                    }
                }
            }
        })?;

        let mut keys: Vec<_> = found.keys().cloned().collect();
        keys.sort();
        Ok(keys
            .into_iter()
            .skip(start)
            .take(take)
            .filter_map(|k| found.remove(&k))
            .collect())
    }

    /// Whether a document with this key exists.
    pub fn document_exists(&self, key: &str) -> CoreResult<bool> {
        Ok(self.committed_document(&normalize_key(key))?.is_some())
    }

    /// Number of documents.
    pub fn document_count(&self) -> CoreResult<u64> {
        let overlay: Vec<(String, bool)> = self.with_state(|s| {
            s.documents
                .iter()
                .map(|(k, v)| (k.clone(), v.is_some()))
                .collect()
        })?;
        let tables = self.storage.tables();
        let mut count = tables.documents.len() as i64;
        for (key, present) in overlay {
            match (tables.documents.contains_key(&key), present) {
                (false, true) => count += 1,
                (true, false) => count -= 1,
                _ => {}
            }
        }
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Etag of the most recent document write, if any document exists.
    pub fn last_document_etag(&self) -> CoreResult<Option<Etag>> {
        let (newest, overlaid) = self.with_state(|s| {
            (
                s.documents.values().flatten().map(|d| d.etag).max(),
                s.documents.keys().cloned().collect::<HashSet<_>>(),
            )
        })?;
        if newest.is_some() {
            return Ok(newest);
        }
        let tables = self.storage.tables();
        Ok(tables
            .documents_by_etag
            .iter()
            .rev()
            .find(|(_, k)| !overlaid.contains(*k))
            .map(|(e, _)| *e))
    }

    // ----- attachments -----

    fn committed_attachment(&self, norm: &str) -> CoreResult<Option<Attachment>> {
        if let Some(found) = self.with_state(|s| s.attachments.get(norm).cloned())? {
            return Ok(found);
        }
        Ok(self.storage.tables().attachments.get(norm).cloned())
    }

    /// Stores an attachment, returning its new etag.
    pub fn add_attachment(
        &self,
        key: &str,
        expected: Option<Etag>,
        data: Vec<u8>,
        metadata: JsonObject,
    ) -> CoreResult<Etag> {
        let existing = self.committed_attachment(&normalize_key(key))?;
        Self::check_etag("PUT", key, expected, existing.as_ref().map(|a| a.etag))?;

        let etag = self.generate_etag();
        let key = existing.map_or_else(|| key.to_string(), |a| a.key);
        self.record(Mutation::PutAttachment(Attachment {
            key,
            size: data.len() as u64,
            data,
            metadata,
            etag,
        }))?;
        Ok(etag)
    }

    /// Removes an attachment. A missing attachment is not an error.
    pub fn delete_attachment(&self, key: &str, expected: Option<Etag>) -> CoreResult<bool> {
        let Some(existing) = self.committed_attachment(&normalize_key(key))? else {
            return Ok(false);
        };
        Self::check_etag("DELETE", key, expected, Some(existing.etag))?;
        self.record(Mutation::DeleteAttachment { key: existing.key })?;
        Ok(true)
    }

    /// Reads an attachment.
    pub fn attachment(&self, key: &str) -> CoreResult<Option<Attachment>> {
        self.committed_attachment(&normalize_key(key))
    }

    fn attachments_merged(&self) -> CoreResult<Vec<Attachment>> {
        let overlay: Vec<(String, Option<Attachment>)> = self.with_state(|s| {
            s.attachments
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })?;
        let mut all: HashMap<String, Attachment> = self
            .storage
            .tables()
            .attachments
            .iter()
            .map(|(k, a)| (k.clone(), a.clone()))
            .collect();
        for (k, v) in overlay {
            match v {
                Some(a) => {
                    all.insert(k, a);
                }
                None => {
                    all.remove(&k);
                }
            }
        }
        let mut list: Vec<_> = all.into_values().collect();
        list.sort_by_key(|a| a.etag);
        Ok(list)
    }

    /// Attachments after `after` oldest first, or all attachments newest
    /// first when `after` is `None`.
    pub fn attachments(
        &self,
        start: usize,
        take: usize,
        after: Option<Etag>,
    ) -> CoreResult<Vec<Attachment>> {
        let mut list = self.attachments_merged()?;
        match after {
            Some(after) => list.retain(|a| a.etag > after),
            None => list.reverse(),
        }
        Ok(list.into_iter().skip(start).take(take).collect())
    }

    /// Number of attachments.
    pub fn attachment_count(&self) -> CoreResult<u64> {
        Ok(self.attachments_merged()?.len() as u64)
    }

    /// Etag of the most recent attachment write.
    pub fn last_attachment_etag(&self) -> CoreResult<Option<Etag>> {
        Ok(self.attachments_merged()?.last().map(|a| a.etag))
    }

    // ----- transactions -----

    fn transactions_view(&self) -> CoreResult<Vec<PendingTransaction>> {
        let overlay: Vec<(Uuid, Option<PendingTransaction>)> = self.with_state(|s| {
            s.transactions
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect()
        })?;
        let mut all: HashMap<Uuid, PendingTransaction> = self.storage.tables().transactions.clone();
        for (id, row) in overlay {
            match row {
                Some(row) => {
                    all.insert(id, row);
                }
                None => {
                    all.remove(&id);
                }
            }
        }
        Ok(all.into_values().collect())
    }

    /// The pending transaction row, expired or not.
    pub fn transaction(&self, id: Uuid) -> CoreResult<Option<PendingTransaction>> {
        if let Some(row) = self.with_state(|s| s.transactions.get(&id).cloned())? {
            return Ok(row);
        }
        Ok(self.storage.tables().transactions.get(&id).cloned())
    }

    fn live_transaction(&self, id: Uuid) -> CoreResult<Option<PendingTransaction>> {
        let now = now_ms();
        Ok(self.transaction(id)?.filter(|tx| !tx.is_expired(now)))
    }

    /// Whether `id` has unexpired staged operations.
    pub fn has_transaction(&self, id: Uuid) -> CoreResult<bool> {
        Ok(self.live_transaction(id)?.is_some())
    }

    /// Removes the transaction, returning its row if it had not expired.
    pub fn complete_transaction(&self, id: Uuid) -> CoreResult<Option<PendingTransaction>> {
        let Some(row) = self.transaction(id)? else {
            return Ok(None);
        };
        self.record(Mutation::DeleteTransaction { id })?;
        Ok((!row.is_expired(now_ms())).then_some(row))
    }

    /// Discards the staged operations of `id`.
    pub fn rollback_transaction(&self, id: Uuid) -> CoreResult<bool> {
        if self.transaction(id)?.is_none() {
            return Ok(false);
        }
        self.record(Mutation::DeleteTransaction { id })?;
        Ok(true)
    }

    /// Moves the staged operations of `from` under a new id.
    pub fn modify_transaction_id(
        &self,
        from: Uuid,
        to: Uuid,
        timeout: Duration,
    ) -> CoreResult<bool> {
        let Some(mut row) = self.live_transaction(from)? else {
            return Ok(false);
        };
        row.id = to;
        row.expires_at_ms = now_ms().saturating_add(duration_ms(timeout));
        self.record(Mutation::DeleteTransaction { id: from })?;
        self.record(Mutation::PutTransaction(row))?;
        Ok(true)
    }

    /// Deletes every transaction expired at `now`, returning their ids.
    pub fn delete_expired_transactions(&self, now: u64) -> CoreResult<Vec<Uuid>> {
        let expired: Vec<Uuid> = self
            .transactions_view()?
            .into_iter()
            .filter(|tx| tx.is_expired(now))
            .map(|tx| tx.id)
            .collect();
        for id in &expired {
            self.record(Mutation::DeleteTransaction { id: *id })?;
        }
        Ok(expired)
    }

    // ----- tasks -----

    /// Queues a task. Tasks of the same batch merge first; on commit the
    /// task merges with a compatible queued task or is appended.
    pub fn add_task(&self, task: Task) -> CoreResult<()> {
        self.record(Mutation::AddTask {
            task,
            added_ms: now_ms(),
        })
    }

    fn visible_tasks(&self) -> CoreResult<(Vec<QueuedTask>, Vec<Task>)> {
        let (taken, pending, deleted) = self.with_state(|s| {
            (
                s.taken_tasks.clone(),
                s.pending_tasks.clone(),
                s.deleted_indexes.clone(),
            )
        })?;
        let committed = self
            .storage
            .tables()
            .tasks
            .values()
            .filter(|t| !taken.contains(&t.id) && !deleted.contains(t.task.index()))
            .cloned()
            .collect();
        Ok((committed, pending))
    }

    /// Whether any task is queued.
    pub fn has_tasks(&self) -> CoreResult<bool> {
        let (committed, pending) = self.visible_tasks()?;
        Ok(!committed.is_empty() || !pending.is_empty())
    }

    /// Number of queued tasks.
    pub fn approximate_task_count(&self) -> CoreResult<u64> {
        let (committed, pending) = self.visible_tasks()?;
        Ok((committed.len() + pending.len()) as u64)
    }

    /// Whether a task for `index` is queued.
    pub fn has_task_for(&self, index: &str) -> CoreResult<bool> {
        let (committed, pending) = self.visible_tasks()?;
        Ok(committed.iter().any(|t| t.task.index() == index)
            || pending.iter().any(|t| t.index() == index))
    }

    /// Takes queued tasks of `kind`, oldest first, until they carry
    /// `max_keys` keys. At least one task is taken when any is queued.
    pub fn take_tasks(&self, kind: TaskKind, max_keys: usize) -> CoreResult<Vec<QueuedTask>> {
        let (committed, _) = self.visible_tasks()?;
        let mut taken = Vec::new();
        let mut keys = 0;
        for task in committed.into_iter().filter(|t| t.task.kind() == kind) {
            if !taken.is_empty() && keys + task.task.keys().len() > max_keys {
                break;
            }
            keys += task.task.keys().len();
            taken.push(task);
        }
        if !taken.is_empty() {
            self.record(Mutation::RemoveTasks {
                ids: taken.iter().map(|t| t.id).collect(),
            })?;
        }
        Ok(taken)
    }

    // ----- indexes -----

    /// Adds the stats row of a new index.
    pub fn add_index(&self, name: &str, is_map_reduce: bool) -> CoreResult<()> {
        if self.index_stats(name)?.is_some() {
            return Err(CoreError::invalid_operation(format!(
                "index {name} already exists"
            )));
        }
        self.record(Mutation::SetIndexStats(IndexStats::new(name, is_map_reduce)))
    }

    /// Removes the stats row, queued tasks and mapped results of an index.
    pub fn delete_index(&self, name: &str) -> CoreResult<()> {
        self.record(Mutation::DeleteIndex {
            name: name.to_string(),
        })
    }

    /// The stats row of an index.
    pub fn index_stats(&self, name: &str) -> CoreResult<Option<IndexStats>> {
        if let Some(row) = self.with_state(|s| s.indexes.get(name).cloned())? {
            return Ok(row);
        }
        Ok(self.storage.tables().indexes.get(name).cloned())
    }

    /// Every stats row, ordered by name.
    pub fn all_index_stats(&self) -> CoreResult<Vec<IndexStats>> {
        let overlay: Vec<(String, Option<IndexStats>)> = self.with_state(|s| {
            s.indexes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })?;
        let mut all = self.storage.tables().indexes.clone();
        for (name, row) in overlay {
            match row {
                Some(row) => {
                    all.insert(name, row);
                }
                None => {
                    all.remove(&name);
                }
            }
        }
        Ok(all.into_values().collect())
    }

    /// Updates a stats row in place. Returns `false` for unknown indexes.
    pub fn update_index_stats(
        &self,
        name: &str,
        update: impl FnOnce(&mut IndexStats),
    ) -> CoreResult<bool> {
        let Some(mut stats) = self.index_stats(name)? else {
            return Ok(false);
        };
        update(&mut stats);
        self.record(Mutation::SetIndexStats(stats))?;
        Ok(true)
    }

    /// Bumps the touch count of an index.
    pub fn touch_index(&self, name: &str) -> CoreResult<bool> {
        self.update_index_stats(name, |s| s.touch_count += 1)
    }

    /// Whether the index lags the document stream.
    ///
    /// Stale when a task targets the index or a document newer than its
    /// last indexed etag exists. With `cutoff_ms` only an index not indexed
    /// since the cutoff counts as behind; with `cutoff_etag` the index is
    /// stale until it reached that etag.
    pub fn is_stale(
        &self,
        name: &str,
        cutoff_ms: Option<u64>,
        cutoff_etag: Option<Etag>,
    ) -> CoreResult<bool> {
        if self.has_task_for(name)? {
            return Ok(true);
        }
        let Some(stats) = self.index_stats(name)? else {
            return Ok(false);
        };
        if let Some(cutoff) = cutoff_etag {
            return Ok(stats.last_indexed_etag < cutoff);
        }
        let Some(last) = self.last_document_etag()? else {
            return Ok(false);
        };
        if stats.last_indexed_etag >= last {
            return Ok(false);
        }
        Ok(match cutoff_ms {
            Some(cutoff) => stats.last_indexed_timestamp_ms < cutoff,
            None => true,
        })
    }

    // ----- mapped results -----

    /// Replaces the mapped results one document produced.
    pub fn put_mapped_results(
        &self,
        index: &str,
        doc_key: &str,
        results: Vec<MappedResult>,
    ) -> CoreResult<()> {
        self.record(Mutation::PutMappedResults {
            index: index.to_string(),
            doc_key: doc_key.to_string(),
            results,
        })
    }

    /// Mapped results one document produced.
    pub fn mapped_results_for_document(
        &self,
        index: &str,
        doc_key: &str,
    ) -> CoreResult<Vec<MappedResult>> {
        let norm = normalize_key(doc_key);
        let key = (index.to_string(), norm.clone());
        let (overlay, deleted) = self.with_state(|s| {
            (s.mapped.get(&key).cloned(), s.deleted_indexes.contains(index))
        })?;
        if let Some(found) = overlay {
            return Ok(found.unwrap_or_default());
        }
        if deleted {
            return Ok(Vec::new());
        }
        Ok(self
            .storage
            .tables()
            .mapped_results
            .get(index)
            .and_then(|per_doc| per_doc.get(&norm))
            .cloned()
            .unwrap_or_default())
    }

    /// Removes the mapped results of a document, returning the reduce keys
    /// they belonged to.
    pub fn delete_mapped_results(&self, index: &str, doc_key: &str) -> CoreResult<BTreeSet<String>> {
        let previous = self.mapped_results_for_document(index, doc_key)?;
        self.record(Mutation::DeleteMappedResults {
            index: index.to_string(),
            doc_key: doc_key.to_string(),
        })?;
        Ok(previous.into_iter().map(|r| r.reduce_key).collect())
    }

    /// Every mapped result of the given reduce keys.
    pub fn mapped_results_for_reduce_keys(
        &self,
        index: &str,
        reduce_keys: &BTreeSet<String>,
    ) -> CoreResult<Vec<MappedResult>> {
        let (overlay, deleted) = self.with_state(|s| {
            let overlay: HashMap<String, Option<Vec<MappedResult>>> = s
                .mapped
                .iter()
                .filter(|((i, _), _)| i == index)
                .map(|((_, d), v)| (d.clone(), v.clone()))
                .collect();
            (overlay, s.deleted_indexes.contains(index))
        })?;

        let mut results = Vec::new();
        if !deleted {
            let tables = self.storage.tables();
            if let Some(per_doc) = tables.mapped_results.get(index) {
                for (doc, list) in per_doc {
                    if overlay.contains_key(doc) {
                        continue;
                    }
                    results.extend(
                        list.iter()
                            .filter(|r| reduce_keys.contains(&r.reduce_key))
                            .cloned(),
                    );
                }
            }
        }
        for list in overlay.into_values().flatten() {
            results.extend(list.into_iter().filter(|r| reduce_keys.contains(&r.reduce_key)));
        }
        Ok(results)
    }

    // ----- identities -----

    /// Current value of an identity counter.
    pub fn identity(&self, name: &str) -> CoreResult<u64> {
        if let Some(v) = self.with_state(|s| s.identities.get(name).copied())? {
            return Ok(v);
        }
        Ok(self
            .storage
            .tables()
            .identities
            .get(name)
            .copied()
            .unwrap_or(0))
    }

    /// Increments an identity counter and returns the new value.
    pub fn next_identity(&self, name: &str) -> CoreResult<u64> {
        let value = self.identity(name)? + 1;
        self.set_identity(name, value)?;
        Ok(value)
    }

    /// Sets an identity counter.
    pub fn set_identity(&self, name: &str, value: u64) -> CoreResult<()> {
        self.record(Mutation::SetIdentity {
            name: name.to_string(),
            value,
        })
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
