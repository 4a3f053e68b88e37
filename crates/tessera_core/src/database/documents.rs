//! Document reads and writes, patches and batches.

use super::Database;
use crate::commands::{BatchResult, Command};
use crate::error::{CoreError, CoreResult};
use crate::etag::Etag;
use crate::patch::{JsonPatcher, PatchRequest};
use crate::storage::StorageActions;
use crate::tasks::Task;
use crate::triggers::{DeleteTrigger, PutTrigger, ReadOperation};
use crate::types::{
    JsonDocument, JsonDocumentMetadata, JsonObject, PatchResult, PutResult,
    TransactionInformation, ENTITY_NAME,
};
use serde_json::Value;
use std::cell::Cell;
use tracing::debug;
use uuid::Uuid;

/// One optimistic attempt: done, or lost a race worth retrying.
pub(super) enum Attempt<T> {
    Done(T),
    Conflict(CoreError),
}

impl Database {
    /// Stores a document.
    ///
    /// An empty key gets a generated one; a key ending in `/` gets the next
    /// identity value for that prefix. With `tx` the write is staged and
    /// only the transaction sees it until commit.
    ///
    /// # Errors
    ///
    /// Returns `Veto` if a trigger denies the put and `Concurrency` if
    /// `etag` does not match the stored etag or another transaction holds
    /// the key.
    pub fn put(
        &self,
        key: &str,
        etag: Option<Etag>,
        data: JsonObject,
        metadata: JsonObject,
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<PutResult> {
        self.ensure_open()?;
        let _serial = self.put_serial.lock();
        let result = self
            .storage()
            .batch(|actions| self.put_in_batch(actions, key, etag, data, metadata, tx))
            .inspect_err(|_| self.stats.record_error())?;
        self.stats.record_put();
        debug!(key = %result.key, etag = %result.etag, "document stored");
        Ok(result)
    }

    pub(super) fn put_in_batch(
        &self,
        actions: &StorageActions<'_>,
        key: &str,
        etag: Option<Etag>,
        mut data: JsonObject,
        mut metadata: JsonObject,
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<PutResult> {
        let key = resolve_key(actions, key)?;
        data.retain(|name, _| !name.starts_with('@'));

        let triggers = &self.env.triggers;
        triggers.check_put(&key, &data, &metadata, tx)?;
        let put_triggers = triggers.active::<dyn PutTrigger>();
        for trigger in &put_triggers {
            trigger.on_put(&key, &mut data, &mut metadata, tx);
        }

        let new_etag = match tx {
            Some(tx) => {
                actions.add_document_in_transaction(tx, &key, etag, data.clone(), metadata.clone())?
            }
            None => actions.add_document(&key, etag, data.clone(), metadata.clone())?,
        };

        for trigger in &put_triggers {
            trigger.after_put(&key, &data, &metadata, new_etag);
        }
        if !put_triggers.is_empty() {
            let committed = key.clone();
            actions.on_commit(move || {
                for trigger in &put_triggers {
                    trigger.after_commit(&committed, &data, &metadata, new_etag);
                }
            })?;
        }
        Ok(PutResult {
            key,
            etag: new_etag,
        })
    }

    /// Reads a document through the read triggers.
    ///
    /// Returns `None` if the document is missing or a trigger ignores it.
    /// Another transaction's staged change is not visible; the committed
    /// version comes back flagged `non_authoritative_information`.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn get(
        &self,
        key: &str,
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<Option<JsonDocument>> {
        let doc = self.storage().read(|actions| actions.document_by_key(key, tx))?;
        self.stats.record_read();
        Ok(doc.and_then(|doc| self.env.triggers.process_read(doc, ReadOperation::Load, tx)))
    }

    /// Reads the metadata of a document through the read triggers.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn get_metadata(
        &self,
        key: &str,
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<Option<JsonDocumentMetadata>> {
        Ok(self.get(key, tx)?.map(|doc| doc.to_metadata()))
    }

    /// Deletes a document. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// See [`delete_with_metadata`](Self::delete_with_metadata).
    pub fn delete(
        &self,
        key: &str,
        etag: Option<Etag>,
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<bool> {
        Ok(self.delete_with_metadata(key, etag, tx)?.is_some())
    }

    /// Deletes a document, returning the metadata it had.
    ///
    /// # Errors
    ///
    /// Returns `Veto` if a trigger denies the delete and `Concurrency` if
    /// `etag` does not match or another transaction holds the key.
    pub fn delete_with_metadata(
        &self,
        key: &str,
        etag: Option<Etag>,
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<Option<JsonObject>> {
        self.ensure_open()?;
        let removed = self
            .storage()
            .batch(|actions| self.delete_in_batch(actions, key, etag, tx))
            .inspect_err(|_| self.stats.record_error())?;
        if removed.is_some() {
            self.stats.record_delete();
            debug!(key, "document deleted");
        }
        Ok(removed)
    }

    pub(super) fn delete_in_batch(
        &self,
        actions: &StorageActions<'_>,
        key: &str,
        etag: Option<Etag>,
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<Option<JsonObject>> {
        let triggers = &self.env.triggers;
        triggers.check_delete(key, tx)?;
        let delete_triggers = triggers.active::<dyn DeleteTrigger>();
        for trigger in &delete_triggers {
            trigger.on_delete(key, tx);
        }

        let removed = match tx {
            Some(tx) => {
                let metadata = actions.document_by_key(key, Some(tx))?.map(|d| d.metadata);
                if actions.delete_document_in_transaction(tx, key, etag)? {
                    Some(metadata.unwrap_or_default())
                } else {
                    None
                }
            }
            None => match actions.delete_document(key, etag)? {
                Some((metadata, _)) => {
                    self.queue_index_removals(actions, key, &metadata)?;
                    Some(metadata)
                }
                None => None,
            },
        };

        if removed.is_some() {
            for trigger in &delete_triggers {
                trigger.after_delete(key);
            }
            if !delete_triggers.is_empty() {
                let key = key.to_string();
                actions.on_commit(move || {
                    for trigger in &delete_triggers {
                        trigger.after_commit(&key);
                    }
                })?;
            }
        }
        Ok(removed)
    }

    /// Queues the removal of a deleted document from every index it may
    /// have fed.
    fn queue_index_removals(
        &self,
        actions: &StorageActions<'_>,
        key: &str,
        metadata: &JsonObject,
    ) -> CoreResult<()> {
        let entity = metadata.get(ENTITY_NAME).and_then(Value::as_str);
        for index in self.index_storage().all() {
            if index.compiled().covers_entity(entity) {
                actions.add_task(Task::remove_from_index(index.name(), vec![key.to_string()]))?;
            }
        }
        Ok(())
    }

    /// A page of documents: after `etag` oldest first, or without an etag
    /// most recently updated first. Documents ignored by read triggers are
    /// left out.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn get_documents(
        &self,
        start: usize,
        page_size: usize,
        etag: Option<Etag>,
    ) -> CoreResult<Vec<JsonDocument>> {
        let docs = self.storage().read(|actions| match etag {
            Some(etag) => Ok(actions
                .documents_after(etag, start.saturating_add(page_size))?
                .into_iter()
                .skip(start)
                .collect()),
            None => actions.documents_by_reverse_update_order(start, page_size),
        })?;
        Ok(self.hydrate(docs))
    }

    /// A page of documents whose key starts with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn get_documents_with_id_starting_with(
        &self,
        prefix: &str,
        start: usize,
        page_size: usize,
    ) -> CoreResult<Vec<JsonDocument>> {
        let docs = self
            .storage()
            .read(|actions| actions.documents_with_id_starting_with(prefix, start, page_size))?;
        Ok(self.hydrate(docs))
    }

    fn hydrate(&self, docs: Vec<JsonDocument>) -> Vec<JsonDocument> {
        docs.into_iter()
            .filter_map(|doc| {
                self.stats.record_read();
                self.env.triggers.process_read(doc, ReadOperation::Load, None)
            })
            .collect()
    }

    /// Applies patch requests to a document and stores the result.
    ///
    /// A conflict on the internal put is retried up to
    /// `max_patch_retries` times.
    ///
    /// # Errors
    ///
    /// Returns `Concurrency` if `etag` does not match or a `prev_val` check
    /// fails, `InvalidPatch` if a request does not fit the document, and
    /// `Veto` if a put trigger denies the result.
    pub fn apply_patch(
        &self,
        key: &str,
        etag: Option<Etag>,
        patches: &[PatchRequest],
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<PatchResult> {
        self.ensure_open()?;
        let _serial = self.put_serial.lock();
        let (result, _) = self
            .retry_on_conflict(self.env.config.max_patch_retries, || {
                self.storage()
                    .batch(|actions| self.patch_once(actions, key, etag, patches, tx))
            })
            .inspect_err(|_| self.stats.record_error())?;
        if result == PatchResult::Patched {
            self.stats.record_patch();
        }
        Ok(result)
    }

    fn patch_once(
        &self,
        actions: &StorageActions<'_>,
        key: &str,
        etag: Option<Etag>,
        patches: &[PatchRequest],
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<Attempt<(PatchResult, Option<PutResult>)>> {
        let Some(doc) = actions.document_by_key(key, tx)? else {
            return Ok(Attempt::Done((PatchResult::DocumentDoesNotExist, None)));
        };
        if let Some(expected) = etag {
            if doc.etag != expected {
                return Err(CoreError::etag_mismatch(
                    format!("PATCH attempted on document '{key}' using a non current etag"),
                    expected,
                    Some(doc.etag),
                ));
            }
        }

        let mut data = doc.data;
        JsonPatcher::new(&mut data).apply(patches)?;
        match self.put_in_batch(actions, &doc.key, Some(doc.etag), data, doc.metadata, tx) {
            Ok(put) => Ok(Attempt::Done((PatchResult::Patched, Some(put)))),
            Err(e) if e.is_concurrency() => Ok(Attempt::Conflict(e)),
            Err(e) => Err(e),
        }
    }

    /// Runs `attempt` until it is done, retrying conflicts at most
    /// `max_retries` times.
    pub(super) fn retry_on_conflict<T>(
        &self,
        max_retries: usize,
        mut attempt: impl FnMut() -> CoreResult<Attempt<T>>,
    ) -> CoreResult<T> {
        let mut retries = 0;
        loop {
            match attempt()? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Conflict(e) if retries < max_retries => {
                    retries += 1;
                    self.stats.record_retry();
                    debug!(retries, error = %e, "retrying after concurrency conflict");
                }
                Attempt::Conflict(e) => return Err(e),
            }
        }
    }

    /// Runs the commands in one storage batch.
    ///
    /// # Errors
    ///
    /// Returns the first failing command's error; nothing is written then.
    pub fn batch(&self, commands: &[Command]) -> CoreResult<Vec<BatchResult>> {
        self.batch_in_transaction(commands, None)
    }

    /// Runs the commands in one storage batch, staged in `tx` if given.
    ///
    /// A batch made only of patches is retried up to `max_batch_retries`
    /// times when a patch loses a concurrency race.
    ///
    /// # Errors
    ///
    /// Returns the first failing command's error; nothing is written then.
    pub fn batch_in_transaction(
        &self,
        commands: &[Command],
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<Vec<BatchResult>> {
        self.ensure_open()?;
        let _serial = commands
            .iter()
            .any(Command::writes_document)
            .then(|| self.put_serial.lock());
        let all_patches = !commands.is_empty() && commands.iter().all(Command::is_patch);
        let max_retries = if all_patches {
            self.env.config.max_batch_retries
        } else {
            0
        };

        let results = self
            .retry_on_conflict(max_retries, || {
                let conflict = Cell::new(false);
                match self
                    .storage()
                    .batch(|actions| self.execute_commands(actions, commands, tx, &conflict))
                {
                    Ok(results) => Ok(Attempt::Done(results)),
                    Err(e) if conflict.get() => Ok(Attempt::Conflict(e)),
                    Err(e) => Err(e),
                }
            })
            .inspect_err(|_| self.stats.record_error())?;
        self.stats.record_batch();
        debug!(commands = commands.len(), "batch executed");
        Ok(results)
    }

    fn execute_commands(
        &self,
        actions: &StorageActions<'_>,
        commands: &[Command],
        tx: Option<&TransactionInformation>,
        conflict: &Cell<bool>,
    ) -> CoreResult<Vec<BatchResult>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let result = match command {
                Command::Put {
                    key,
                    etag,
                    document,
                    metadata,
                } => {
                    let put = self.put_in_batch(
                        actions,
                        key,
                        *etag,
                        document.clone(),
                        metadata.clone(),
                        tx,
                    )?;
                    BatchResult {
                        method: command.method().to_string(),
                        key: put.key,
                        etag: Some(put.etag),
                        metadata: Some(metadata.clone()),
                        patch_result: None,
                        deleted: None,
                    }
                }
                Command::Delete { key, etag } => {
                    let removed = self.delete_in_batch(actions, key, *etag, tx)?;
                    BatchResult {
                        method: command.method().to_string(),
                        key: key.clone(),
                        etag: None,
                        metadata: None,
                        patch_result: None,
                        deleted: Some(removed.is_some()),
                    }
                }
                Command::Patch { key, etag, patches } => {
                    match self.patch_once(actions, key, *etag, patches, tx)? {
                        Attempt::Done((patch_result, put)) => BatchResult {
                            method: command.method().to_string(),
                            key: put.as_ref().map_or_else(|| key.clone(), |p| p.key.clone()),
                            etag: put.map(|p| p.etag),
                            metadata: None,
                            patch_result: Some(patch_result),
                            deleted: None,
                        },
                        Attempt::Conflict(e) => {
                            conflict.set(true);
                            return Err(e);
                        }
                    }
                }
            };
            results.push(result);
        }
        Ok(results)
    }
}

/// The key a put stores under.
fn resolve_key(actions: &StorageActions<'_>, key: &str) -> CoreResult<String> {
    if key.is_empty() {
        let etag = actions.generate_etag();
        return Ok(Uuid::from_bytes(*etag.as_bytes()).to_string());
    }
    if key.ends_with('/') {
        loop {
            let candidate = format!("{key}{}", actions.next_identity(key)?);
            if !actions.document_exists(&candidate)? {
                return Ok(candidate);
            }
        }
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{db, entity, obj};
    use super::*;
    use crate::triggers::{ReadTrigger, ReadVetoResult, VetoResult};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn body(name: &str) -> JsonObject {
        obj(json!({ "Name": name }))
    }

    #[test]
    fn put_get_delete() {
        let db = db();
        let put = db
            .put("users/1", None, body("Ayende"), entity("Users"), None)
            .unwrap();
        assert_eq!(put.key, "users/1");

        let doc = db.get("USERS/1", None).unwrap().unwrap();
        assert_eq!(doc.key, "users/1");
        assert_eq!(doc.etag, put.etag);
        assert_eq!(doc.data["Name"], "Ayende");
        assert_eq!(db.get_metadata("users/1", None).unwrap().unwrap().etag, put.etag);

        assert!(db.delete("users/1", Some(put.etag), None).unwrap());
        assert!(db.get("users/1", None).unwrap().is_none());
        assert!(!db.delete("users/1", None, None).unwrap());
        assert_eq!(db.metrics().puts(), 1);
        assert_eq!(db.metrics().deletes(), 1);
    }

    #[test]
    fn put_strips_reserved_properties() {
        let db = db();
        let data = obj(json!({"Name": "x", "@metadata": {"a": 1}, "@id": "y"}));
        db.put("users/1", None, data, JsonObject::new(), None).unwrap();
        let doc = db.get("users/1", None).unwrap().unwrap();
        assert_eq!(Value::Object(doc.data), json!({"Name": "x"}));
    }

    #[test]
    fn generated_keys() {
        let db = db();
        let a = db.put("", None, body("a"), JsonObject::new(), None).unwrap();
        let b = db.put("", None, body("b"), JsonObject::new(), None).unwrap();
        assert!(Uuid::parse_str(&a.key).is_ok());
        assert!(a.key < b.key);

        db.put("orders/2", None, body("taken"), JsonObject::new(), None).unwrap();
        let first = db.put("orders/", None, body("1"), JsonObject::new(), None).unwrap();
        let second = db.put("orders/", None, body("3"), JsonObject::new(), None).unwrap();
        assert_eq!(first.key, "orders/1");
        assert_eq!(second.key, "orders/3");
    }

    #[test]
    fn stale_etag_is_a_concurrency_error() {
        let db = db();
        let first = db.put("users/1", None, body("a"), JsonObject::new(), None).unwrap();
        db.put("users/1", Some(first.etag), body("b"), JsonObject::new(), None).unwrap();

        let err = db
            .put("users/1", Some(first.etag), body("c"), JsonObject::new(), None)
            .unwrap_err();
        match err {
            CoreError::Concurrency { expected, actual, .. } => {
                assert_eq!(expected, Some(first.etag));
                assert!(actual.is_some_and(|a| a > first.etag));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(db
            .put("users/2", Some(Etag::EMPTY), body("new"), JsonObject::new(), None)
            .is_ok());
        assert!(db.delete("users/1", Some(first.etag), None).unwrap_err().is_concurrency());
    }

    struct NoSystemKeys;

    impl PutTrigger for NoSystemKeys {
        fn allow_put(
            &self,
            key: &str,
            _data: &JsonObject,
            _metadata: &JsonObject,
            _tx: Option<&TransactionInformation>,
        ) -> VetoResult {
            if key.starts_with("sys/") {
                VetoResult::Deny("system keys are read only".into())
            } else {
                VetoResult::Allowed
            }
        }

        fn on_put(
            &self,
            _key: &str,
            data: &mut JsonObject,
            _metadata: &mut JsonObject,
            _tx: Option<&TransactionInformation>,
        ) {
            data.insert("Stamped".into(), json!(true));
        }
    }

    #[derive(Default)]
    struct CountCommits(AtomicUsize);

    impl PutTrigger for CountCommits {
        fn after_commit(&self, _key: &str, _data: &JsonObject, _metadata: &JsonObject, _etag: Etag) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl DeleteTrigger for CountCommits {
        fn allow_delete(&self, key: &str, _tx: Option<&TransactionInformation>) -> VetoResult {
            if key == "users/keep" {
                VetoResult::Deny("kept".into())
            } else {
                VetoResult::Allowed
            }
        }
    }

    #[test]
    fn put_and_delete_triggers() {
        let db = db();
        db.register_trigger::<dyn PutTrigger>(Arc::new(NoSystemKeys));
        let counter = Arc::new(CountCommits::default());
        db.register_trigger::<dyn PutTrigger>(counter.clone());
        db.register_trigger::<dyn DeleteTrigger>(counter.clone());

        let err = db.put("sys/1", None, body("x"), JsonObject::new(), None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "PUT vetoed by NoSystemKeys because: system keys are read only"
        );
        assert!(db.get("sys/1", None).unwrap().is_none());

        db.put("users/keep", None, body("x"), JsonObject::new(), None).unwrap();
        let doc = db.get("users/keep", None).unwrap().unwrap();
        assert_eq!(doc.data["Stamped"], true);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        assert!(matches!(
            db.delete("users/keep", None, None),
            Err(CoreError::Veto { .. })
        ));

        {
            let _guard = db.disable_all_triggers_for_current_thread();
            db.put("sys/2", None, body("x"), JsonObject::new(), None).unwrap();
            assert!(db.delete("users/keep", None, None).unwrap());
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    struct Secrets;

    impl ReadTrigger for Secrets {
        fn allow_read(
            &self,
            key: &str,
            _metadata: &JsonObject,
            _operation: ReadOperation,
            _tx: Option<&TransactionInformation>,
        ) -> ReadVetoResult {
            if key.starts_with("secrets/") {
                ReadVetoResult::Deny("classified".into())
            } else if key.starts_with("hidden/") {
                ReadVetoResult::Ignore
            } else {
                ReadVetoResult::Allowed
            }
        }
    }

    #[test]
    fn read_triggers_deny_and_ignore() {
        let db = db();
        db.register_trigger::<dyn ReadTrigger>(Arc::new(Secrets));
        for key in ["secrets/1", "hidden/1", "users/1"] {
            db.put(key, None, body(key), JsonObject::new(), None).unwrap();
        }

        let denied = db.get("secrets/1", None).unwrap().unwrap();
        assert!(denied.data.is_empty());
        assert_eq!(denied.metadata["Read-Veto"]["Reason"], "classified");
        assert!(db.get("hidden/1", None).unwrap().is_none());

        let page = db.get_documents(0, 10, None).unwrap();
        let keys: Vec<_> = page.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["users/1", "secrets/1"]);
    }

    #[test]
    fn range_reads() {
        let db = db();
        let first = db.put("users/1", None, body("1"), JsonObject::new(), None).unwrap();
        db.put("users/2", None, body("2"), JsonObject::new(), None).unwrap();
        db.put("orders/1", None, body("o"), JsonObject::new(), None).unwrap();

        let latest: Vec<_> = db
            .get_documents(0, 2, None)
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(latest, vec!["orders/1", "users/2"]);

        let after: Vec<_> = db
            .get_documents(0, 10, Some(first.etag))
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(after, vec!["users/2", "orders/1"]);

        let users: Vec<_> = db
            .get_documents_with_id_starting_with("USERS/", 1, 10)
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(users, vec!["users/2"]);
    }

    #[test]
    fn patch_applies_and_checks_etags() {
        let db = db();
        let put = db
            .put("users/1", None, obj(json!({"Count": 1})), JsonObject::new(), None)
            .unwrap();
        assert_eq!(
            db.apply_patch("users/404", None, &[PatchRequest::inc("Count", 1)], None)
                .unwrap(),
            PatchResult::DocumentDoesNotExist
        );
        assert_eq!(db.metrics().patches(), 0);
        assert_eq!(
            db.apply_patch("users/1", Some(put.etag), &[PatchRequest::inc("Count", 2)], None)
                .unwrap(),
            PatchResult::Patched
        );
        let doc = db.get("users/1", None).unwrap().unwrap();
        assert_eq!(doc.data["Count"], 3);
        assert!(doc.etag > put.etag);

        assert!(db
            .apply_patch("users/1", Some(put.etag), &[PatchRequest::inc("Count", 1)], None)
            .unwrap_err()
            .is_concurrency());
        assert!(matches!(
            db.apply_patch("users/1", None, &[PatchRequest::add("Count", json!(1))], None),
            Err(CoreError::InvalidPatch { .. })
        ));
        assert_eq!(db.metrics().patches(), 1);
    }

    #[test]
    fn patch_of_a_locked_document_gives_up_after_the_retries() {
        let db = Database::open_in_memory_with(
            super::super::tests::quiet_config().retries(2, 2),
            crate::triggers::TriggerRegistry::new(),
        )
        .unwrap();
        db.put("users/1", None, body("a"), JsonObject::new(), None).unwrap();
        let tx = TransactionInformation::new(Duration::from_secs(60));
        db.put("users/1", None, body("b"), JsonObject::new(), Some(&tx)).unwrap();

        let err = db
            .apply_patch("users/1", None, &[PatchRequest::set("Name", json!("c"))], None)
            .unwrap_err();
        assert!(err.is_concurrency());
        assert_eq!(db.metrics().concurrency_retries(), 2);
    }

    #[test]
    fn batch_is_atomic() {
        let db = db();
        let existing = db.put("users/1", None, body("a"), JsonObject::new(), None).unwrap();

        let results = db
            .batch(&[
                Command::Put {
                    key: "users/2".into(),
                    etag: None,
                    document: body("b"),
                    metadata: JsonObject::new(),
                },
                Command::Patch {
                    key: "users/1".into(),
                    etag: Some(existing.etag),
                    patches: vec![PatchRequest::set("Name", json!("patched"))],
                },
                Command::Delete {
                    key: "users/3".into(),
                    etag: None,
                },
            ])
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].method, "PUT");
        assert_eq!(results[1].patch_result, Some(PatchResult::Patched));
        assert_eq!(results[2].deleted, Some(false));
        assert_eq!(db.get("users/1", None).unwrap().unwrap().data["Name"], "patched");

        let err = db
            .batch(&[
                Command::Put {
                    key: "users/4".into(),
                    etag: None,
                    document: body("d"),
                    metadata: JsonObject::new(),
                },
                Command::Delete {
                    key: "users/2".into(),
                    etag: Some(existing.etag),
                },
            ])
            .unwrap_err();
        assert!(err.is_concurrency());
        assert!(db.get("users/4", None).unwrap().is_none());
        assert!(db.get("users/2", None).unwrap().is_some());
    }
}
