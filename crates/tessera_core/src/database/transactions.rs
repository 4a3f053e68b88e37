//! Commit, rollback and promotion of document transactions.

use super::Database;
use crate::error::{CoreError, CoreResult};
use crate::storage::StagedOperation;
use crate::transactions::{PropagationToken, TransactionOutcome};
use crate::types::{now_ms, recovery_information_key, JsonObject};
use tracing::{debug, info};
use uuid::Uuid;

impl Database {
    /// Whether a live transaction with this id has staged operations.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn has_transaction(&self, id: Uuid) -> CoreResult<bool> {
        self.ensure_open()?;
        self.storage().read(|actions| actions.has_transaction(id))
    }

    /// Applies the staged operations of a transaction as one batch.
    ///
    /// The operations go through the put and delete triggers again, now
    /// outside the transaction. Unknown or expired transactions are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns the error of the first operation that fails; nothing is
    /// applied in that case.
    pub fn commit(&self, id: Uuid) -> CoreResult<()> {
        self.ensure_open()?;
        let _serial = self.put_serial.lock();
        let applied = self.storage().batch(|actions| {
            let Some(pending) = actions.complete_transaction(id)? else {
                return Ok(0);
            };
            let count = pending.operations.len();
            for operation in pending.operations {
                match operation {
                    StagedOperation::Put {
                        key,
                        data,
                        metadata,
                        ..
                    } => {
                        self.put_in_batch(actions, &key, None, data, metadata, None)?;
                    }
                    StagedOperation::Delete { key } => {
                        self.delete_in_batch(actions, &key, None, None)?;
                    }
                }
            }
            actions.delete_attachment(&recovery_information_key(id), None)?;
            Ok(count)
        })?;

        self.promoted.complete(id);
        self.stats.record_commit();
        self.env.context.notify_about_work();
        info!(transaction = %id, operations = applied, "transaction committed");
        Ok(())
    }

    /// Discards the staged operations of a transaction.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn rollback(&self, id: Uuid) -> CoreResult<()> {
        self.ensure_open()?;
        let existed = self.storage().batch(|actions| {
            let existed = actions.rollback_transaction(id)?;
            actions.delete_attachment(&recovery_information_key(id), None)?;
            Ok(existed)
        })?;
        self.promoted.complete(id);
        self.stats.record_rollback();
        debug!(transaction = %id, existed, "transaction rolled back");
        Ok(())
    }

    /// First phase of a two-phase commit: records recovery information for
    /// the transaction. Returns false if the transaction is unknown.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the write.
    pub fn prepare(&self, id: Uuid) -> CoreResult<bool> {
        self.ensure_open()?;
        let recovery = match self.promoted.get(id) {
            Some(handle) => handle.token.to_bytes()?,
            None => id.as_bytes().to_vec(),
        };
        let prepared = self.storage().batch(|actions| {
            if !actions.has_transaction(id)? {
                return Ok(false);
            }
            let key = recovery_information_key(id);
            let existing = actions.attachment(&key)?.map(|a| a.etag);
            actions.add_attachment(&key, existing, recovery, JsonObject::new())?;
            Ok(true)
        })?;
        if prepared {
            self.promoted.mark_prepared(id);
            debug!(transaction = %id, "transaction prepared");
        }
        Ok(prepared)
    }

    /// Moves a local transaction under a fresh distributed id and returns
    /// the token naming it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if no live transaction has that id.
    pub fn promote_transaction(&self, from: Uuid) -> CoreResult<PropagationToken> {
        self.ensure_open()?;
        let token = PropagationToken {
            transaction_id: Uuid::new_v4(),
            promoted_from: from,
            issued_ms: now_ms(),
            timeout: self.env.config.transaction_timeout,
        };
        let moved = self.storage().batch(|actions| {
            actions.modify_transaction_id(from, token.transaction_id, token.timeout)
        })?;
        if !moved {
            return Err(CoreError::invalid_operation(format!(
                "transaction {from} does not exist or has expired"
            )));
        }
        self.promoted.insert(token);
        info!(from = %from, to = %token.transaction_id, "transaction promoted");
        Ok(token)
    }

    /// Ends a promoted transaction with the coordinator's decision.
    ///
    /// # Errors
    ///
    /// Same as [`Database::commit`] and [`Database::rollback`].
    pub fn complete_promoted(
        &self,
        token: &PropagationToken,
        outcome: TransactionOutcome,
    ) -> CoreResult<()> {
        match outcome {
            TransactionOutcome::Commit => self.commit(token.transaction_id),
            TransactionOutcome::Rollback => self.rollback(token.transaction_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{db, entity, obj};
    use super::*;
    use crate::types::TransactionInformation;
    use serde_json::json;
    use std::time::Duration;

    fn tx() -> TransactionInformation {
        TransactionInformation::new(Duration::from_secs(60))
    }

    #[test]
    fn commit_applies_staged_writes() {
        let db = db();
        db.put("users/2", None, obj(json!({"Name": "gone"})), entity("Users"), None)
            .unwrap();
        let tx = tx();
        db.put("users/1", None, obj(json!({"Name": "a"})), entity("Users"), Some(&tx))
            .unwrap();
        db.delete("users/2", None, Some(&tx)).unwrap();

        assert!(db.get("users/1", None).unwrap().is_none());
        assert!(db.get("users/1", Some(&tx)).unwrap().is_some());
        assert!(db.get("users/2", None).unwrap().is_some());
        assert!(db.has_transaction(tx.id).unwrap());

        db.commit(tx.id).unwrap();
        assert!(!db.has_transaction(tx.id).unwrap());
        assert_eq!(db.get("users/1", None).unwrap().unwrap().data["Name"], json!("a"));
        assert!(db.get("users/2", None).unwrap().is_none());
        assert_eq!(db.metrics().transactions_committed(), 1);

        db.commit(tx.id).unwrap();
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let db = db();
        let tx = tx();
        db.put("users/1", None, obj(json!({"Name": "a"})), JsonObject::new(), Some(&tx))
            .unwrap();
        db.rollback(tx.id).unwrap();
        assert!(!db.has_transaction(tx.id).unwrap());
        assert!(db.get("users/1", None).unwrap().is_none());
        db.put("users/1", None, obj(json!({"Name": "b"})), JsonObject::new(), None)
            .unwrap();
    }

    #[test]
    fn locked_document_rejects_other_writers() {
        let db = db();
        let tx = tx();
        db.put("users/1", None, obj(json!({"Name": "a"})), JsonObject::new(), Some(&tx))
            .unwrap();
        let err = db
            .put("users/1", None, obj(json!({"Name": "b"})), JsonObject::new(), None)
            .unwrap_err();
        assert!(err.is_concurrency());
    }

    #[test]
    fn promotion_moves_the_transaction() {
        let db = db();
        let local = tx();
        db.put("users/1", None, obj(json!({"Name": "a"})), JsonObject::new(), Some(&local))
            .unwrap();
        let token = db.promote_transaction(local.id).unwrap();
        assert_eq!(token.promoted_from, local.id);
        assert!(!db.has_transaction(local.id).unwrap());
        assert!(db.has_transaction(token.transaction_id).unwrap());

        assert!(db.prepare(token.transaction_id).unwrap());
        let recovery = recovery_information_key(token.transaction_id);
        let stored = db.storage().read(|a| a.attachment(&recovery)).unwrap().unwrap();
        assert_eq!(PropagationToken::from_bytes(&stored.data).unwrap(), token);

        db.complete_promoted(&token, TransactionOutcome::Commit).unwrap();
        assert!(db.get("users/1", None).unwrap().is_some());
        assert!(db.storage().read(|a| a.attachment(&recovery)).unwrap().is_none());
        assert!(db.promote_transaction(Uuid::new_v4()).is_err());
        assert!(!db.prepare(Uuid::new_v4()).unwrap());
    }
}
