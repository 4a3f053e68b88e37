//! Distributed transaction support.
//!
//! Staged operations live in storage under their transaction id (see
//! [`StorageActions::add_document_in_transaction`]). This module holds what
//! sits around them: tokens handed out when a local transaction is promoted,
//! the registry of promoted handles, and the repeated action that reaps
//! expired transactions.
//!
//! [`StorageActions::add_document_in_transaction`]:
//! crate::storage::StorageActions::add_document_in_transaction

use crate::error::{CoreError, CoreResult};
use crate::storage::TransactionalStorage;
use crate::types::{now_ms, recovery_information_key};
use crate::work::RepeatedAction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handed to the coordinator of a promoted transaction. It names the
/// distributed id the staged operations now live under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationToken {
    /// Distributed transaction id.
    pub transaction_id: Uuid,
    /// Local id the operations were staged under.
    pub promoted_from: Uuid,
    /// When the promotion happened (ms since epoch).
    pub issued_ms: u64,
    /// Lifetime of the promoted transaction.
    pub timeout: Duration,
}

impl PropagationToken {
    /// Encodes the token as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a CBOR error if encoding fails.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).map_err(CoreError::cbor)?;
        Ok(buf)
    }

    /// Decodes a token produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns a CBOR error if the bytes are not a token.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::de::from_reader(bytes).map_err(CoreError::cbor)
    }

    /// When the promoted transaction expires (ms since epoch).
    #[must_use]
    pub fn expires_at_ms(&self) -> u64 {
        let timeout = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        self.issued_ms.saturating_add(timeout)
    }
}

/// How a promoted transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionOutcome {
    /// Apply the staged operations.
    Commit,
    /// Discard them.
    Rollback,
}

/// State of a promoted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionState {
    /// Waiting for the coordinator.
    Active,
    /// Voted yes in the first phase.
    Prepared,
}

/// A promoted transaction the database still answers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotedTransaction {
    /// Token handed out on promotion.
    pub token: PropagationToken,
    /// Current state.
    pub state: PromotionState,
}

/// Promoted transactions keyed by their distributed id.
#[derive(Debug, Default)]
pub struct PromotedTransactions {
    handles: Mutex<HashMap<Uuid, PromotedTransaction>>,
}

impl PromotedTransactions {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a promotion.
    pub fn insert(&self, token: PropagationToken) {
        self.handles.lock().insert(
            token.transaction_id,
            PromotedTransaction {
                token,
                state: PromotionState::Active,
            },
        );
    }

    /// Marks a promoted transaction as prepared. Returns false if unknown.
    pub fn mark_prepared(&self, id: Uuid) -> bool {
        match self.handles.lock().get_mut(&id) {
            Some(handle) => {
                handle.state = PromotionState::Prepared;
                true
            }
            None => false,
        }
    }

    /// The handle for `id`.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<PromotedTransaction> {
        self.handles.lock().get(&id).copied()
    }

    /// Removes and returns the handle for `id`.
    pub fn complete(&self, id: Uuid) -> Option<PromotedTransaction> {
        self.handles.lock().remove(&id)
    }

    /// Drops handles whose token expired before `now`.
    pub fn remove_expired(&self, now: u64) -> Vec<Uuid> {
        let mut handles = self.handles.lock();
        let expired: Vec<Uuid> = handles
            .values()
            .filter(|h| h.token.expires_at_ms() <= now)
            .map(|h| h.token.transaction_id)
            .collect();
        for id in &expired {
            handles.remove(id);
        }
        expired
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns true if no transaction is promoted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

/// Deletes expired transactions and their recovery information.
pub struct TransactionReaper {
    storage: Arc<TransactionalStorage>,
    promoted: Arc<PromotedTransactions>,
    interval: Duration,
}

impl TransactionReaper {
    /// Creates a reaper running every `interval`.
    pub fn new(
        storage: Arc<TransactionalStorage>,
        promoted: Arc<PromotedTransactions>,
        interval: Duration,
    ) -> Self {
        Self {
            storage,
            promoted,
            interval,
        }
    }

    /// Reaps once. Returns the ids of the deleted transactions.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the reaping batch.
    pub fn reap(&self) -> CoreResult<Vec<Uuid>> {
        let now = now_ms();
        let expired = self.storage.batch(|actions| {
            let expired = actions.delete_expired_transactions(now)?;
            for id in &expired {
                actions.delete_attachment(&recovery_information_key(*id), None)?;
            }
            Ok(expired)
        })?;
        let promoted = self.promoted.remove_expired(now);
        if !expired.is_empty() || !promoted.is_empty() {
            info!(
                transactions = expired.len(),
                promoted = promoted.len(),
                "reaped expired transactions"
            );
        }
        Ok(expired)
    }
}

impl std::fmt::Debug for TransactionReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionReaper")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl RepeatedAction for TransactionReaper {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn is_valid(&self) -> bool {
        !self.storage.is_disposed()
    }

    fn execute(&self) {
        match self.reap() {
            Ok(_) => {}
            Err(CoreError::DatabaseClosed) => debug!("reaper skipped, storage closed"),
            Err(e) => warn!(error = %e, "failed to reap expired transactions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionInformation;
    use serde_json::json;

    fn body() -> crate::types::JsonObject {
        match json!({"Name": "x"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn token_bytes_round_trip() {
        let token = PropagationToken {
            transaction_id: Uuid::new_v4(),
            promoted_from: Uuid::new_v4(),
            issued_ms: 1_000,
            timeout: Duration::from_secs(5),
        };
        let back = PropagationToken::from_bytes(&token.to_bytes().unwrap()).unwrap();
        assert_eq!(back, token);
        assert_eq!(back.expires_at_ms(), 6_000);
        assert!(PropagationToken::from_bytes(b"junk").is_err());
    }

    #[test]
    fn registry_tracks_state_and_expiry() {
        let registry = PromotedTransactions::new();
        let live = PropagationToken {
            transaction_id: Uuid::new_v4(),
            promoted_from: Uuid::new_v4(),
            issued_ms: now_ms(),
            timeout: Duration::from_secs(60),
        };
        let stale = PropagationToken {
            issued_ms: 0,
            transaction_id: Uuid::new_v4(),
            ..live
        };
        registry.insert(live);
        registry.insert(stale);
        assert!(registry.mark_prepared(live.transaction_id));
        assert!(!registry.mark_prepared(Uuid::new_v4()));
        assert_eq!(
            registry.get(live.transaction_id).map(|h| h.state),
            Some(PromotionState::Prepared)
        );

        assert_eq!(registry.remove_expired(now_ms()), vec![stale.transaction_id]);
        assert_eq!(registry.len(), 1);
        assert!(registry.complete(live.transaction_id).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn reaper_deletes_expired_transactions_and_recovery_information() {
        let storage = Arc::new(TransactionalStorage::open_in_memory().unwrap());
        let expired = TransactionInformation::new(Duration::ZERO);
        let live = TransactionInformation::new(Duration::from_secs(60));
        storage
            .batch(|a| {
                a.add_document_in_transaction(&expired, "users/1", None, body(), Default::default())?;
                a.add_document_in_transaction(&live, "users/2", None, body(), Default::default())?;
                a.add_attachment(
                    &recovery_information_key(expired.id),
                    None,
                    vec![1],
                    Default::default(),
                )?;
                Ok(())
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let reaper = TransactionReaper::new(
            Arc::clone(&storage),
            Arc::new(PromotedTransactions::new()),
            Duration::from_secs(1),
        );
        assert_eq!(reaper.reap().unwrap(), vec![expired.id]);
        storage
            .read(|a| {
                assert!(a.transaction(expired.id)?.is_none());
                assert!(a.has_transaction(live.id)?);
                assert!(a.attachment(&recovery_information_key(expired.id))?.is_none());
                Ok(())
            })
            .unwrap();

        assert!(reaper.is_valid());
        storage.dispose().unwrap();
        assert!(!reaper.is_valid());
    }
}
