//! Logged changes to the tables.

use crate::error::{CoreError, CoreResult};
use crate::storage::tables::{IndexStats, MappedResult, PendingTransaction};
use crate::tasks::Task;
use crate::types::{Attachment, JsonDocument};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One change of a storage batch, written to the WAL as CBOR and applied
/// to the tables on commit and on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert or replace a document.
    PutDocument(JsonDocument),
    /// Remove a document.
    DeleteDocument {
        /// Document key.
        key: String,
    },
    /// Insert or replace an attachment.
    PutAttachment(Attachment),
    /// Remove an attachment.
    DeleteAttachment {
        /// Attachment key.
        key: String,
    },
    /// Insert or replace a pending transaction row.
    PutTransaction(PendingTransaction),
    /// Remove a pending transaction row.
    DeleteTransaction {
        /// Transaction id.
        id: Uuid,
    },
    /// Queue a task, merging with a compatible queued one.
    AddTask {
        /// The task.
        task: Task,
        /// When it was queued.
        added_ms: u64,
    },
    /// Remove tasks taken by a worker.
    RemoveTasks {
        /// Task ids.
        ids: Vec<u64>,
    },
    /// Insert or replace an index row.
    SetIndexStats(IndexStats),
    /// Remove an index row with its tasks and mapped results.
    DeleteIndex {
        /// Index name.
        name: String,
    },
    /// Replace the mapped results of one document.
    PutMappedResults {
        /// Index name.
        index: String,
        /// Document key.
        doc_key: String,
        /// The new results.
        results: Vec<MappedResult>,
    },
    /// Remove the mapped results of one document.
    DeleteMappedResults {
        /// Index name.
        index: String,
        /// Document key.
        doc_key: String,
    },
    /// Set an identity counter.
    SetIdentity {
        /// Identity name.
        name: String,
        /// New value.
        value: u64,
    },
}

impl Mutation {
    /// Encodes the mutation as CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Cbor`] if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf).map_err(CoreError::cbor)?;
        Ok(buf)
    }

    /// Decodes a mutation from CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalCorruption`] if the bytes are not a mutation.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| CoreError::wal_corruption(format!("undecodable mutation: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etag::Etag;
    use crate::types::JsonObject;
    use serde_json::json;

    #[test]
    fn document_survives_cbor() {
        let mut metadata = JsonObject::new();
        metadata.insert("Entity-Name".into(), json!("Users"));
        let mutation = Mutation::PutDocument(JsonDocument {
            key: "users/1".into(),
            data: json!({"name": "Ann", "age": 31, "tags": ["a", "b"], "ratio": 0.5})
                .as_object()
                .cloned()
                .unwrap(),
            metadata,
            etag: Etag::new(2, 9),
            last_modified_ms: 1_700_000_000_000,
            non_authoritative_information: false,
        });

        let decoded = Mutation::decode(&mutation.encode().unwrap()).unwrap();
        assert_eq!(decoded, mutation);
    }

    #[test]
    fn garbage_is_wal_corruption() {
        assert!(matches!(
            Mutation::decode(&[0xFF, 0x00, 0x13]),
            Err(CoreError::WalCorruption { .. })
        ));
    }
}
