//! Trigger pipeline.
//!
//! Triggers observe, veto or rewrite storage operations. Each operation
//! kind has its own trait with no-op defaults, so an implementation only
//! overrides the hooks it cares about. Triggers are registered explicitly
//! on a [`TriggerRegistry`] and run in registration order.
//!
//! On the write path the first `Deny` aborts the operation with a
//! [`CoreError::Veto`](crate::CoreError::Veto). On the read path `Deny`
//! keeps a redacted placeholder while `Ignore` drops the item entirely.

mod registry;

pub use registry::{
    read_veto_of, triggers_disabled_for_current_thread, DisableTriggersGuard, TriggerHandle,
    TriggerInfo, TriggerKind, TriggerRegistry, TriggerSlot,
};

use crate::etag::Etag;
use crate::index::IndexEntry;
use crate::query::IndexQuery;
use crate::types::{Attachment, JsonObject, TransactionInformation};

/// Verdict of a write-path `allow_*` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VetoResult {
    /// The operation may proceed.
    Allowed,
    /// The operation is refused for the given reason.
    Deny(String),
}

/// Verdict of a read-path `allow_read` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadVetoResult {
    /// The item is returned.
    Allowed,
    /// The item is returned with its content removed and the reason in
    /// its metadata.
    Deny(String),
    /// The item is left out of the results.
    Ignore,
}

/// What a read is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadOperation {
    /// A direct load by key or a range read.
    Load,
    /// Hydration of query results.
    Query,
    /// Feeding the indexing worker.
    Index,
}

fn short_name(type_name: &str) -> &str {
    type_name.rsplit("::").next().unwrap_or(type_name)
}

/// Hooks around document puts.
pub trait PutTrigger: Send + Sync {
    /// Name reported in veto messages and statistics.
    fn name(&self) -> &str {
        short_name(std::any::type_name::<Self>())
    }

    /// Polled before the write.
    fn allow_put(
        &self,
        _key: &str,
        _data: &JsonObject,
        _metadata: &JsonObject,
        _tx: Option<&TransactionInformation>,
    ) -> VetoResult {
        VetoResult::Allowed
    }

    /// May rewrite the document before it is stored.
    fn on_put(
        &self,
        _key: &str,
        _data: &mut JsonObject,
        _metadata: &mut JsonObject,
        _tx: Option<&TransactionInformation>,
    ) {
    }

    /// Runs inside the batch after the write.
    fn after_put(&self, _key: &str, _data: &JsonObject, _metadata: &JsonObject, _etag: Etag) {}

    /// Runs once the batch has committed.
    fn after_commit(&self, _key: &str, _data: &JsonObject, _metadata: &JsonObject, _etag: Etag) {}
}

/// Hooks around document deletes.
pub trait DeleteTrigger: Send + Sync {
    /// Name reported in veto messages and statistics.
    fn name(&self) -> &str {
        short_name(std::any::type_name::<Self>())
    }

    /// Polled before the delete.
    fn allow_delete(&self, _key: &str, _tx: Option<&TransactionInformation>) -> VetoResult {
        VetoResult::Allowed
    }

    /// Runs before the document is removed.
    fn on_delete(&self, _key: &str, _tx: Option<&TransactionInformation>) {}

    /// Runs inside the batch after the delete.
    fn after_delete(&self, _key: &str) {}

    /// Runs once the batch has committed.
    fn after_commit(&self, _key: &str) {}
}

/// Hooks around document reads.
pub trait ReadTrigger: Send + Sync {
    /// Name reported in veto annotations and statistics.
    fn name(&self) -> &str {
        short_name(std::any::type_name::<Self>())
    }

    /// Polled before the document is handed out.
    fn allow_read(
        &self,
        _key: &str,
        _metadata: &JsonObject,
        _operation: ReadOperation,
        _tx: Option<&TransactionInformation>,
    ) -> ReadVetoResult {
        ReadVetoResult::Allowed
    }

    /// May rewrite an allowed document on its way out.
    fn on_read(
        &self,
        _key: &str,
        _data: &mut JsonObject,
        _metadata: &mut JsonObject,
        _operation: ReadOperation,
        _tx: Option<&TransactionInformation>,
    ) {
    }
}

/// Hooks around attachment puts.
pub trait AttachmentPutTrigger: Send + Sync {
    /// Name reported in veto messages and statistics.
    fn name(&self) -> &str {
        short_name(std::any::type_name::<Self>())
    }

    /// Polled before the write.
    fn allow_put(&self, _key: &str, _data: &[u8], _metadata: &JsonObject) -> VetoResult {
        VetoResult::Allowed
    }

    /// May rewrite the attachment before it is stored.
    fn on_put(&self, _key: &str, _data: &mut Vec<u8>, _metadata: &mut JsonObject) {}

    /// Runs inside the batch after the write.
    fn after_put(&self, _key: &str, _data: &[u8], _metadata: &JsonObject, _etag: Etag) {}

    /// Runs once the batch has committed.
    fn after_commit(&self, _key: &str, _data: &[u8], _metadata: &JsonObject, _etag: Etag) {}
}

/// Hooks around attachment deletes.
pub trait AttachmentDeleteTrigger: Send + Sync {
    /// Name reported in veto messages and statistics.
    fn name(&self) -> &str {
        short_name(std::any::type_name::<Self>())
    }

    /// Polled before the delete.
    fn allow_delete(&self, _key: &str) -> VetoResult {
        VetoResult::Allowed
    }

    /// Runs before the attachment is removed.
    fn on_delete(&self, _key: &str) {}

    /// Runs inside the batch after the delete.
    fn after_delete(&self, _key: &str) {}

    /// Runs once the batch has committed.
    fn after_commit(&self, _key: &str) {}
}

/// Hooks around attachment reads.
pub trait AttachmentReadTrigger: Send + Sync {
    /// Name reported in veto annotations and statistics.
    fn name(&self) -> &str {
        short_name(std::any::type_name::<Self>())
    }

    /// Polled before the attachment is handed out.
    fn allow_read(
        &self,
        _key: &str,
        _data: &[u8],
        _metadata: &JsonObject,
        _operation: ReadOperation,
    ) -> ReadVetoResult {
        ReadVetoResult::Allowed
    }

    /// May rewrite an allowed attachment on its way out.
    fn on_read(&self, _attachment: &mut Attachment, _operation: ReadOperation) {}
}

/// Receives the entry changes of one indexing pass over one index.
pub trait IndexUpdateBatcher: Send {
    /// An entry was removed from the index.
    fn on_index_entry_deleted(&mut self, _entry_key: &str) {}

    /// An entry was written to the index.
    fn on_index_entry_created(&mut self, _entry_key: &str, _entry: &IndexEntry) {}

    /// The pass is over.
    fn done(&mut self) {}
}

/// Observes index updates.
pub trait IndexUpdateTrigger: Send + Sync {
    /// Name reported in statistics.
    fn name(&self) -> &str {
        short_name(std::any::type_name::<Self>())
    }

    /// Starts a batcher for one pass over `index`, or `None` to skip it.
    fn create_batcher(&self, index: &str) -> Option<Box<dyn IndexUpdateBatcher>>;
}

/// Rewrites queries before they run.
pub trait IndexQueryTrigger: Send + Sync {
    /// Name reported in statistics.
    fn name(&self) -> &str {
        short_name(std::any::type_name::<Self>())
    }

    /// Adjusts the query sent to `index`.
    fn process_query(&self, index: &str, query: &mut IndexQuery);
}
