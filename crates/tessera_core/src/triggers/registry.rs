//! Ordered trigger registration.

use super::{
    AttachmentDeleteTrigger, AttachmentPutTrigger, AttachmentReadTrigger, DeleteTrigger,
    IndexQueryTrigger, IndexUpdateTrigger, PutTrigger, ReadOperation, ReadTrigger,
    ReadVetoResult, VetoResult,
};
use crate::error::{CoreError, CoreResult};
use crate::types::{Attachment, JsonDocument, JsonObject, TransactionInformation, READ_VETO};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

thread_local! {
    static DISABLED_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether a [`DisableTriggersGuard`] is alive on this thread.
#[must_use]
pub fn triggers_disabled_for_current_thread() -> bool {
    DISABLED_DEPTH.with(|depth| depth.get() > 0)
}

/// Suppresses every trigger on the current thread while alive.
///
/// Guards nest; triggers come back when the last one drops.
#[must_use = "triggers are re-enabled as soon as the guard is dropped"]
pub struct DisableTriggersGuard {
    _not_send: PhantomData<*const ()>,
}

impl DisableTriggersGuard {
    /// Disables triggers on this thread.
    pub fn new() -> Self {
        DISABLED_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for DisableTriggersGuard {
    fn drop(&mut self) {
        DISABLED_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

impl fmt::Debug for DisableTriggersGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DisableTriggersGuard")
    }
}

/// Operation kind a trigger is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TriggerKind {
    /// [`PutTrigger`]
    Put,
    /// [`DeleteTrigger`]
    Delete,
    /// [`ReadTrigger`]
    Read,
    /// [`AttachmentPutTrigger`]
    AttachmentPut,
    /// [`AttachmentDeleteTrigger`]
    AttachmentDelete,
    /// [`AttachmentReadTrigger`]
    AttachmentRead,
    /// [`IndexUpdateTrigger`]
    IndexUpdate,
    /// [`IndexQueryTrigger`]
    IndexQuery,
}

/// Statistics entry for one registered trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInfo {
    /// Trigger name.
    pub name: String,
    /// Operation kind.
    pub kind: TriggerKind,
}

mod sealed {
    pub trait Sealed {}
}

/// Trigger trait objects that have a list in the registry.
pub trait TriggerSlot: sealed::Sealed + Send + Sync {
    /// Kind reported for this list.
    const KIND: TriggerKind;

    /// The list holding triggers of this kind.
    fn slot(registry: &TriggerRegistry) -> &RwLock<Vec<(u64, Arc<Self>)>>;

    /// Name of one trigger.
    fn trigger_name(trigger: &Self) -> String;
}

macro_rules! trigger_slot {
    ($trait:ident, $field:ident, $kind:ident) => {
        impl sealed::Sealed for dyn $trait {}

        impl TriggerSlot for dyn $trait {
            const KIND: TriggerKind = TriggerKind::$kind;

            fn slot(registry: &TriggerRegistry) -> &RwLock<Vec<(u64, Arc<Self>)>> {
                &registry.$field
            }

            fn trigger_name(trigger: &Self) -> String {
                trigger.name().to_string()
            }
        }
    };
}

trigger_slot!(PutTrigger, put, Put);
trigger_slot!(DeleteTrigger, delete, Delete);
trigger_slot!(ReadTrigger, read, Read);
trigger_slot!(AttachmentPutTrigger, attachment_put, AttachmentPut);
trigger_slot!(AttachmentDeleteTrigger, attachment_delete, AttachmentDelete);
trigger_slot!(AttachmentReadTrigger, attachment_read, AttachmentRead);
trigger_slot!(IndexUpdateTrigger, index_update, IndexUpdate);
trigger_slot!(IndexQueryTrigger, index_query, IndexQuery);

/// Handle returned by [`TriggerRegistry::register`].
pub struct TriggerHandle<K: ?Sized> {
    id: u64,
    _kind: PhantomData<fn() -> Box<K>>,
}

impl<K: ?Sized> Clone for TriggerHandle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: ?Sized> Copy for TriggerHandle<K> {}

impl<K: ?Sized + TriggerSlot> fmt::Debug for TriggerHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerHandle")
            .field("id", &self.id)
            .field("kind", &K::KIND)
            .finish()
    }
}

/// Every registered trigger, by kind, in registration order.
#[derive(Default)]
pub struct TriggerRegistry {
    next_id: AtomicU64,
    put: RwLock<Vec<(u64, Arc<dyn PutTrigger>)>>,
    delete: RwLock<Vec<(u64, Arc<dyn DeleteTrigger>)>>,
    read: RwLock<Vec<(u64, Arc<dyn ReadTrigger>)>>,
    attachment_put: RwLock<Vec<(u64, Arc<dyn AttachmentPutTrigger>)>>,
    attachment_delete: RwLock<Vec<(u64, Arc<dyn AttachmentDeleteTrigger>)>>,
    attachment_read: RwLock<Vec<(u64, Arc<dyn AttachmentReadTrigger>)>>,
    index_update: RwLock<Vec<(u64, Arc<dyn IndexUpdateTrigger>)>>,
    index_query: RwLock<Vec<(u64, Arc<dyn IndexQueryTrigger>)>>,
}

impl TriggerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a trigger to the list of its kind.
    ///
    /// ```rust,ignore
    /// let handle = registry.register::<dyn PutTrigger>(Arc::new(NoSystemWrites));
    /// registry.unregister(handle);
    /// ```
    pub fn register<K: TriggerSlot + ?Sized>(&self, trigger: Arc<K>) -> TriggerHandle<K> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        K::slot(self).write().push((id, trigger));
        TriggerHandle {
            id,
            _kind: PhantomData,
        }
    }

    /// Removes a trigger. Returns `false` if it was already removed.
    pub fn unregister<K: TriggerSlot + ?Sized>(&self, handle: TriggerHandle<K>) -> bool {
        let mut list = K::slot(self).write();
        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        list.len() != before
    }

    /// Triggers of one kind that should run now: empty while triggers are
    /// disabled on this thread.
    #[must_use]
    pub fn active<K: TriggerSlot + ?Sized>(&self) -> Vec<Arc<K>> {
        if triggers_disabled_for_current_thread() {
            return Vec::new();
        }
        K::slot(self)
            .read()
            .iter()
            .map(|(_, t)| Arc::clone(t))
            .collect()
    }

    /// Name and kind of every registered trigger.
    #[must_use]
    pub fn trigger_infos(&self) -> Vec<TriggerInfo> {
        fn collect<K: TriggerSlot + ?Sized>(registry: &TriggerRegistry, out: &mut Vec<TriggerInfo>) {
            out.extend(K::slot(registry).read().iter().map(|(_, t)| TriggerInfo {
                name: K::trigger_name(t),
                kind: K::KIND,
            }));
        }

        let mut infos = Vec::new();
        collect::<dyn PutTrigger>(self, &mut infos);
        collect::<dyn DeleteTrigger>(self, &mut infos);
        collect::<dyn ReadTrigger>(self, &mut infos);
        collect::<dyn AttachmentPutTrigger>(self, &mut infos);
        collect::<dyn AttachmentDeleteTrigger>(self, &mut infos);
        collect::<dyn AttachmentReadTrigger>(self, &mut infos);
        collect::<dyn IndexUpdateTrigger>(self, &mut infos);
        collect::<dyn IndexQueryTrigger>(self, &mut infos);
        infos
    }

    /// Polls `allow_put` in order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Veto`] for the first denial.
    pub fn check_put(
        &self,
        key: &str,
        data: &JsonObject,
        metadata: &JsonObject,
        tx: Option<&TransactionInformation>,
    ) -> CoreResult<()> {
        for trigger in self.active::<dyn PutTrigger>() {
            if let VetoResult::Deny(reason) = trigger.allow_put(key, data, metadata, tx) {
                return Err(vetoed("put", key, trigger.name(), reason));
            }
        }
        Ok(())
    }

    /// Polls `allow_delete` in order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Veto`] for the first denial.
    pub fn check_delete(&self, key: &str, tx: Option<&TransactionInformation>) -> CoreResult<()> {
        for trigger in self.active::<dyn DeleteTrigger>() {
            if let VetoResult::Deny(reason) = trigger.allow_delete(key, tx) {
                return Err(vetoed("delete", key, trigger.name(), reason));
            }
        }
        Ok(())
    }

    /// Polls attachment `allow_put` in order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Veto`] for the first denial.
    pub fn check_attachment_put(&self, key: &str, data: &[u8], metadata: &JsonObject) -> CoreResult<()> {
        for trigger in self.active::<dyn AttachmentPutTrigger>() {
            if let VetoResult::Deny(reason) = trigger.allow_put(key, data, metadata) {
                return Err(vetoed("put", key, trigger.name(), reason));
            }
        }
        Ok(())
    }

    /// Polls attachment `allow_delete` in order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Veto`] for the first denial.
    pub fn check_attachment_delete(&self, key: &str) -> CoreResult<()> {
        for trigger in self.active::<dyn AttachmentDeleteTrigger>() {
            if let VetoResult::Deny(reason) = trigger.allow_delete(key) {
                return Err(vetoed("delete", key, trigger.name(), reason));
            }
        }
        Ok(())
    }

    /// Runs the read triggers over a document.
    ///
    /// Returns `None` when a trigger ignores it, a redacted placeholder when
    /// one denies it, and otherwise the document after every `on_read`.
    #[must_use]
    pub fn process_read(
        &self,
        mut doc: JsonDocument,
        operation: ReadOperation,
        tx: Option<&TransactionInformation>,
    ) -> Option<JsonDocument> {
        let triggers = self.active::<dyn ReadTrigger>();
        for trigger in &triggers {
            match trigger.allow_read(&doc.key, &doc.metadata, operation, tx) {
                ReadVetoResult::Allowed => {}
                ReadVetoResult::Ignore => return None,
                ReadVetoResult::Deny(reason) => {
                    doc.data = JsonObject::new();
                    doc.metadata = read_veto(trigger.name(), &reason);
                    return Some(doc);
                }
            }
        }
        for trigger in &triggers {
            trigger.on_read(&doc.key, &mut doc.data, &mut doc.metadata, operation, tx);
        }
        Some(doc)
    }

    /// Runs the attachment read triggers. Deny empties the content and sets
    /// the size to zero.
    #[must_use]
    pub fn process_attachment_read(
        &self,
        mut attachment: Attachment,
        operation: ReadOperation,
    ) -> Option<Attachment> {
        let triggers = self.active::<dyn AttachmentReadTrigger>();
        for trigger in &triggers {
            match trigger.allow_read(&attachment.key, &attachment.data, &attachment.metadata, operation) {
                ReadVetoResult::Allowed => {}
                ReadVetoResult::Ignore => return None,
                ReadVetoResult::Deny(reason) => {
                    attachment.data.clear();
                    attachment.size = 0;
                    attachment.metadata = read_veto(trigger.name(), &reason);
                    return Some(attachment);
                }
            }
        }
        for trigger in &triggers {
            trigger.on_read(&mut attachment, operation);
        }
        Some(attachment)
    }
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("triggers", &self.trigger_infos())
            .finish()
    }
}

fn vetoed(operation: &str, key: &str, trigger: &str, reason: String) -> CoreError {
    debug!(operation, key, trigger, %reason, "operation vetoed");
    CoreError::veto(operation, trigger, reason)
}

fn read_veto(trigger: &str, reason: &str) -> JsonObject {
    let mut metadata = JsonObject::new();
    metadata.insert(
        READ_VETO.to_string(),
        json!({ "Reason": reason, "Trigger": trigger }),
    );
    metadata
}

/// Reason and trigger of a redacted document, if it was redacted.
#[must_use]
pub fn read_veto_of(metadata: &JsonObject) -> Option<(&str, &str)> {
    let veto = metadata.get(READ_VETO)?;
    Some((
        veto.get("Reason").and_then(Value::as_str)?,
        veto.get("Trigger").and_then(Value::as_str)?,
    ))
}
