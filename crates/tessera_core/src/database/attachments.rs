//! Attachment reads and writes.

use super::Database;
use crate::error::{CoreError, CoreResult};
use crate::etag::Etag;
use crate::triggers::{AttachmentDeleteTrigger, AttachmentPutTrigger, ReadOperation};
use crate::types::{Attachment, AttachmentInformation, JsonObject};
use tracing::debug;

/// Longest attachment key, in UTF-16 bytes, exclusive.
pub const MAX_ATTACHMENT_KEY_BYTES: usize = 255;

impl Database {
    /// Stores an attachment, returning its new etag.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` for keys of 255 UTF-16 bytes or more, `Veto` if
    /// a trigger denies the put and `Concurrency` on an etag mismatch.
    pub fn put_static(
        &self,
        key: &str,
        etag: Option<Etag>,
        mut data: Vec<u8>,
        mut metadata: JsonObject,
    ) -> CoreResult<Etag> {
        self.ensure_open()?;
        let utf16_bytes = key.encode_utf16().count() * 2;
        if utf16_bytes >= MAX_ATTACHMENT_KEY_BYTES {
            return Err(CoreError::invalid_key(
                key,
                format!(
                    "attachment key is {utf16_bytes} bytes in UTF-16, the limit is {}",
                    MAX_ATTACHMENT_KEY_BYTES - 1
                ),
            ));
        }

        let new_etag = self
            .storage()
            .batch(|actions| {
                let triggers = &self.env.triggers;
                triggers.check_attachment_put(key, &data, &metadata)?;
                let put_triggers = triggers.active::<dyn AttachmentPutTrigger>();
                for trigger in &put_triggers {
                    trigger.on_put(key, &mut data, &mut metadata);
                }

                let new_etag = actions.add_attachment(key, etag, data.clone(), metadata.clone())?;

                for trigger in &put_triggers {
                    trigger.after_put(key, &data, &metadata, new_etag);
                }
                if !put_triggers.is_empty() {
                    let key = key.to_string();
                    let (data, metadata) = (data.clone(), metadata.clone());
                    actions.on_commit(move || {
                        for trigger in &put_triggers {
                            trigger.after_commit(&key, &data, &metadata, new_etag);
                        }
                    })?;
                }
                Ok(new_etag)
            })
            .inspect_err(|_| self.stats.record_error())?;
        self.stats.record_attachment_put();
        debug!(key, etag = %new_etag, "attachment stored");
        Ok(new_etag)
    }

    /// Reads an attachment through the attachment read triggers. A denied
    /// attachment comes back empty with size 0.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn get_static(&self, key: &str) -> CoreResult<Option<Attachment>> {
        let attachment = self.storage().read(|actions| actions.attachment(key))?;
        self.stats.record_attachment_read();
        Ok(attachment.and_then(|a| {
            self.env
                .triggers
                .process_attachment_read(a, ReadOperation::Load)
        }))
    }

    /// Deletes an attachment. A missing attachment is not an error; the
    /// etag is checked only when it exists.
    ///
    /// # Errors
    ///
    /// Returns `Veto` if a trigger denies the delete and `Concurrency` on
    /// an etag mismatch.
    pub fn delete_static(&self, key: &str, etag: Option<Etag>) -> CoreResult<()> {
        self.ensure_open()?;
        let deleted = self
            .storage()
            .batch(|actions| {
                let triggers = &self.env.triggers;
                triggers.check_attachment_delete(key)?;
                let delete_triggers = triggers.active::<dyn AttachmentDeleteTrigger>();
                for trigger in &delete_triggers {
                    trigger.on_delete(key);
                }

                let deleted = actions.delete_attachment(key, etag)?;

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
                Ok(deleted)
            })
            .inspect_err(|_| self.stats.record_error())?;
        if deleted {
            self.stats.record_attachment_delete();
            debug!(key, "attachment deleted");
        }
        Ok(())
    }

    /// A page of attachment listings: after `etag` oldest first, or without
    /// an etag newest first.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn get_attachments(
        &self,
        start: usize,
        page_size: usize,
        etag: Option<Etag>,
    ) -> CoreResult<Vec<AttachmentInformation>> {
        let attachments = self
            .storage()
            .read(|actions| actions.attachments(start, page_size, etag))?;
        Ok(attachments.iter().map(Attachment::to_information).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::db;
    use super::*;
    use crate::triggers::{AttachmentReadTrigger, ReadVetoResult, VetoResult};
    use std::sync::Arc;

    #[test]
    fn put_get_delete_static() {
        let db = db();
        let etag = db.put_static("images/1", None, vec![1, 2, 3], JsonObject::new()).unwrap();

        let attachment = db.get_static("IMAGES/1").unwrap().unwrap();
        assert_eq!(attachment.data, vec![1, 2, 3]);
        assert_eq!(attachment.size, 3);
        assert_eq!(attachment.etag, etag);

        let newer = db.put_static("images/1", Some(etag), vec![4], JsonObject::new()).unwrap();
        assert!(db
            .put_static("images/1", Some(etag), vec![5], JsonObject::new())
            .unwrap_err()
            .is_concurrency());

        assert!(db.delete_static("images/1", Some(etag)).unwrap_err().is_concurrency());
        db.delete_static("images/1", Some(newer)).unwrap();
        assert!(db.get_static("images/1").unwrap().is_none());
        db.delete_static("images/1", Some(newer)).unwrap();
        assert_eq!(db.metrics().attachment_deletes(), 1);
    }

    #[test]
    fn key_length_is_measured_in_utf16_bytes() {
        let db = db();
        let longest = "a".repeat(127);
        db.put_static(&longest, None, vec![], JsonObject::new()).unwrap();
        assert!(matches!(
            db.put_static(&"a".repeat(128), None, vec![], JsonObject::new()),
            Err(CoreError::InvalidKey { .. })
        ));
        assert!(db
            .put_static(&"é".repeat(128), None, vec![], JsonObject::new())
            .is_err());
    }

    #[test]
    fn listing_pages_by_etag() {
        let db = db();
        let first = db.put_static("a", None, vec![1], JsonObject::new()).unwrap();
        db.put_static("b", None, vec![1, 2], JsonObject::new()).unwrap();
        db.put_static("c", None, vec![], JsonObject::new()).unwrap();

        let newest: Vec<_> = db
            .get_attachments(0, 2, None)
            .unwrap()
            .into_iter()
            .map(|a| a.key)
            .collect();
        assert_eq!(newest, vec!["c", "b"]);

        let after = db.get_attachments(0, 10, Some(first)).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].key, "b");
        assert_eq!(after[0].size, 2);
    }

    struct Vault;

    impl AttachmentPutTrigger for Vault {
        fn allow_put(&self, key: &str, _data: &[u8], _metadata: &JsonObject) -> VetoResult {
            if key.starts_with("vault/") {
                VetoResult::Deny("sealed".into())
            } else {
                VetoResult::Allowed
            }
        }
    }

    impl AttachmentReadTrigger for Vault {
        fn allow_read(
            &self,
            key: &str,
            _data: &[u8],
            _metadata: &JsonObject,
            _operation: ReadOperation,
        ) -> ReadVetoResult {
            if key.starts_with("private/") {
                ReadVetoResult::Deny("private".into())
            } else {
                ReadVetoResult::Allowed
            }
        }
    }

    #[test]
    fn attachment_triggers() {
        let db = db();
        let vault = Arc::new(Vault);
        db.register_trigger::<dyn AttachmentPutTrigger>(vault.clone());
        db.register_trigger::<dyn AttachmentReadTrigger>(vault);

        assert!(matches!(
            db.put_static("vault/1", None, vec![1], JsonObject::new()),
            Err(CoreError::Veto { .. })
        ));
        db.put_static("private/1", None, vec![1, 2], JsonObject::new()).unwrap();
        let redacted = db.get_static("private/1").unwrap().unwrap();
        assert!(redacted.data.is_empty());
        assert_eq!(redacted.size, 0);
        assert_eq!(redacted.metadata["Read-Veto"]["Trigger"], "Vault");
    }
}
