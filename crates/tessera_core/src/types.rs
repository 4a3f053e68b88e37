//! Core type definitions shared across the engine.

use crate::etag::Etag;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A JSON object, used for document bodies and metadata.
pub type JsonObject = Map<String, Value>;

/// Metadata key naming the entity a document belongs to.
pub const ENTITY_NAME: &str = "Entity-Name";

/// Metadata key set on documents redacted by a read trigger.
pub const READ_VETO: &str = "Read-Veto";

/// Metadata key holding the last modification time (ms since epoch).
pub const LAST_MODIFIED: &str = "Last-Modified";

/// Attachment key prefix under which transaction recovery data lives.
pub const RECOVERY_INFORMATION_PREFIX: &str = "transactions/recoveryInformation/";

/// Document key holding the status of the running backup.
pub const BACKUP_STATUS_KEY: &str = "Tessera/Backup/Status";

/// Returns the current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Returns the attachment key holding recovery information for `tx`.
#[must_use]
pub fn recovery_information_key(tx: Uuid) -> String {
    format!("{RECOVERY_INFORMATION_PREFIX}{tx}")
}

/// Identifies the transaction an operation runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionInformation {
    /// Transaction id.
    pub id: Uuid,
    /// How long the staged operations live before they are discarded.
    pub timeout: Duration,
}

impl TransactionInformation {
    /// Creates transaction information with a fresh id.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            timeout,
        }
    }

    /// Creates transaction information for an existing id.
    #[must_use]
    pub fn with_id(id: Uuid, timeout: Duration) -> Self {
        Self { id, timeout }
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonDocument {
    /// Key with its original casing.
    pub key: String,
    /// Document body.
    pub data: JsonObject,
    /// Document metadata.
    pub metadata: JsonObject,
    /// Etag of the last write.
    pub etag: Etag,
    /// Time of the last write, ms since epoch.
    pub last_modified_ms: u64,
    /// Set when another transaction holds an uncommitted change to this
    /// document and the committed version was returned instead.
    #[serde(default)]
    pub non_authoritative_information: bool,
}

impl JsonDocument {
    /// Returns the metadata part alone.
    #[must_use]
    pub fn to_metadata(&self) -> JsonDocumentMetadata {
        JsonDocumentMetadata {
            key: self.key.clone(),
            metadata: self.metadata.clone(),
            etag: self.etag,
            last_modified_ms: self.last_modified_ms,
            non_authoritative_information: self.non_authoritative_information,
        }
    }

    /// Returns the entity name recorded in the metadata, if any.
    #[must_use]
    pub fn entity_name(&self) -> Option<&str> {
        self.metadata.get(ENTITY_NAME).and_then(Value::as_str)
    }

    /// Renders the document as a single JSON object whose `@metadata`
    /// property carries the key, etag and modification time.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut metadata = self.metadata.clone();
        metadata.insert("@id".into(), Value::String(self.key.clone()));
        metadata.insert("@etag".into(), Value::String(self.etag.to_string()));
        metadata.insert(LAST_MODIFIED.into(), Value::from(self.last_modified_ms));
        if self.non_authoritative_information {
            metadata.insert("Non-Authoritative-Information".into(), Value::Bool(true));
        }

        let mut body = self.data.clone();
        body.insert("@metadata".into(), Value::Object(metadata));
        Value::Object(body)
    }
}

/// Document metadata without the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonDocumentMetadata {
    /// Key with its original casing.
    pub key: String,
    /// Document metadata.
    pub metadata: JsonObject,
    /// Etag of the last write.
    pub etag: Etag,
    /// Time of the last write, ms since epoch.
    pub last_modified_ms: u64,
    /// See [`JsonDocument::non_authoritative_information`].
    #[serde(default)]
    pub non_authoritative_information: bool,
}

/// A stored binary attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Key with its original casing.
    pub key: String,
    /// Content.
    pub data: Vec<u8>,
    /// Attachment metadata.
    pub metadata: JsonObject,
    /// Etag of the last write.
    pub etag: Etag,
    /// Content length in bytes.
    pub size: u64,
}

impl Attachment {
    /// Returns the listing form of the attachment.
    #[must_use]
    pub fn to_information(&self) -> AttachmentInformation {
        AttachmentInformation {
            key: self.key.clone(),
            metadata: self.metadata.clone(),
            etag: self.etag,
            size: self.size,
        }
    }
}

/// Attachment listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentInformation {
    /// Key with its original casing.
    pub key: String,
    /// Attachment metadata.
    pub metadata: JsonObject,
    /// Etag of the last write.
    pub etag: Etag,
    /// Content length in bytes.
    pub size: u64,
}

/// Outcome of a successful put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResult {
    /// The key the document was stored under.
    pub key: String,
    /// The etag assigned by the put.
    pub etag: Etag,
}

/// Outcome of a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchResult {
    /// No document with the key exists.
    DocumentDoesNotExist,
    /// The document was patched and stored.
    Patched,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> JsonDocument {
        let mut metadata = JsonObject::new();
        metadata.insert(ENTITY_NAME.into(), json!("Users"));
        JsonDocument {
            key: "users/1".into(),
            data: json!({"name": "Ann"}).as_object().cloned().unwrap(),
            metadata,
            etag: Etag::new(1, 5),
            last_modified_ms: 42,
            non_authoritative_information: false,
        }
    }

    #[test]
    fn entity_name_from_metadata() {
        assert_eq!(sample().entity_name(), Some("Users"));
    }

    #[test]
    fn to_json_embeds_metadata() {
        let doc = sample();
        let json = doc.to_json();
        assert_eq!(json["name"], "Ann");
        assert_eq!(json["@metadata"]["@id"], "users/1");
        assert_eq!(json["@metadata"]["@etag"], Etag::new(1, 5).to_string());
        assert_eq!(json["@metadata"]["Entity-Name"], "Users");
    }

    #[test]
    fn recovery_key_uses_prefix() {
        let id = Uuid::nil();
        assert_eq!(
            recovery_information_key(id),
            "transactions/recoveryInformation/00000000-0000-0000-0000-000000000000"
        );
    }
}
