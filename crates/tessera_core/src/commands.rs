//! Commands executed together by [`Database::batch`](crate::Database::batch).

use crate::etag::Etag;
use crate::patch::PatchRequest;
use crate::types::{JsonObject, PatchResult};
use serde::{Deserialize, Serialize};

/// One write in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Method", rename_all = "UPPERCASE")]
pub enum Command {
    /// Store a document.
    Put {
        /// Document key; empty or ending in `/` to have one generated.
        key: String,
        /// Expected current etag.
        #[serde(default)]
        etag: Option<Etag>,
        /// Document body.
        document: JsonObject,
        /// Document metadata.
        #[serde(default)]
        metadata: JsonObject,
    },
    /// Remove a document.
    Delete {
        /// Document key.
        key: String,
        /// Expected current etag.
        #[serde(default)]
        etag: Option<Etag>,
    },
    /// Patch a document.
    Patch {
        /// Document key.
        key: String,
        /// Expected current etag.
        #[serde(default)]
        etag: Option<Etag>,
        /// Patch requests, applied in order.
        patches: Vec<PatchRequest>,
    },
}

impl Command {
    /// Document key the command targets.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } | Self::Patch { key, .. } => key,
        }
    }

    /// `PUT`, `DELETE` or `PATCH`.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Put { .. } => "PUT",
            Self::Delete { .. } => "DELETE",
            Self::Patch { .. } => "PATCH",
        }
    }

    /// Whether the command is a patch.
    #[must_use]
    pub fn is_patch(&self) -> bool {
        matches!(self, Self::Patch { .. })
    }

    /// Whether the command writes through the put path.
    #[must_use]
    pub fn writes_document(&self) -> bool {
        matches!(self, Self::Put { .. } | Self::Patch { .. })
    }
}

/// Outcome of one batch command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// `PUT`, `DELETE` or `PATCH`.
    pub method: String,
    /// Key the command ended up writing.
    pub key: String,
    /// New etag, absent for deletes and patches of missing documents.
    pub etag: Option<Etag>,
    /// Metadata written by a put.
    pub metadata: Option<JsonObject>,
    /// Outcome of a patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_result: Option<PatchResult>,
    /// Whether a delete removed a document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}
