//! # Tessera Core
//!
//! An embeddable document database.
//!
//! Documents are JSON objects stored under a string key, each carrying
//! metadata and an [`Etag`] that orders every write. Around them this
//! crate provides:
//!
//! - optimistic concurrency, patches and atomic command batches
//! - document transactions with staging, promotion and two-phase commit
//! - static attachments with their own etags
//! - map and map/reduce indexes kept up to date by background workers
//! - Lucene-style queries over those indexes, with staleness reporting
//! - triggers that veto, rewrite or observe every operation
//! - a write-ahead log, checkpoints, backup and restore
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_core::{Database, IndexDefinition, IndexQuery};
//!
//! let db = Database::open_in_memory()?;
//! db.put_index("Users/ByName", IndexDefinition::new().from_entity("Users").map_field("Name", "Name"))?;
//! db.put("users/1", None, body, metadata, None)?;
//! let result = db.query("Users/ByName", IndexQuery::new("Name:oren"))?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod commands;
pub mod config;
pub mod database;
pub mod dir;
pub mod error;
pub mod etag;
pub mod index;
pub mod manifest;
pub mod patch;
pub mod query;
pub mod stats;
pub mod storage;
pub mod tasks;
pub mod transactions;
pub mod triggers;
pub mod types;
pub mod wal;
pub mod work;

pub use commands::{BatchResult, Command};
pub use config::Config;
pub use database::{BackupState, BackupStatus, Database, DatabaseBuilder, NamedIndexDefinition};
pub use error::{CoreError, CoreResult};
pub use etag::Etag;
pub use index::{
    AggregateDefinition, AggregateOp, FieldIndexing, FieldStorage, IndexDefinition,
    SuggestionQuery, SuggestionQueryResult,
};
pub use patch::{PatchCommandType, PatchRequest};
pub use query::{IndexQuery, QueryDocumentIds, QueryResult, SortedField};
pub use stats::{DatabaseStatistics, DatabaseStats};
pub use storage::BackupMetadata;
pub use transactions::{PropagationToken, TransactionOutcome};
pub use triggers::{ReadOperation, ReadVetoResult, VetoResult};
pub use types::{
    Attachment, AttachmentInformation, JsonDocument, JsonDocumentMetadata, JsonObject,
    PatchResult, PutResult, TransactionInformation,
};

/// Version of the engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
