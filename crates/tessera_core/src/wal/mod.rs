//! Write-ahead log.
//!
//! Every storage batch is written to the log as `Begin`, one `Mutation`
//! per change and `Commit`, and flushed before the change is applied to
//! the in-memory tables. A checkpoint writes the tables to the snapshot
//! and clears the log.
//!
//! ## Record Format
//!
//! ```text
//! | magic "TWAL" (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! - A truncated header or payload at the end of the log is a crash
//!   mid-write: it ends the log, and its batch is not replayed.
//! - A CRC mismatch, bad magic, unknown type or future version is
//!   corruption and fails the open.
//! - Only batches with a `Commit` record are replayed, in log order.

mod iterator;
mod record;
mod writer;

pub use iterator::{StreamingRecovery, WalRecordIterator};
pub use record::{compute_crc32, BatchId, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
pub use writer::WalManager;
