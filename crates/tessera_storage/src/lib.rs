//! # Tessera Storage
//!
//! Byte-store backends for the Tessera document engine.
//!
//! A backend is an **opaque byte store**: the engine's write-ahead log,
//! table snapshots and index snapshots are each kept in one backend, and
//! the engine alone interprets their contents.
//!
//! Two operations shape the trait:
//!
//! - `append` + `flush`/`sync` for the log, which only ever grows until a
//!   checkpoint truncates it
//! - `replace`, which swaps the whole content at once, for snapshots that
//!   must never be observed half written
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - for in-memory databases and tests
//! - [`FileBackend`] - persistent storage through OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use tessera_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"hello");
//!
//! backend.replace(b"snapshot").unwrap();
//! assert_eq!(backend.read_all().unwrap(), b"snapshot");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
