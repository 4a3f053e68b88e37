//! # Tessera Testkit
//!
//! Shared test support for the Tessera crates: throwaway databases
//! (memory or file), JSON document helpers, proptest strategies for keys
//! and documents, and multi-threaded load drivers. The end-to-end
//! scenarios live in `tests/`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_testkit::prelude::*;
//!
//! #[test]
//! fn user_round_trip() {
//!     with_temp_db(|db| {
//!         db.put("users/1", None, obj(json!({"Name": "Ann"})), entity("Users"), None)
//!             .unwrap();
//!         assert!(db.get("users/1", None).unwrap().is_some());
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Everything a test usually needs.
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
