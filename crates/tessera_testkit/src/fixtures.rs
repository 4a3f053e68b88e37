//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tessera_core::{Config, CoreResult, Database, DatabaseBuilder, IndexQuery, JsonObject};

/// Configuration for tests: no background workers, no fsync.
pub fn test_config() -> Config {
    Config::default()
        .background_workers(false)
        .sync_on_commit(false)
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    config: Config,
    temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self::memory_with(test_config())
    }

    /// Creates an in-memory test database with a configuration.
    pub fn memory_with(config: Config) -> Self {
        Self {
            db: DatabaseBuilder::new()
                .config(config.clone())
                .open_in_memory()
                .expect("Failed to open in-memory database"),
            config,
            temp_dir: None,
        }
    }

    /// Creates a new file-based test database.
    pub fn file() -> Self {
        Self::file_with(test_config())
    }

    /// Creates a file-based test database with a configuration.
    pub fn file_with(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open_with_config(&temp_dir.path().join("db"), config.clone())
            .expect("Failed to open file database");
        Self {
            db,
            config,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("db"))
    }

    /// Disposes the database and opens it again from its directory.
    ///
    /// # Panics
    ///
    /// Panics for in-memory databases.
    pub fn reopen(self) -> Self {
        let Self {
            db,
            config,
            temp_dir,
        } = self;
        let temp_dir = temp_dir.expect("Only file databases can be reopened");
        db.dispose().expect("Failed to dispose database");
        drop(db);
        let db = Database::open_with_config(&temp_dir.path().join("db"), config.clone())
            .expect("Failed to reopen database");
        Self {
            db,
            config,
            temp_dir: Some(temp_dir),
        }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use tessera_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         assert!(db.get("users/1", None).unwrap().is_none());
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file-based database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("File database should have a path");
    f(&test_db.db, &path)
}

/// Brings an index up to date and reports whether it is fresh.
///
/// Runs the background work inline first, which is all a database opened
/// with [`test_config`] needs, then waits for the workers of a database
/// that runs them.
pub fn wait_for_non_stale(db: &Database, index: &str, timeout: Duration) -> CoreResult<bool> {
    if !db.config().background_workers {
        db.run_background_work()?;
    }
    let result = db.query(
        index,
        IndexQuery::new("").page(0, 0).wait_for_non_stale_results(timeout),
    )?;
    Ok(!result.is_stale)
}

/// Converts a JSON literal into a document body.
///
/// # Panics
///
/// Panics if the value is not an object.
pub fn obj(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Serializes a value into a document body.
///
/// # Panics
///
/// Panics if the value does not serialize to an object.
pub fn to_object<T: Serialize>(value: &T) -> JsonObject {
    obj(serde_json::to_value(value).expect("Failed to serialize document"))
}

/// Metadata naming the entity of a document.
pub fn entity(name: &str) -> JsonObject {
    let mut metadata = JsonObject::new();
    metadata.insert("Entity-Name".into(), Value::String(name.into()));
    metadata
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use serde_json::json;

    /// Creates a database with `count` user documents, `users/1` onwards,
    /// named `user-N` and aged `20 + N % 50`.
    pub fn populated_users(count: usize) -> TestDatabase {
        let test_db = TestDatabase::memory();
        for i in 1..=count {
            test_db
                .put(
                    &format!("users/{i}"),
                    None,
                    obj(json!({ "Name": format!("user-{i}"), "Age": 20 + i % 50 })),
                    entity("Users"),
                    None,
                )
                .expect("Failed to put document");
        }
        test_db
    }
}
