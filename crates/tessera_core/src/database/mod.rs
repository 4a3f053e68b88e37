//! Database facade.
//!
//! [`Database`] ties storage, indexes, triggers and the background workers
//! together. The operations are split by surface: documents, attachments,
//! indexes, queries, transactions and maintenance each live in their own
//! submodule and extend the same type.

mod attachments;
mod builder;
mod documents;
mod indexes;
mod maintenance;
mod queries;
mod transactions;

pub use builder::DatabaseBuilder;
pub use indexes::NamedIndexDefinition;
pub use maintenance::{BackupState, BackupStatus, IdleHousekeeping};

use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult, ErrorAggregator};
use crate::index::{Index, IndexStorage};
use crate::stats::DatabaseStats;
use crate::storage::{IndexStats, TransactionalStorage};
use crate::transactions::{PromotedTransactions, TransactionReaper};
use crate::triggers::{DisableTriggersGuard, TriggerHandle, TriggerRegistry, TriggerSlot};
use crate::work::{self, BackgroundExecutor, WorkContext, WorkEnvironment};
use parking_lot::{Mutex, ReentrantMutex};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Identity that carries the etag base across restarts.
const ETAG_BASE_IDENTITY: &str = "tessera/etag";

/// An open document database.
///
/// # Opening a Database
///
/// ```rust,ignore
/// use tessera_core::Database;
/// use std::path::Path;
///
/// let db = Database::open(Path::new("my_database"))?;
/// let put = db.put("users/1", None, body, metadata, None)?;
/// db.dispose()?;
/// ```
///
/// For tests, use `Database::open_in_memory()`.
pub struct Database {
    env: Arc<WorkEnvironment>,
    promoted: Arc<PromotedTransactions>,
    put_serial: ReentrantMutex<()>,
    index_creation: Mutex<()>,
    stats: DatabaseStats,
    workers: Mutex<Vec<JoinHandle<()>>>,
    backup: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Database {
    /// Opens a database from a directory path with the default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another handle holds the directory, or
    /// the error that stopped recovery.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a database from a directory path.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        Self::open_with_triggers(path, config, TriggerRegistry::new())
    }

    /// Opens a fresh in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the background threads cannot be started.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_in_memory_with(Config::default(), TriggerRegistry::new())
    }

    pub(crate) fn open_with_triggers(
        path: &Path,
        config: Config,
        triggers: TriggerRegistry,
    ) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        if !config.create_if_missing && dir.is_new_database() {
            return Err(CoreError::invalid_format(
                "database does not exist and create_if_missing is false",
            ));
        }
        let definitions = dir.index_definitions_dir();
        let contents = dir.indexes_dir();

        let storage = TransactionalStorage::open(dir, &config)?;
        let indexes = match IndexStorage::open(definitions, contents) {
            Ok(indexes) => indexes,
            Err(e) => {
                let _ = storage.dispose();
                let _ = storage.release_directory();
                return Err(e);
            }
        };
        info!(path = %path.display(), indexes = indexes.len(), "opening database");
        Self::from_parts(storage, indexes, config, triggers)
    }

    pub(crate) fn open_in_memory_with(config: Config, triggers: TriggerRegistry) -> CoreResult<Self> {
        let storage = TransactionalStorage::open_in_memory()?;
        Self::from_parts(storage, IndexStorage::in_memory(), config, triggers)
    }

    fn from_parts(
        storage: TransactionalStorage,
        indexes: IndexStorage,
        config: Config,
        triggers: TriggerRegistry,
    ) -> CoreResult<Self> {
        let storage = Arc::new(storage);
        let context = Arc::new(WorkContext::new(&config));
        {
            let context = Arc::clone(&context);
            storage.set_commit_hook(Arc::new(move || context.notify_about_work()));
        }

        let base = storage.batch(|actions| actions.next_identity(ETAG_BASE_IDENTITY))?;
        storage.generator().set_base(base);
        debug!(base, "etag base derived");

        let indexes = Arc::new(indexes);
        reconcile_indexes(&storage, &indexes)?;

        let env = Arc::new(WorkEnvironment {
            storage: Arc::clone(&storage),
            indexes,
            triggers: Arc::new(triggers),
            context,
            executor: Arc::new(BackgroundExecutor::new(config.max_parallel_index_tasks)),
            config,
        });

        let db = Self {
            env,
            promoted: Arc::new(PromotedTransactions::new()),
            put_serial: ReentrantMutex::new(()),
            index_creation: Mutex::new(()),
            stats: DatabaseStats::new(),
            workers: Mutex::new(Vec::new()),
            backup: Mutex::new(None),
            disposed: AtomicBool::new(false),
        };

        db.env.executor.repeat(Arc::new(IdleHousekeeping::new(
            Arc::clone(&db.env.storage),
            Arc::clone(&db.env.indexes),
            db.env.config.idle_timeout,
            db.env.config.idle_check_interval,
        )))?;
        db.env.executor.repeat(Arc::new(TransactionReaper::new(
            Arc::clone(&db.env.storage),
            Arc::clone(&db.promoted),
            db.env.config.transaction_reap_interval,
        )))?;

        if db.env.config.background_workers {
            db.spin_background_workers()?;
        }
        Ok(db)
    }

    /// Database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.env.config
    }

    /// Operation counters.
    #[must_use]
    pub fn metrics(&self) -> &DatabaseStats {
        &self.stats
    }

    /// Registered triggers.
    #[must_use]
    pub fn triggers(&self) -> &TriggerRegistry {
        &self.env.triggers
    }

    /// Registers a trigger after every trigger of its kind.
    pub fn register_trigger<K: TriggerSlot + ?Sized>(&self, trigger: Arc<K>) -> TriggerHandle<K> {
        self.env.triggers.register(trigger)
    }

    /// Unregisters a trigger. Returns false if it was already gone.
    pub fn unregister_trigger<K: TriggerSlot + ?Sized>(&self, handle: TriggerHandle<K>) -> bool {
        self.env.triggers.unregister(handle)
    }

    /// Suspends every trigger on the calling thread until the guard drops.
    #[must_use]
    pub fn disable_all_triggers_for_current_thread(&self) -> DisableTriggersGuard {
        DisableTriggersGuard::new()
    }

    /// Id of the underlying store.
    #[must_use]
    pub fn id(&self) -> uuid::Uuid {
        self.env.storage.id()
    }

    /// Directory of the database, `None` in memory.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.env.storage.path()
    }

    /// Whether background work is queued.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn has_tasks(&self) -> CoreResult<bool> {
        self.env.storage.read(|actions| actions.has_tasks())
    }

    /// Number of queued tasks.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn approximate_task_count(&self) -> CoreResult<u64> {
        self.env.storage.read(|actions| actions.approximate_task_count())
    }

    /// Starts the indexing and reducing workers. Does nothing if they run.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn spin_background_workers(&self) -> CoreResult<()> {
        self.ensure_open()?;
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        self.env.context.resume();
        *workers = work::spawn_workers(&self.env)?;
        debug!("background workers started");
        Ok(())
    }

    /// Stops the workers and waits for them to exit.
    pub fn stop_background_workers(&self) {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        self.env.context.cancel();
        for handle in handles {
            if handle.join().is_err() {
                warn!("background worker panicked");
            }
        }
        debug!("background workers stopped");
    }

    /// Runs the indexing and reducing passes on the calling thread until
    /// both are idle. Useful when the background workers are off.
    ///
    /// # Errors
    ///
    /// Returns the first error of a pass.
    pub fn run_background_work(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.env.run_until_idle()
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_disposed() {
            Err(CoreError::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    /// Stops background work, flushes indexes and closes storage. Every
    /// step runs even if an earlier one fails. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Aggregate`] holding every failed step.
    pub fn dispose(&self) -> CoreResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut aggregator = ErrorAggregator::new("error when disposing the database");

        self.env.context.cancel();
        self.stop_background_workers();
        if let Some(backup) = self.backup.lock().take() {
            if backup.join().is_err() {
                aggregator.push(CoreError::invalid_operation("backup thread panicked"));
            }
        }
        self.env.executor.stop_repeaters();
        aggregator.execute(|| self.env.indexes.flush());
        aggregator.execute(|| self.env.storage.dispose());
        aggregator.execute(|| self.env.storage.release_directory());

        info!(path = ?self.path(), clean = aggregator.is_empty(), "database disposed");
        aggregator.into_result()
    }

    pub(crate) fn storage(&self) -> &Arc<TransactionalStorage> {
        &self.env.storage
    }

    pub(crate) fn index_storage(&self) -> &Arc<IndexStorage> {
        &self.env.indexes
    }
}

/// Brings the stats rows in line with the loaded indexes: drops rows of
/// unknown indexes, adds rows for definitions without one, and rebuilds
/// indexes whose contents do not match their row.
fn reconcile_indexes(storage: &TransactionalStorage, indexes: &IndexStorage) -> CoreResult<()> {
    storage.batch(|actions| {
        for stats in actions.all_index_stats()? {
            if indexes.get(&stats.name).is_none() {
                warn!(index = %stats.name, "removing stats of unknown index");
                actions.delete_index(&stats.name)?;
            }
        }
        for index in indexes.all() {
            match actions.index_stats(index.name())? {
                None => actions.add_index(index.name(), index.compiled().is_map_reduce())?,
                Some(stats) if !contents_match(&index, &stats) => {
                    info!(index = %index.name(), "index contents out of date, rebuilding");
                    actions.delete_index(index.name())?;
                    actions.add_index(index.name(), index.compiled().is_map_reduce())?;
                    actions.on_commit(move || index.reset())?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    })
}

fn contents_match(index: &Index, stats: &IndexStats) -> bool {
    let applied = index.applied();
    applied.indexed == stats.last_indexed_etag && applied.reduced == stats.last_reduced_etag
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path())
            .field("indexes", &self.env.indexes.names())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(error = %e, "dispose on drop failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::JsonObject;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    pub(crate) fn quiet_config() -> Config {
        Config::default()
            .background_workers(false)
            .sync_on_commit(false)
    }

    pub(crate) fn db() -> Database {
        Database::open_in_memory_with(quiet_config(), TriggerRegistry::new()).unwrap()
    }

    pub(crate) fn obj(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    pub(crate) fn entity(name: &str) -> JsonObject {
        obj(json!({ "Entity-Name": name }))
    }

    #[test]
    fn open_in_memory_and_dispose_twice() {
        let db = db();
        assert!(!db.is_disposed());
        db.dispose().unwrap();
        db.dispose().unwrap();
        assert!(db.is_disposed());
        assert!(matches!(db.has_tasks(), Err(CoreError::DatabaseClosed)));
    }

    #[test]
    fn directory_is_locked_while_open() {
        let dir = tempdir().unwrap();
        let db = Database::open_with_config(dir.path(), quiet_config()).unwrap();
        assert!(matches!(
            Database::open_with_config(dir.path(), quiet_config()),
            Err(CoreError::DatabaseLocked)
        ));
        db.dispose().unwrap();
        Database::open_with_config(dir.path(), quiet_config()).unwrap();
    }

    #[test]
    fn etags_keep_growing_across_restarts() {
        let dir = tempdir().unwrap();
        let first = {
            let db = Database::open_with_config(dir.path(), quiet_config()).unwrap();
            db.put("users/1", None, obj(json!({"Name": "a"})), JsonObject::new(), None)
                .unwrap()
                .etag
        };
        let db = Database::open_with_config(dir.path(), quiet_config()).unwrap();
        let second = db
            .put("users/2", None, obj(json!({"Name": "b"})), JsonObject::new(), None)
            .unwrap()
            .etag;
        assert!(second > first);
        assert_eq!(db.get("users/1", None).unwrap().unwrap().etag, first);
    }

    #[test]
    fn missing_database_without_create_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(Database::open_with_config(&path, quiet_config().create_if_missing(false)).is_err());
    }

    #[test]
    fn workers_start_and_stop() {
        let db = Database::open_in_memory_with(
            Config::default().sync_on_commit(false),
            TriggerRegistry::new(),
        )
        .unwrap();
        assert_eq!(db.workers.lock().len(), 2);
        db.stop_background_workers();
        assert!(db.workers.lock().is_empty());
        db.spin_background_workers().unwrap();
        assert_eq!(db.workers.lock().len(), 2);
        db.dispose().unwrap();
        assert!(db.workers.lock().is_empty());
    }
}
