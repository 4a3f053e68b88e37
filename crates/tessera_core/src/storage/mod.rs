//! Transactional storage.
//!
//! Committed state lives in [`Tables`] in memory. Every commit is written
//! to the WAL first; a checkpoint folds the tables into `data.snap` and
//! clears the log. Writers are serialized by a re-entrant lock so that a
//! batch opened inside another batch on the same thread joins it.

mod actions;
pub mod backup;
mod mutation;
pub mod snapshot;
mod tables;

pub use actions::{CommitCallback, StorageActions};
pub use backup::BackupMetadata;
pub use mutation::Mutation;
pub use tables::{
    normalize_key, IndexFailureInformation, IndexStats, MappedResult, PendingTransaction,
    StagedOperation, Tables,
};

use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::etag::EtagGenerator;
use crate::manifest::Manifest;
use crate::types::now_ms;
use crate::wal::{BatchId, StreamingRecovery, WalManager, WalRecord};
use actions::BatchState;
use parking_lot::{Mutex, ReentrantMutex, RwLock, RwLockReadGuard};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tracing::{debug, info};
use uuid::Uuid;

/// Hook run after every outermost commit that changed something.
pub type CommitHook = Arc<dyn Fn() + Send + Sync>;

/// Clears the batch state if the action panics.
struct ResetOnDrop<'a>(&'a RefCell<Option<BatchState>>);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.try_borrow_mut() {
            state.take();
        }
    }
}

/// Storage engine with batched, atomic commits.
pub struct TransactionalStorage {
    tables: RwLock<Tables>,
    writer: ReentrantMutex<RefCell<Option<BatchState>>>,
    wal: WalManager,
    snapshot: Mutex<Box<dyn StorageBackend>>,
    dir: Mutex<Option<DatabaseDir>>,
    path: Option<PathBuf>,
    manifest: Mutex<Manifest>,
    generator: EtagGenerator,
    next_batch: AtomicU64,
    last_usage_ms: AtomicU64,
    commit_hook: RwLock<Option<CommitHook>>,
    disposed: AtomicBool,
}

impl TransactionalStorage {
    /// Opens storage inside a locked database directory and recovers it.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened or recovery fails.
    pub fn open(dir: DatabaseDir, config: &Config) -> CoreResult<Self> {
        let manifest = match dir.load_manifest()? {
            Some(manifest) => manifest,
            None => {
                let manifest = Manifest::default();
                dir.save_manifest(&manifest)?;
                manifest
            }
        };
        let wal = FileBackend::open_with_create_dirs(&dir.wal_path())?;
        let snapshot = FileBackend::open_with_create_dirs(&dir.snapshot_path())?;
        let path = dir.path().to_path_buf();

        let storage = Self::with_backends(
            Box::new(wal),
            Box::new(snapshot),
            manifest,
            config.sync_on_commit,
        )?;
        *storage.dir.lock() = Some(dir);
        Ok(Self {
            path: Some(path),
            ..storage
        })
    }

    /// Opens an empty storage that lives only in memory.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`open`](Self::open).
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::with_backends(
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
            Manifest::default(),
            false,
        )
    }

    fn with_backends(
        wal: Box<dyn StorageBackend>,
        snapshot: Box<dyn StorageBackend>,
        manifest: Manifest,
        sync_on_commit: bool,
    ) -> CoreResult<Self> {
        let wal = WalManager::new(wal, sync_on_commit);
        let (tables, last_batch) = Self::recover(&wal, snapshot.as_ref())?;

        Ok(Self {
            tables: RwLock::new(tables),
            writer: ReentrantMutex::new(RefCell::new(None)),
            wal,
            snapshot: Mutex::new(snapshot),
            dir: Mutex::new(None),
            path: None,
            manifest: Mutex::new(manifest),
            generator: EtagGenerator::new(0),
            next_batch: AtomicU64::new(last_batch),
            last_usage_ms: AtomicU64::new(now_ms()),
            commit_hook: RwLock::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Loads the snapshot, then replays the batches committed after it.
    fn recover(wal: &WalManager, snapshot: &dyn StorageBackend) -> CoreResult<(Tables, BatchId)> {
        let (mut tables, checkpoint) = snapshot::decode(&snapshot.read_all()?)?;

        let mut recovery = StreamingRecovery::new(checkpoint);
        recovery.scan_committed(wal.iter()?)?;
        let applied = recovery.replay(wal.iter()?, |_, payload| {
            tables.apply(Mutation::decode(payload)?);
            Ok(())
        })?;

        if applied > 0 {
            info!(
                batches = recovery.committed_count(),
                mutations = applied,
                checkpoint,
                "recovered storage from WAL"
            );
        }
        Ok((tables, recovery.max_batch()))
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(CoreError::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    fn touch(&self) {
        self.last_usage_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read()
    }

    /// The etag generator shared by every batch.
    #[must_use]
    pub fn generator(&self) -> &EtagGenerator {
        &self.generator
    }

    /// Installs the hook run after every commit that changed something.
    pub fn set_commit_hook(&self, hook: CommitHook) {
        *self.commit_hook.write() = Some(hook);
    }

    /// Runs `action` in a write batch.
    ///
    /// A batch already open on this thread is joined; only the outermost
    /// batch commits. An `Err` from the outermost action discards every
    /// change of the batch. Commit callbacks run after the commit while
    /// other writers are still held off.
    ///
    /// # Errors
    ///
    /// Returns the action's error, or a storage error from the commit.
    pub fn batch<T, F>(&self, action: F) -> CoreResult<T>
    where
        F: FnOnce(&StorageActions<'_>) -> CoreResult<T>,
    {
        self.ensure_open()?;
        let guard = self.writer.lock();
        let nested = guard.borrow().is_some();
        if nested {
            return action(&StorageActions::new(self, &guard));
        }

        *guard.borrow_mut() = Some(BatchState::default());
        let reset = ResetOnDrop(&guard);
        let result = action(&StorageActions::new(self, &guard));
        let state = guard.borrow_mut().take();
        drop(reset);

        let value = result?;
        let (mutations, callbacks) = state.map(BatchState::into_parts).unwrap_or_default();
        let changed = !mutations.is_empty();
        self.commit(mutations)?;
        self.touch();
        for callback in callbacks {
            callback();
        }
        drop(guard);

        if changed {
            let hook = self.commit_hook.read().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
        Ok(value)
    }

    fn commit(&self, mutations: Vec<Mutation>) -> CoreResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let batch = self.next_batch.fetch_add(1, Ordering::SeqCst) + 1;

        let mut records = Vec::with_capacity(mutations.len() + 2);
        records.push(WalRecord::Begin { batch });
        for mutation in &mutations {
            records.push(WalRecord::Mutation {
                batch,
                payload: mutation.encode()?,
            });
        }
        records.push(WalRecord::Commit { batch });
        self.wal.append_all(&records)?;

        let mut tables = self.tables.write();
        for mutation in mutations {
            tables.apply(mutation);
        }
        Ok(())
    }

    /// Runs `action` against a read view.
    ///
    /// Inside a batch on this thread the view includes the batch's own
    /// changes. Otherwise it sees committed state only and does not wait
    /// for writers.
    ///
    /// # Errors
    ///
    /// Returns the action's error.
    pub fn read<T, F>(&self, action: F) -> CoreResult<T>
    where
        F: FnOnce(&StorageActions<'_>) -> CoreResult<T>,
    {
        self.ensure_open()?;
        if let Some(guard) = self.writer.try_lock() {
            let open = guard.borrow().is_some();
            if open {
                return action(&StorageActions::new(self, &guard));
            }
        }
        let state = RefCell::new(Some(BatchState::read_only()));
        action(&StorageActions::new(self, &state))
    }

    /// Runs `callback` after the current batch commits, or right away when
    /// no batch is open on this thread.
    pub fn execute_immediately_or_register_for_synchronization(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) {
        let mut callback: CommitCallback = Box::new(callback);
        if let Some(guard) = self.writer.try_lock() {
            let mut state = guard.borrow_mut();
            if let Some(state) = state.as_mut() {
                match state.register_callback(callback) {
                    Ok(()) => return,
                    Err(returned) => callback = returned,
                }
            }
        }
        callback();
    }

    /// Writes the tables to the snapshot and clears the WAL.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` inside a batch, or the first I/O error.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.ensure_open()?;
        let guard = self.writer.lock();
        if guard.borrow().is_some() {
            return Err(CoreError::invalid_operation(
                "cannot checkpoint inside a batch",
            ));
        }

        let batch = self.next_batch.load(Ordering::SeqCst);
        let bytes = snapshot::encode(&self.tables.read(), batch)?;
        self.snapshot.lock().replace(&bytes)?;
        {
            let mut manifest = self.manifest.lock();
            manifest.last_checkpoint = batch;
            if let Some(dir) = self.dir.lock().as_ref() {
                dir.save_manifest(&manifest)?;
            }
        }
        self.wal.clear()?;
        self.wal.append(&WalRecord::Checkpoint { batch })?;

        info!(batch, snapshot_bytes = bytes.len(), "checkpoint written");
        drop(guard);
        Ok(())
    }

    /// Checkpoints when the storage has been idle for `idle_timeout` and
    /// something committed since the last checkpoint. Returns whether a
    /// checkpoint ran.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint error.
    pub fn run_idle(&self, idle_timeout: Duration) -> CoreResult<bool> {
        let idle_ms = now_ms().saturating_sub(self.last_usage_ms.load(Ordering::Relaxed));
        if u128::from(idle_ms) < idle_timeout.as_millis() {
            return Ok(false);
        }
        let checkpointed = self.manifest.lock().last_checkpoint;
        if self.next_batch.load(Ordering::SeqCst) <= checkpointed {
            return Ok(false);
        }
        debug!(idle_ms, "storage idle, checkpointing");
        self.checkpoint()?;
        Ok(true)
    }

    /// Writes a backup of the committed tables into `destination`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backup cannot be written.
    pub fn backup(&self, destination: &Path) -> CoreResult<PathBuf> {
        self.ensure_open()?;
        fs::create_dir_all(destination)?;
        let data = backup::encode_backup(&self.tables.read(), self.id())?;

        let target = destination.join(backup::BACKUP_FILE);
        let temp = destination.join(format!("{}.tmp", backup::BACKUP_FILE));
        fs::write(&temp, &data)?;
        fs::rename(&temp, &target)?;
        info!(path = %target.display(), bytes = data.len(), "backup written");
        Ok(target)
    }

    /// Restores the backup in `backup_dir` into a new database directory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `target` already holds a database, or
    /// an error if the backup fails validation.
    pub fn restore(backup_dir: &Path, target: &Path) -> CoreResult<BackupMetadata> {
        let data = fs::read(backup_dir.join(backup::BACKUP_FILE))?;
        let (metadata, tables) = backup::restore_tables(&data)?;

        let mut dir = DatabaseDir::open(target, true)?;
        if !dir.is_new_database() {
            return Err(CoreError::invalid_operation(format!(
                "cannot restore into existing database at {}",
                target.display()
            )));
        }
        FileBackend::open_with_create_dirs(&dir.snapshot_path())?
            .replace(&snapshot::encode(&tables, 0)?)?;
        dir.save_manifest(&Manifest::new(metadata.store_id))?;
        dir.release()?;

        info!(
            store_id = %metadata.store_id,
            documents = tables.documents.len(),
            "backup restored"
        );
        Ok(metadata)
    }

    /// Bytes used by the WAL and snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend size cannot be read.
    pub fn database_size_in_bytes(&self) -> CoreResult<u64> {
        Ok(self.wal.size()? + self.snapshot.lock().size()?)
    }

    /// Id of the store, kept across restores.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.manifest.lock().store_id
    }

    /// Directory of the database, `None` in memory.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Highest committed batch id.
    #[must_use]
    pub fn last_batch(&self) -> BatchId {
        self.next_batch.load(Ordering::SeqCst)
    }

    /// Syncs the WAL and refuses further use. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the sync error.
    pub fn dispose(&self) -> CoreResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _writer = self.writer.lock();
        self.wal.sync()
    }

    /// Releases the directory lock. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be released.
    pub fn release_directory(&self) -> CoreResult<()> {
        match self.dir.lock().take() {
            Some(mut dir) => dir.release(),
            None => Ok(()),
        }
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TransactionalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalStorage")
            .field("path", &self.path)
            .field("last_batch", &self.last_batch())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
