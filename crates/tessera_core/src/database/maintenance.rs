//! Statistics, idle housekeeping, backup and restore.

use super::Database;
use crate::config::Config;
use crate::dir::{INDEXES_DIR, INDEX_DEFINITIONS_DIR};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexStorage;
use crate::stats::{DatabaseStatistics, IndexStatistics};
use crate::storage::{BackupMetadata, TransactionalStorage};
use crate::types::{now_ms, JsonObject, BACKUP_STATUS_KEY};
use crate::work::RepeatedAction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Phase of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupState {
    /// The backup thread is copying data.
    Running,
    /// The backup finished.
    Completed,
    /// The backup stopped with an error.
    Failed,
}

/// Progress of the last backup, stored as the `Tessera/Backup/Status`
/// document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupStatus {
    /// Current phase.
    pub state: BackupState,
    /// When the backup started (ms since epoch).
    pub started_ms: u64,
    /// When it ended, if it did.
    pub completed_ms: Option<u64>,
    /// Target directory.
    pub destination: PathBuf,
    /// Failure message.
    pub error: Option<String>,
}

impl BackupStatus {
    fn to_object(&self) -> CoreResult<JsonObject> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(CoreError::invalid_format("backup status is not an object")),
        }
    }
}

fn write_status(storage: &TransactionalStorage, status: &BackupStatus) -> CoreResult<()> {
    let data = status.to_object()?;
    storage.batch(|actions| {
        actions.add_document(BACKUP_STATUS_KEY, None, data, JsonObject::new())?;
        Ok(())
    })
}

/// Checkpoints the storage once it has been idle long enough, then flushes
/// dirty index contents.
pub struct IdleHousekeeping {
    storage: Arc<TransactionalStorage>,
    indexes: Arc<IndexStorage>,
    idle_timeout: Duration,
    interval: Duration,
}

impl IdleHousekeeping {
    /// Creates the action.
    pub fn new(
        storage: Arc<TransactionalStorage>,
        indexes: Arc<IndexStorage>,
        idle_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            storage,
            indexes,
            idle_timeout,
            interval,
        }
    }

    fn run(&self) -> CoreResult<bool> {
        if !self.storage.run_idle(self.idle_timeout)? {
            return Ok(false);
        }
        self.indexes.flush()?;
        Ok(true)
    }
}

impl std::fmt::Debug for IdleHousekeeping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleHousekeeping")
            .field("idle_timeout", &self.idle_timeout)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl RepeatedAction for IdleHousekeeping {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn is_valid(&self) -> bool {
        !self.storage.is_disposed()
    }

    fn execute(&self) {
        match self.run() {
            Ok(true) => debug!("idle checkpoint written"),
            Ok(false) | Err(CoreError::DatabaseClosed) => {}
            Err(e) => warn!(error = %e, "idle housekeeping failed"),
        }
    }
}

impl Database {
    /// Counts, index health, recent errors and registered triggers.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn statistics(&self) -> CoreResult<DatabaseStatistics> {
        self.ensure_open()?;
        let config = &self.env.config;
        let names = self.index_storage().names();
        let mut statistics = self.storage().read(|actions| {
            let mut stale_indexes = Vec::new();
            for name in &names {
                if actions.is_stale(name, None, None)? {
                    stale_indexes.push(name.clone());
                }
            }
            let indexes = actions
                .all_index_stats()?
                .into_iter()
                .map(|stats| {
                    let failure = stats.failure_rate(
                        config.index_failure_threshold,
                        config.index_failure_min_attempts,
                    );
                    IndexStatistics::new(stats, &failure)
                })
                .collect();
            Ok(DatabaseStatistics {
                last_doc_etag: actions.last_document_etag()?,
                last_attachment_etag: actions.last_attachment_etag()?,
                count_of_documents: actions.document_count()?,
                count_of_attachments: actions.attachment_count()?,
                approximate_task_count: actions.approximate_task_count()?,
                count_of_indexes: names.len(),
                stale_indexes,
                indexes,
                errors: Vec::new(),
                triggers: Vec::new(),
                current_number_of_items_to_index_in_single_batch: 0,
                current_number_of_items_to_reduce_in_single_batch: 0,
                total_size_on_disk: 0,
            })
        })?;

        let context = &self.env.context;
        statistics.errors = context.errors();
        statistics.triggers = self.env.triggers.trigger_infos();
        statistics.current_number_of_items_to_index_in_single_batch =
            context.current_index_batch_size();
        statistics.current_number_of_items_to_reduce_in_single_batch =
            context.current_reduce_batch_size();
        statistics.total_size_on_disk = self.total_size_on_disk()?;
        Ok(statistics)
    }

    /// Bytes used by the storage files and the persisted indexes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a file size cannot be read.
    pub fn total_size_on_disk(&self) -> CoreResult<u64> {
        let mut total = self.storage().database_size_in_bytes()?;
        if let Some(path) = self.path() {
            total += directory_size(&path.join(INDEX_DEFINITIONS_DIR))?;
            total += directory_size(&path.join(INDEXES_DIR))?;
        }
        Ok(total)
    }

    /// Runs the idle housekeeping now, whatever the idle timeout. Returns
    /// whether a checkpoint was written.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint or flush error.
    pub fn run_idle_operations(&self) -> CoreResult<bool> {
        self.ensure_open()?;
        let checkpointed = self.storage().run_idle(Duration::ZERO)?;
        self.index_storage().flush()?;
        Ok(checkpointed)
    }

    /// Starts a backup into `destination` on a background thread.
    ///
    /// Index definitions are copied before this returns; the data follows.
    /// Progress is recorded in the backup status document, see
    /// [`Database::backup_status`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` while another backup runs.
    pub fn start_backup(&self, destination: &Path) -> CoreResult<()> {
        self.ensure_open()?;
        let mut running = self.backup.lock();
        if let Some(handle) = running.take() {
            if !handle.is_finished() {
                *running = Some(handle);
                return Err(CoreError::invalid_operation("a backup is already running"));
            }
            if handle.join().is_err() {
                warn!("previous backup thread panicked");
            }
        }
        if let Some(status) = self.backup_status()? {
            if status.state == BackupState::Running {
                warn!(
                    destination = %status.destination.display(),
                    "replacing status of a backup that did not finish"
                );
            }
        }

        let mut status = BackupStatus {
            state: BackupState::Running,
            started_ms: now_ms(),
            completed_ms: None,
            destination: destination.to_path_buf(),
            error: None,
        };
        write_status(self.storage(), &status)?;

        let prepared = self.index_storage().flush().and_then(|()| {
            self.index_storage()
                .copy_definitions_to(&destination.join(INDEX_DEFINITIONS_DIR))
        });
        if let Err(e) = prepared {
            status.state = BackupState::Failed;
            status.completed_ms = Some(now_ms());
            status.error = Some(e.to_string());
            write_status(self.storage(), &status)?;
            return Err(e);
        }

        let storage = Arc::clone(self.storage());
        let destination = destination.to_path_buf();
        info!(destination = %destination.display(), "backup started");
        *running = Some(thread::spawn(move || {
            match storage.backup(&destination) {
                Ok(file) => {
                    status.state = BackupState::Completed;
                    info!(file = %file.display(), "backup completed");
                }
                Err(e) => {
                    status.state = BackupState::Failed;
                    status.error = Some(e.to_string());
                    error!(error = %e, "backup failed");
                }
            }
            status.completed_ms = Some(now_ms());
            if let Err(e) = write_status(&storage, &status) {
                warn!(error = %e, "failed to record backup status");
            }
        }));
        Ok(())
    }

    /// The status of the last backup, if one was started.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn backup_status(&self) -> CoreResult<Option<BackupStatus>> {
        self.ensure_open()?;
        let Some(doc) = self
            .storage()
            .read(|actions| actions.document_by_key(BACKUP_STATUS_KEY, None))?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(Value::Object(doc.data))?))
    }

    /// Blocks until the running backup, if any, finished.
    pub fn wait_for_backup(&self) {
        if let Some(handle) = self.backup.lock().take() {
            if handle.join().is_err() {
                warn!("backup thread panicked");
            }
        }
    }

    /// Restores a backup into an empty `database_dir`, index definitions
    /// included. Indexes are rebuilt from the documents on first open.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `database_dir` already holds a
    /// database, or the error that stopped the copy.
    pub fn restore(backup_dir: &Path, database_dir: &Path) -> CoreResult<BackupMetadata> {
        let metadata = TransactionalStorage::restore(backup_dir, database_dir)?;

        let source = backup_dir.join(INDEX_DEFINITIONS_DIR);
        if source.is_dir() {
            let target = database_dir.join(INDEX_DEFINITIONS_DIR);
            fs::create_dir_all(&target)?;
            for entry in fs::read_dir(&source)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    if let Some(name) = path.file_name() {
                        fs::copy(&path, target.join(name))?;
                    }
                }
            }
        }

        let db = Database::open_with_config(
            database_dir,
            Config::default().background_workers(false),
        )?;
        db.storage()
            .batch(|actions| actions.delete_document(BACKUP_STATUS_KEY, None))?;
        db.dispose()?;
        info!(
            from = %backup_dir.display(),
            to = %database_dir.display(),
            "database restored"
        );
        Ok(metadata)
    }
}

fn directory_size(path: &Path) -> CoreResult<u64> {
    if !path.is_dir() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{db, entity, obj, quiet_config};
    use super::*;
    use crate::index::IndexDefinition;
    use crate::query::IndexQuery;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn statistics_report_counts_and_staleness() {
        let db = db();
        db.put_index(
            "Users/ByName",
            IndexDefinition::new().from_entity("Users").map_field("Name", "Name"),
        )
        .unwrap();
        db.put("users/1", None, obj(json!({"Name": "a"})), entity("Users"), None)
            .unwrap();
        db.put_static("files/1", None, b"abc".to_vec(), JsonObject::new())
            .unwrap();

        let stats = db.statistics().unwrap();
        assert_eq!(stats.count_of_documents, 1);
        assert_eq!(stats.count_of_attachments, 1);
        assert_eq!(stats.count_of_indexes, 1);
        assert_eq!(stats.stale_indexes, vec!["Users/ByName"]);
        assert!(stats.last_doc_etag.is_some());

        db.run_background_work().unwrap();
        let stats = db.statistics().unwrap();
        assert!(stats.stale_indexes.is_empty());
        assert_eq!(stats.indexes.len(), 1);
        assert!(!stats.indexes[0].is_invalid);
    }

    #[test]
    fn idle_operations_checkpoint_dirty_storage() {
        let dir = tempdir().unwrap();
        let db = Database::open_with_config(dir.path(), quiet_config()).unwrap();
        db.put("users/1", None, obj(json!({"Name": "a"})), JsonObject::new(), None)
            .unwrap();
        assert!(db.run_idle_operations().unwrap());
        assert!(!db.run_idle_operations().unwrap());
        assert!(db.total_size_on_disk().unwrap() > 0);
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let source = tempdir().unwrap();
        let backup = tempdir().unwrap();
        let target = tempdir().unwrap();
        let restored_path = target.path().join("restored");

        {
            let db = Database::open_with_config(source.path(), quiet_config()).unwrap();
            db.put_index(
                "Users/ByName",
                IndexDefinition::new().from_entity("Users").map_field("Name", "Name"),
            )
            .unwrap();
            db.put("users/1", None, obj(json!({"Name": "oren"})), entity("Users"), None)
                .unwrap();
            db.start_backup(backup.path()).unwrap();
            db.wait_for_backup();
            let status = db.backup_status().unwrap().unwrap();
            assert_eq!(status.state, BackupState::Completed);
            assert!(status.completed_ms.is_some());
        }

        Database::restore(backup.path(), &restored_path).unwrap();
        let db = Database::open_with_config(&restored_path, quiet_config()).unwrap();
        assert!(db.backup_status().unwrap().is_none());
        assert_eq!(db.get("users/1", None).unwrap().unwrap().data["Name"], json!("oren"));
        assert_eq!(db.get_index_names(0, 10), vec!["Users/ByName"]);

        db.run_background_work().unwrap();
        let result = db.query("Users/ByName", IndexQuery::new("Name:oren")).unwrap();
        assert_eq!(result.total_results, 1);
    }

    #[test]
    fn restore_refuses_an_existing_database() {
        let source = tempdir().unwrap();
        let backup = tempdir().unwrap();
        {
            let db = Database::open_with_config(source.path(), quiet_config()).unwrap();
            db.start_backup(backup.path()).unwrap();
            db.wait_for_backup();
        }
        assert!(Database::restore(backup.path(), source.path()).is_err());
    }
}
