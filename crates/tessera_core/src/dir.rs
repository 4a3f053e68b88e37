//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK               # fs2 exclusive lock, held while open
//! ├─ MANIFEST           # store id, format version, last checkpoint
//! ├─ wal.log            # write-ahead log
//! ├─ data.snap          # checkpointed tables
//! ├─ IndexDefinitions/  # one JSON file per index
//! └─ Indexes/           # one snapshot per index
//! ```

use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Manifest file name.
pub const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TEMP: &str = "MANIFEST.tmp";
const LOCK_FILE: &str = "LOCK";
/// Write-ahead log file name.
pub const WAL_FILE: &str = "wal.log";
/// Table snapshot file name.
pub const SNAPSHOT_FILE: &str = "data.snap";
/// Directory of index definitions.
pub const INDEX_DEFINITIONS_DIR: &str = "IndexDefinitions";
/// Directory of index contents.
pub const INDEXES_DIR: &str = "Indexes";

/// The database directory, locked for exclusive use.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    lock_file: Option<File>,
}

impl DatabaseDir {
    /// Opens (or creates) the directory and takes the lock.
    ///
    /// # Errors
    ///
    /// - `InvalidFormat` if the directory is missing and may not be created,
    ///   or the path is not a directory
    /// - `DatabaseLocked` if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        fs::create_dir_all(path.join(INDEX_DEFINITIONS_DIR))?;
        fs::create_dir_all(path.join(INDEXES_DIR))?;

        Ok(Self {
            path: path.to_path_buf(),
            lock_file: Some(lock_file),
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the write-ahead log.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Path of the table snapshot.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Path of the manifest.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Directory of persisted index definitions.
    #[must_use]
    pub fn index_definitions_dir(&self) -> PathBuf {
        self.path.join(INDEX_DEFINITIONS_DIR)
    }

    /// Directory of persisted index contents.
    #[must_use]
    pub fn indexes_dir(&self) -> PathBuf {
        self.path.join(INDEXES_DIR)
    }

    /// Returns `true` if no manifest has been written yet.
    #[must_use]
    pub fn is_new_database(&self) -> bool {
        !self.manifest_path().exists()
    }

    /// Loads the manifest, or `None` for a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be read or decoded.
    pub fn load_manifest(&self) -> CoreResult<Option<Manifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        if data.is_empty() {
            return Ok(None);
        }
        Manifest::decode(&data).map(Some)
    }

    /// Writes the manifest through a temp file and rename.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if any step fails.
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        let temp = self.path.join(MANIFEST_TEMP);
        {
            let mut file = File::create(&temp)?;
            file.write_all(&manifest.encode())?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.manifest_path())?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }

    /// Releases the lock. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the lock cannot be released.
    pub fn release(&mut self) -> CoreResult<()> {
        if let Some(file) = self.lock_file.take() {
            file.unlock()?;
        }
        Ok(())
    }

    /// Returns `true` while the lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_layout() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("db");
        let dir = DatabaseDir::open(&path, true).unwrap();

        assert!(dir.is_new_database());
        assert!(path.join("LOCK").exists());
        assert!(dir.index_definitions_dir().is_dir());
        assert!(dir.indexes_dir().is_dir());
    }

    #[test]
    fn missing_directory_without_create_fails() {
        let temp = tempdir().unwrap();
        let result = DatabaseDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn second_open_is_locked_until_release() {
        let temp = tempdir().unwrap();
        let mut first = DatabaseDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            DatabaseDir::open(temp.path(), true),
            Err(CoreError::DatabaseLocked)
        ));

        first.release().unwrap();
        assert!(!first.is_locked());
        assert!(DatabaseDir::open(temp.path(), true).is_ok());
    }

    #[test]
    fn manifest_round_trip() {
        let temp = tempdir().unwrap();
        let dir = DatabaseDir::open(temp.path(), true).unwrap();
        assert!(dir.load_manifest().unwrap().is_none());

        let mut manifest = Manifest::default();
        manifest.last_checkpoint = 9;
        dir.save_manifest(&manifest).unwrap();

        assert_eq!(dir.load_manifest().unwrap(), Some(manifest));
        assert!(!dir.is_new_database());
    }
}
