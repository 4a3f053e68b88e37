//! Backup and restore commands.
//!
//! These go through the database API: `create` opens the database and runs
//! its backup, `restore` rebuilds a database directory from a backup
//! directory. `validate` and `info` only read the backup file.

use super::{format_size, format_timestamp, open_existing};
use crate::error::{CliError, CliResult};
use std::fs;
use std::path::Path;
use tessera_core::dir::{INDEX_DEFINITIONS_DIR, MANIFEST_FILE};
use tessera_core::storage::backup::{read_metadata, validate_backup, BACKUP_FILE};
use tessera_core::{BackupMetadata, BackupState, Database};
use tracing::info;

/// Backs the database at `db_path` up into `output`.
pub fn create(db_path: &Path, output: &Path) -> CliResult<()> {
    info!(database = %db_path.display(), "creating backup");
    let db = open_existing(db_path)?;
    let started = db.start_backup(output);
    db.wait_for_backup();
    let status = db.backup_status();
    db.dispose()?;
    started?;

    let status = status?.ok_or_else(|| CliError::Refused("backup left no status".into()))?;
    if status.state != BackupState::Completed {
        return Err(CliError::Refused(format!(
            "backup failed: {}",
            status.error.unwrap_or_default()
        )));
    }

    let metadata = read_metadata(&fs::read(output.join(BACKUP_FILE))?)?;
    println!("✓ Backup created successfully");
    println!("  Path: {}", output.display());
    print_metadata(&metadata);
    Ok(())
}

/// Restores the backup in `input` into `db_path`.
pub fn restore(db_path: &Path, input: &Path, force: bool) -> CliResult<()> {
    info!(backup = %input.display(), "restoring database");
    if db_path.join(MANIFEST_FILE).exists() {
        if !force {
            return Err(CliError::Refused(
                "database already exists, use --force to overwrite".into(),
            ));
        }
        fs::remove_dir_all(db_path)?;
    }

    let metadata = Database::restore(input, db_path)?;
    println!("✓ Database restored successfully");
    println!("  Path: {}", db_path.display());
    print_metadata(&metadata);
    Ok(())
}

/// Checks a backup without restoring it.
pub fn validate(input: &Path) -> CliResult<()> {
    info!(backup = %input.display(), "validating backup");
    let data = fs::read(input.join(BACKUP_FILE))?;
    if !validate_backup(&data)? {
        println!("✗ Backup is invalid or corrupted");
        return Err(CliError::Verification("backup checksum mismatch".into()));
    }
    println!("✓ Backup is valid");
    print_metadata(&read_metadata(&data)?);
    println!("  Index definitions: {}", count_definitions(input)?);
    Ok(())
}

/// Shows backup metadata.
pub fn info(input: &Path) -> CliResult<()> {
    let data = fs::read(input.join(BACKUP_FILE))?;
    let metadata = read_metadata(&data)?;
    println!("Backup Information");
    println!("==================");
    print_metadata(&metadata);
    println!("  Index definitions: {}", count_definitions(input)?);
    Ok(())
}

fn count_definitions(input: &Path) -> CliResult<usize> {
    let dir = input.join(INDEX_DEFINITIONS_DIR);
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        if entry?.path().extension().is_some_and(|ext| ext == "json") {
            count += 1;
        }
    }
    Ok(count)
}

fn print_metadata(metadata: &BackupMetadata) {
    println!("  Store id: {}", metadata.store_id);
    println!("  Size: {}", format_size(metadata.size as u64));
    println!("  Last etag: {}", metadata.last_etag);
    println!("  Created: {}", format_timestamp(metadata.timestamp_ms));
}

#[cfg(test)]
mod tests {
    use super::super::tests::seeded_database;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_validate_and_restore() {
        let source = tempdir().unwrap();
        let backup = tempdir().unwrap();
        let target = tempdir().unwrap();
        seeded_database(source.path());

        create(source.path(), backup.path()).unwrap();
        validate(backup.path()).unwrap();
        info(backup.path()).unwrap();

        let restored = target.path().join("db");
        restore(&restored, backup.path(), false).unwrap();
        assert!(restore(&restored, backup.path(), false).is_err());
        restore(&restored, backup.path(), true).unwrap();

        let db = open_existing(&restored).unwrap();
        assert!(db.get("users/1", None).unwrap().is_some());
    }

    #[test]
    fn damaged_backup_fails_validation() {
        let source = tempdir().unwrap();
        let backup = tempdir().unwrap();
        seeded_database(source.path());
        create(source.path(), backup.path()).unwrap();

        let file = backup.path().join(BACKUP_FILE);
        let mut data = fs::read(&file).unwrap();
        let middle = data.len() / 2;
        data[middle] ^= 0xFF;
        fs::write(&file, data).unwrap();
        assert!(validate(backup.path()).is_err());
    }
}
