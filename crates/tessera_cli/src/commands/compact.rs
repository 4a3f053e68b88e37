//! Compact command implementation.

use super::{ensure_database, file_size, format_size, open_existing, scan_wal};
use crate::error::CliResult;
use std::path::Path;
use tessera_core::dir::{SNAPSHOT_FILE, WAL_FILE};
use tessera_core::wal::WalRecord;

/// Sizes around a checkpoint.
#[derive(Debug, PartialEq, Eq)]
pub struct CompactStats {
    /// Committed batches in the WAL before the checkpoint.
    pub committed_batches: usize,
    /// WAL bytes before.
    pub wal_before: u64,
    /// WAL bytes after.
    pub wal_after: u64,
    /// Snapshot bytes before.
    pub snapshot_before: u64,
    /// Snapshot bytes after.
    pub snapshot_after: u64,
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> CliResult<()> {
    ensure_database(path)?;
    println!("Compacting database at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = compact(path, dry_run)?;
    println!("Checkpoint Analysis:");
    println!("  Committed batches in WAL: {}", stats.committed_batches);
    println!("  WAL size:      {}", format_size(stats.wal_before));
    println!("  Snapshot size: {}", format_size(stats.snapshot_before));

    if dry_run {
        return Ok(());
    }
    println!();
    println!("✓ Checkpoint complete");
    println!("  WAL size:      {}", format_size(stats.wal_after));
    println!("  Snapshot size: {}", format_size(stats.snapshot_after));
    Ok(())
}

/// Folds the WAL into the snapshot unless `dry_run`.
pub fn compact(path: &Path, dry_run: bool) -> CliResult<CompactStats> {
    let scan = scan_wal(path)?;
    let committed_batches = scan
        .records
        .iter()
        .filter(|(_, r)| matches!(r, WalRecord::Commit { .. }))
        .count();
    let snapshot_before = file_size(&path.join(SNAPSHOT_FILE));

    if !dry_run {
        let db = open_existing(path)?;
        let result = db.run_idle_operations();
        db.dispose()?;
        result?;
    }

    Ok(CompactStats {
        committed_batches,
        wal_before: scan.size,
        wal_after: file_size(&path.join(WAL_FILE)),
        snapshot_before,
        snapshot_after: file_size(&path.join(SNAPSHOT_FILE)),
    })
}
