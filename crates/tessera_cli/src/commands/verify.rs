//! Verify command implementation.

use super::{ensure_database, scan_wal};
use crate::error::{CliError, CliResult};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tessera_core::dir::{MANIFEST_FILE, SNAPSHOT_FILE};
use tessera_core::manifest::Manifest;
use tessera_core::storage::{snapshot, Mutation};
use tessera_core::wal::WalRecord;

/// Verification result of one file.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Batches begun without a commit or abort.
    pub unfinished_batches: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, check_wal: bool, check_snapshot: bool) -> CliResult<()> {
    ensure_database(path)?;
    println!("Verifying database at {}", path.display());
    println!();

    let mut failed = Vec::new();
    let manifest = verify_manifest(path);
    print_result("Manifest", &manifest);
    if !manifest.is_ok() {
        failed.push("manifest");
    }

    if check_wal {
        let wal = verify_wal(path)?;
        print_result("WAL", &wal);
        if !wal.is_ok() {
            failed.push("WAL");
        }
    }

    if check_snapshot {
        let snapshot = verify_snapshot(path)?;
        print_result("Snapshot", &snapshot);
        if !snapshot.is_ok() {
            failed.push("snapshot");
        }
    }

    println!();
    if failed.is_empty() {
        println!("✓ Database verification passed");
        Ok(())
    } else {
        println!("✗ Database verification failed");
        Err(CliError::Verification(failed.join(", ")))
    }
}

fn verify_manifest(path: &Path) -> VerifyResult {
    let mut result = VerifyResult {
        records_checked: 1,
        ..VerifyResult::default()
    };
    match fs::read(path.join(MANIFEST_FILE)) {
        Ok(bytes) => {
            if let Err(e) = Manifest::decode(&bytes) {
                result.errors.push(e.to_string());
            }
        }
        Err(e) => result.errors.push(e.to_string()),
    }
    result
}

/// Walks the WAL: checksums, mutation payloads and batch framing.
pub fn verify_wal(path: &Path) -> CliResult<VerifyResult> {
    let scan = scan_wal(path)?;
    let mut result = VerifyResult::default();
    let mut open = HashSet::new();
    for (offset, record) in &scan.records {
        result.records_checked += 1;
        match record {
            WalRecord::Begin { batch } => {
                open.insert(*batch);
            }
            WalRecord::Mutation { batch, payload } => {
                if !open.contains(batch) {
                    result
                        .errors
                        .push(format!("mutation of batch {batch} outside its batch at offset {offset}"));
                }
                if let Err(e) = Mutation::decode(payload) {
                    result.errors.push(format!("offset {offset}: {e}"));
                }
            }
            WalRecord::Commit { batch } | WalRecord::Abort { batch } => {
                open.remove(batch);
            }
            WalRecord::Checkpoint { .. } => {}
        }
    }
    result.unfinished_batches = open.len();
    if let Some(e) = scan.error {
        result.errors.push(e.to_string());
    }
    Ok(result)
}

/// Decodes the snapshot, which checks its framing and checksum.
pub fn verify_snapshot(path: &Path) -> CliResult<VerifyResult> {
    let snapshot_path = path.join(SNAPSHOT_FILE);
    let mut result = VerifyResult::default();
    if !snapshot_path.exists() {
        return Ok(result);
    }
    match snapshot::decode(&fs::read(&snapshot_path)?) {
        Ok((tables, _)) => {
            result.records_checked = tables.documents.len() + tables.attachments.len();
        }
        Err(e) => result.errors.push(e.to_string()),
    }
    Ok(result)
}

fn print_result(name: &str, result: &VerifyResult) {
    let mark = if result.is_ok() { "✓" } else { "✗" };
    println!("{mark} {name}: {} records checked", result.records_checked);
    if result.unfinished_batches > 0 {
        println!(
            "  {} unfinished batch(es), ignored on recovery",
            result.unfinished_batches
        );
    }
    for error in &result.errors {
        println!("  - {error}");
    }
}
