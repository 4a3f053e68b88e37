//! Inspect command implementation.

use super::{ensure_database, file_size, format_size, scan_wal};
use crate::error::CliResult;
use crate::Format;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tessera_core::dir::{INDEXES_DIR, INDEX_DEFINITIONS_DIR, MANIFEST_FILE, SNAPSHOT_FILE};
use tessera_core::manifest::Manifest;
use tessera_core::storage::snapshot;
use tessera_core::wal::WalRecord;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Store id from the manifest.
    pub store_id: String,
    /// Format version from the manifest.
    pub format_version: String,
    /// Last batch folded into the snapshot.
    pub last_checkpoint: u64,
    /// WAL file size in bytes.
    pub wal_size: u64,
    /// Snapshot file size in bytes.
    pub snapshot_size: u64,
    /// Bytes of index definitions and contents.
    pub index_size: u64,
    /// Total size in bytes.
    pub total_size: u64,
    /// WAL records by type.
    pub wal_records: BTreeMap<String, usize>,
    /// Batches with a commit record.
    pub committed_batches: usize,
    /// Damage found while reading the WAL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wal_error: Option<String>,
    /// Row counts of the snapshot tables.
    pub snapshot: SnapshotCounts,
    /// Persisted index definitions.
    pub index_definitions: usize,
}

/// Row counts of the snapshot tables.
#[derive(Debug, Default, Serialize)]
pub struct SnapshotCounts {
    /// Documents.
    pub documents: usize,
    /// Attachments.
    pub attachments: usize,
    /// Pending transactions.
    pub transactions: usize,
    /// Queued tasks.
    pub tasks: usize,
    /// Index rows.
    pub indexes: usize,
    /// Identity counters.
    pub identities: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> CliResult<()> {
    let result = inspect(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

/// Reads the database files without opening the database.
pub fn inspect(path: &Path) -> CliResult<InspectResult> {
    ensure_database(path)?;
    let manifest = Manifest::decode(&fs::read(path.join(MANIFEST_FILE))?)?;

    let scan = scan_wal(path)?;
    let mut wal_records = BTreeMap::new();
    let mut committed_batches = 0;
    for (_, record) in &scan.records {
        if matches!(record, WalRecord::Commit { .. }) {
            committed_batches += 1;
        }
        *wal_records
            .entry(format!("{:?}", record.record_type()))
            .or_insert(0) += 1;
    }

    let snapshot_path = path.join(SNAPSHOT_FILE);
    let counts = if snapshot_path.exists() {
        let (tables, _) = snapshot::decode(&fs::read(&snapshot_path)?)?;
        SnapshotCounts {
            documents: tables.documents.len(),
            attachments: tables.attachments.len(),
            transactions: tables.transactions.len(),
            tasks: tables.tasks.len(),
            indexes: tables.indexes.len(),
            identities: tables.identities.len(),
        }
    } else {
        SnapshotCounts::default()
    };

    let definitions = path.join(INDEX_DEFINITIONS_DIR);
    let (index_definitions, definitions_size) = dir_stats(&definitions)?;
    let (_, contents_size) = dir_stats(&path.join(INDEXES_DIR))?;

    let snapshot_size = file_size(&snapshot_path);
    let index_size = definitions_size + contents_size;
    Ok(InspectResult {
        path: path.display().to_string(),
        store_id: manifest.store_id.to_string(),
        format_version: format!("{}.{}", manifest.format_version.0, manifest.format_version.1),
        last_checkpoint: manifest.last_checkpoint,
        wal_size: scan.size,
        snapshot_size,
        index_size,
        total_size: scan.size + snapshot_size + index_size,
        wal_records,
        committed_batches,
        wal_error: scan.error.map(|e| e.to_string()),
        snapshot: counts,
        index_definitions,
    })
}

fn dir_stats(path: &Path) -> CliResult<(usize, u64)> {
    if !path.is_dir() {
        return Ok((0, 0));
    }
    let mut files = 0;
    let mut bytes = 0;
    for entry in fs::read_dir(path)? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            files += 1;
            bytes += metadata.len();
        }
    }
    Ok((files, bytes))
}

fn print_text_output(result: &InspectResult) {
    println!("Tessera Database Inspection");
    println!("===========================");
    println!();
    println!("Path:            {}", result.path);
    println!("Store id:        {}", result.store_id);
    println!("Format version:  {}", result.format_version);
    println!("Last checkpoint: batch {}", result.last_checkpoint);
    println!();
    println!("Storage:");
    println!("  WAL size:      {}", format_size(result.wal_size));
    println!("  Snapshot size: {}", format_size(result.snapshot_size));
    println!("  Index size:    {}", format_size(result.index_size));
    println!("  Total size:    {}", format_size(result.total_size));
    println!();
    println!("WAL:");
    for (kind, count) in &result.wal_records {
        println!("  {kind:<11} {count}");
    }
    println!("  Committed batches: {}", result.committed_batches);
    if let Some(error) = &result.wal_error {
        println!("  Damage: {error}");
    }
    println!();
    println!("Snapshot:");
    println!("  Documents:    {}", result.snapshot.documents);
    println!("  Attachments:  {}", result.snapshot.attachments);
    println!("  Transactions: {}", result.snapshot.transactions);
    println!("  Tasks:        {}", result.snapshot.tasks);
    println!("  Indexes:      {}", result.snapshot.indexes);
    println!("  Identities:   {}", result.snapshot.identities);
    println!();
    println!("Index definitions: {}", result.index_definitions);
}
