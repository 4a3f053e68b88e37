//! CLI command implementations.

pub mod backup;
pub mod compact;
pub mod dump_wal;
pub mod inspect;
pub mod stats;
pub mod verify;

use crate::error::{CliError, CliResult};
use std::path::Path;
use tessera_core::dir::{MANIFEST_FILE, WAL_FILE};
use tessera_core::wal::{WalManager, WalRecord};
use tessera_core::{Config, CoreError, Database};
use tessera_storage::FileBackend;

/// Records of a WAL file, read until the end or the first damaged record.
pub struct WalScan {
    /// `(offset, record)` pairs in log order.
    pub records: Vec<(u64, WalRecord)>,
    /// The error that stopped the scan, if any.
    pub error: Option<CoreError>,
    /// Size of the file.
    pub size: u64,
}

/// Reads the WAL of the database at `path`. A missing file is an empty log.
pub fn scan_wal(path: &Path) -> CliResult<WalScan> {
    let wal_path = path.join(WAL_FILE);
    if !wal_path.exists() {
        return Ok(WalScan {
            records: Vec::new(),
            error: None,
            size: 0,
        });
    }
    let wal = WalManager::new(Box::new(FileBackend::open(&wal_path)?), false);
    let size = wal.size()?;
    let mut records = Vec::new();
    let mut error = None;
    for item in wal.iter()? {
        match item {
            Ok(record) => records.push(record),
            Err(e) => error = Some(e),
        }
    }
    Ok(WalScan {
        records,
        error,
        size,
    })
}

/// Fails unless `path` holds a database manifest.
pub fn ensure_database(path: &Path) -> CliResult<()> {
    if path.join(MANIFEST_FILE).exists() {
        Ok(())
    } else {
        Err(CliError::NotADatabase(path.to_path_buf()))
    }
}

/// Opens an existing database without background workers.
pub fn open_existing(path: &Path) -> CliResult<Database> {
    ensure_database(path)?;
    let config = Config::default()
        .create_if_missing(false)
        .background_workers(false);
    Ok(Database::open_with_config(path, config)?)
}

/// Size of a file, zero if it does not exist.
pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map_or(0, |m| m.len())
}

/// Formats a byte count with a binary unit.
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Formats ms since epoch as `YYYY-MM-DD HH:MM:SS UTC`.
pub fn format_timestamp(ms: u64) -> String {
    let secs = ms / 1000;
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02} UTC",
        rem / 3600,
        (rem / 60) % 60,
        rem % 60
    )
}

/// Gregorian date of a day count since 1970-01-01.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    pub(crate) fn seeded_database(path: &Path) {
        let config = Config::default()
            .background_workers(false)
            .sync_on_commit(false);
        let db = Database::open_with_config(path, config).unwrap();
        let body = match json!({"Name": "oren"}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        db.put("users/1", None, body, tessera_core::JsonObject::new(), None)
            .unwrap();
        db.dispose().unwrap();
    }

    #[test]
    fn timestamps_render_as_dates() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_timestamp(951_782_400_000), "2000-02-29 00:00:00 UTC");
        assert_eq!(format_timestamp(1_700_000_000_000), "2023-11-14 22:13:20 UTC");
    }

    #[test]
    fn sizes_pick_a_unit() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn wal_scan_reads_committed_batches() {
        let dir = tempdir().unwrap();
        seeded_database(dir.path());
        let scan = scan_wal(dir.path()).unwrap();
        assert!(scan.error.is_none());
        assert!(scan
            .records
            .iter()
            .any(|(_, r)| matches!(r, WalRecord::Commit { .. })));
        assert!(ensure_database(dir.path()).is_ok());
        assert!(ensure_database(&dir.path().join("absent")).is_err());
    }
}
