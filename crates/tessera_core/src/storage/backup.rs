//! Backup framing.
//!
//! A backup is a directory holding `tessera.backup` (this format) next to a
//! copy of `IndexDefinitions/`:
//!
//! ```text
//! | magic "TBAK" (4) | version (2) | timestamp (8) | store id (16) | last etag (16) | length (8) | CBOR tables (N) | crc32 (4) |
//! ```

use crate::error::{CoreError, CoreResult};
use crate::etag::Etag;
use crate::storage::tables::Tables;
use crate::types::now_ms;
use crate::wal::compute_crc32;
use uuid::Uuid;

/// File name of the backup payload inside a backup directory.
pub const BACKUP_FILE: &str = "tessera.backup";

const BACKUP_MAGIC: [u8; 4] = *b"TBAK";
const BACKUP_VERSION: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 8 + 16 + 16 + 8;
const FOOTER_SIZE: usize = 4;

/// Header information of a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupMetadata {
    /// When the backup was taken, ms since epoch.
    pub timestamp_ms: u64,
    /// Id of the store that was backed up.
    pub store_id: Uuid,
    /// Most recent document etag at backup time.
    pub last_etag: Etag,
    /// Total size of the backup payload in bytes.
    pub size: usize,
}

/// Encodes the tables as a backup.
///
/// # Errors
///
/// Returns [`CoreError::Cbor`] if the tables cannot be serialized.
pub fn encode_backup(tables: &Tables, store_id: Uuid) -> CoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(tables, &mut payload).map_err(CoreError::cbor)?;
    let last_etag = tables.last_document_etag().unwrap_or(Etag::EMPTY);

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + FOOTER_SIZE);
    buf.extend_from_slice(&BACKUP_MAGIC);
    buf.extend_from_slice(&BACKUP_VERSION.to_le_bytes());
    buf.extend_from_slice(&now_ms().to_le_bytes());
    buf.extend_from_slice(store_id.as_bytes());
    buf.extend_from_slice(last_etag.as_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Reads the header without checking the payload.
///
/// # Errors
///
/// Returns [`CoreError::InvalidFormat`] if the data is not a backup.
pub fn read_metadata(data: &[u8]) -> CoreResult<BackupMetadata> {
    if data.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(CoreError::invalid_format("backup too small"));
    }
    if data[0..4] != BACKUP_MAGIC {
        return Err(CoreError::invalid_format("invalid backup magic"));
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version > BACKUP_VERSION {
        return Err(CoreError::invalid_format(format!(
            "unsupported backup version {version}"
        )));
    }

    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&data[6..14]);
    let mut store_id = [0u8; 16];
    store_id.copy_from_slice(&data[14..30]);
    let mut last_etag = [0u8; 16];
    last_etag.copy_from_slice(&data[30..46]);

    Ok(BackupMetadata {
        timestamp_ms: u64::from_le_bytes(timestamp),
        store_id: Uuid::from_bytes(store_id),
        last_etag: Etag::from_bytes(last_etag),
        size: data.len(),
    })
}

/// Checks the length and checksum of a backup.
///
/// # Errors
///
/// Returns an error if the data is not a backup at all.
pub fn validate_backup(data: &[u8]) -> CoreResult<bool> {
    read_metadata(data)?;
    Ok(payload_range(data).is_some_and(|end| {
        let stored = u32::from_le_bytes([data[end], data[end + 1], data[end + 2], data[end + 3]]);
        stored == compute_crc32(&data[..end])
    }))
}

/// Decodes a backup into its metadata and tables.
///
/// # Errors
///
/// Returns an error if the backup is malformed or its checksum fails.
pub fn restore_tables(data: &[u8]) -> CoreResult<(BackupMetadata, Tables)> {
    let metadata = read_metadata(data)?;
    let end = payload_range(data)
        .ok_or_else(|| CoreError::invalid_format("backup length does not match header"))?;
    let stored = u32::from_le_bytes([data[end], data[end + 1], data[end + 2], data[end + 3]]);
    let computed = compute_crc32(&data[..end]);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    let mut tables: Tables = ciborium::de::from_reader(&data[HEADER_SIZE..end])
        .map_err(|e| CoreError::invalid_format(format!("undecodable backup tables: {e}")))?;
    tables.rebuild_derived();
    Ok((metadata, tables))
}

/// End of the payload (start of the footer), if the length field fits.
fn payload_range(data: &[u8]) -> Option<usize> {
    let mut len = [0u8; 8];
    len.copy_from_slice(&data[46..54]);
    let len = usize::try_from(u64::from_le_bytes(len)).ok()?;
    let end = HEADER_SIZE.checked_add(len)?;
    (end.checked_add(FOOTER_SIZE)? == data.len()).then_some(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mutation::Mutation;

    fn tables() -> Tables {
        let mut tables = Tables::default();
        tables.apply(Mutation::SetIdentity {
            name: "tessera/etag".into(),
            value: 4,
        });
        tables
    }

    #[test]
    fn backup_round_trip() {
        let id = Uuid::new_v4();
        let data = encode_backup(&tables(), id).unwrap();
        assert!(validate_backup(&data).unwrap());

        let (metadata, restored) = restore_tables(&data).unwrap();
        assert_eq!(metadata.store_id, id);
        assert_eq!(metadata.last_etag, Etag::EMPTY);
        assert_eq!(restored.identities.get("tessera/etag"), Some(&4));
    }

    #[test]
    fn corrupted_backup_fails_validation() {
        let mut data = encode_backup(&tables(), Uuid::new_v4()).unwrap();
        let last = data.len() - 6;
        data[last] ^= 0xFF;
        assert!(!validate_backup(&data).unwrap());
        assert!(restore_tables(&data).is_err());
    }

    #[test]
    fn foreign_data_is_rejected() {
        assert!(read_metadata(b"not a backup").is_err());
        assert!(validate_backup(&[0u8; 80]).is_err());
    }
}
