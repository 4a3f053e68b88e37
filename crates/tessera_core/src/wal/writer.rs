//! WAL writer.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_crc32, WalRecord, WAL_MAGIC, WAL_VERSION};
use crate::wal::WalRecordIterator;
use parking_lot::Mutex;
use tessera_storage::StorageBackend;

/// Header size: magic (4) + version (2) + type (1) + length (4).
pub(crate) const HEADER_SIZE: usize = 11;

/// CRC size.
pub(crate) const CRC_SIZE: usize = 4;

/// Append-only access to the log backend.
pub struct WalManager {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl WalManager {
    /// Creates a WAL over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_write,
        }
    }

    /// Encodes one record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds the 4-byte length field.
    pub fn encode_record(record: &WalRecord) -> CoreResult<Vec<u8>> {
        let payload = record.encode_payload();
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("WAL record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&WAL_MAGIC);
        data.extend_from_slice(&WAL_VERSION.to_le_bytes());
        data.push(record.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Appends a single record and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or written.
    pub fn append(&self, record: &WalRecord) -> CoreResult<u64> {
        self.append_all(std::slice::from_ref(record))
    }

    /// Appends several records in one write, then flushes.
    ///
    /// Returns the offset of the first record.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be encoded or written.
    pub fn append_all(&self, records: &[WalRecord]) -> CoreResult<u64> {
        let mut data = Vec::new();
        for record in records {
            data.extend_from_slice(&Self::encode_record(record)?);
        }

        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        backend.flush()?;
        if self.sync_on_write {
            backend.sync()?;
        }
        Ok(offset)
    }

    /// Flushes and syncs the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to sync.
    pub fn sync(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        backend.flush()?;
        backend.sync()?;
        Ok(())
    }

    /// Returns the current WAL size.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Returns a streaming iterator over the records.
    ///
    /// The backend stays locked until the iterator is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be accessed.
    pub fn iter(&self) -> CoreResult<WalRecordIterator<'_>> {
        WalRecordIterator::new(self.backend.lock(), 0)
    }

    /// Reads every record into memory.
    ///
    /// # Errors
    ///
    /// Returns the first read or corruption error.
    pub fn read_all(&self) -> CoreResult<Vec<(u64, WalRecord)>> {
        self.iter()?.collect()
    }

    /// Truncates the WAL to `offset`, dropping everything after it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be truncated.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        self.backend.lock().truncate(offset)?;
        Ok(())
    }

    /// Empties the WAL after a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be truncated.
    pub fn clear(&self) -> CoreResult<()> {
        self.truncate(0)
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::InMemoryBackend;

    fn create_wal() -> WalManager {
        WalManager::new(Box::new(InMemoryBackend::new()), false)
    }

    #[test]
    fn append_and_read_batch() {
        let wal = create_wal();
        let records = vec![
            WalRecord::Begin { batch: 1 },
            WalRecord::Mutation {
                batch: 1,
                payload: vec![1, 2, 3],
            },
            WalRecord::Commit { batch: 1 },
        ];
        assert_eq!(wal.append_all(&records).unwrap(), 0);

        let read: Vec<_> = wal.read_all().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(read, records);
    }

    #[test]
    fn offsets_follow_record_sizes() {
        let wal = create_wal();
        let first = wal.append(&WalRecord::Begin { batch: 1 }).unwrap();
        let second = wal.append(&WalRecord::Commit { batch: 1 }).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, (HEADER_SIZE + 8 + CRC_SIZE) as u64);
    }

    #[test]
    fn clear_empties_log() {
        let wal = create_wal();
        wal.append(&WalRecord::Begin { batch: 1 }).unwrap();
        wal.clear().unwrap();
        assert_eq!(wal.size().unwrap(), 0);
        assert!(wal.read_all().unwrap().is_empty());
    }
}
