//! Streaming WAL iteration and two-pass recovery.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_crc32, BatchId, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use crate::wal::writer::{CRC_SIZE, HEADER_SIZE};
use parking_lot::MutexGuard;
use std::collections::HashSet;
use tessera_storage::StorageBackend;

/// Iterates over WAL records one at a time, holding the backend lock.
///
/// Yields `(offset, record)`. A truncated trailing record ends the
/// iteration; corruption yields one error and then ends it.
pub struct WalRecordIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(
        backend: MutexGuard<'a, Box<dyn StorageBackend>>,
        start_offset: u64,
    ) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            offset: start_offset,
            finished: false,
        })
    }

    /// Offset just past the last complete record read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, WalRecord)>> {
        let start = self.offset;
        let remaining = self.total_size.saturating_sub(start);
        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header = self.backend.read_at(start, HEADER_SIZE)?;
        if header[0..4] != WAL_MAGIC {
            return Err(CoreError::wal_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            return Err(CoreError::wal_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }

        let type_byte = header[6];
        let record_type = WalRecordType::from_byte(type_byte).ok_or_else(|| {
            CoreError::wal_corruption(format!(
                "unknown record type {type_byte} at offset {start}"
            ))
        })?;

        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if remaining < total_len as u64 {
            tracing::warn!(offset = start, "truncated WAL record treated as end of log");
            return Ok(None);
        }

        let bytes = self.backend.read_at(start, total_len)?;
        let body_end = HEADER_SIZE + payload_len;
        let stored = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        let computed = compute_crc32(&bytes[..body_end]);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let record = WalRecord::decode_payload(record_type, &bytes[HEADER_SIZE..body_end])?;
        self.offset += total_len as u64;
        Ok(Some((start, record)))
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Two-pass replay of committed batches.
///
/// The first pass remembers which batches committed; the second hands the
/// mutations of those batches, in log order, to a callback. Memory use is
/// proportional to the number of batches, not to the log size.
#[derive(Debug, Default)]
pub struct StreamingRecovery {
    checkpoint_batch: BatchId,
    committed: HashSet<BatchId>,
    max_batch: BatchId,
}

impl StreamingRecovery {
    /// Creates a recovery that skips batches at or below `checkpoint_batch`,
    /// which are already part of the snapshot.
    #[must_use]
    pub fn new(checkpoint_batch: BatchId) -> Self {
        Self {
            checkpoint_batch,
            committed: HashSet::new(),
            max_batch: checkpoint_batch,
        }
    }

    /// First pass: finds the committed batches.
    ///
    /// # Errors
    ///
    /// Returns the first corruption error from the log.
    pub fn scan_committed<I>(&mut self, iter: I) -> CoreResult<()>
    where
        I: Iterator<Item = CoreResult<(u64, WalRecord)>>,
    {
        for result in iter {
            let (_, record) = result?;
            self.max_batch = self.max_batch.max(record.batch());
            match record {
                WalRecord::Commit { batch } if batch > self.checkpoint_batch => {
                    self.committed.insert(batch);
                }
                WalRecord::Abort { batch } => {
                    self.committed.remove(&batch);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Second pass: calls `apply` for every mutation of a committed batch.
    ///
    /// Returns the number of mutations applied.
    ///
    /// # Errors
    ///
    /// Returns the first log error or the first error from `apply`.
    pub fn replay<I, F>(&self, iter: I, mut apply: F) -> CoreResult<usize>
    where
        I: Iterator<Item = CoreResult<(u64, WalRecord)>>,
        F: FnMut(BatchId, &[u8]) -> CoreResult<()>,
    {
        let mut applied = 0;
        for result in iter {
            if let (_, WalRecord::Mutation { batch, payload }) = result? {
                if self.committed.contains(&batch) {
                    apply(batch, &payload)?;
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    /// Number of batches found committed.
    #[must_use]
    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }

    /// Highest batch id seen, including the checkpoint.
    #[must_use]
    pub fn max_batch(&self) -> BatchId {
        self.max_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalManager;
    use tessera_storage::InMemoryBackend;

    fn mutation(batch: BatchId, byte: u8) -> WalRecord {
        WalRecord::Mutation {
            batch,
            payload: vec![byte],
        }
    }

    fn wal_bytes(records: &[WalRecord]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|r| WalManager::encode_record(r).unwrap())
            .collect()
    }

    fn replay(wal: &WalManager, checkpoint: BatchId) -> CoreResult<Vec<(BatchId, u8)>> {
        let mut recovery = StreamingRecovery::new(checkpoint);
        recovery.scan_committed(wal.iter()?)?;
        let mut seen = Vec::new();
        recovery.replay(wal.iter()?, |batch, payload| {
            seen.push((batch, payload[0]));
            Ok(())
        })?;
        Ok(seen)
    }

    #[test]
    fn only_committed_batches_replay() {
        let bytes = wal_bytes(&[
            WalRecord::Begin { batch: 1 },
            mutation(1, 10),
            WalRecord::Commit { batch: 1 },
            WalRecord::Begin { batch: 2 },
            mutation(2, 20),
            WalRecord::Begin { batch: 3 },
            mutation(3, 30),
            WalRecord::Commit { batch: 3 },
        ]);
        let wal = WalManager::new(Box::new(InMemoryBackend::with_data(bytes)), false);
        assert_eq!(replay(&wal, 0).unwrap(), vec![(1, 10), (3, 30)]);
    }

    #[test]
    fn checkpointed_batches_are_skipped() {
        let bytes = wal_bytes(&[
            WalRecord::Begin { batch: 4 },
            mutation(4, 1),
            WalRecord::Commit { batch: 4 },
            WalRecord::Begin { batch: 5 },
            mutation(5, 2),
            WalRecord::Commit { batch: 5 },
        ]);
        let wal = WalManager::new(Box::new(InMemoryBackend::with_data(bytes)), false);
        assert_eq!(replay(&wal, 4).unwrap(), vec![(5, 2)]);
    }

    #[test]
    fn truncated_tail_is_end_of_log() {
        let mut bytes = wal_bytes(&[
            WalRecord::Begin { batch: 1 },
            mutation(1, 7),
            WalRecord::Commit { batch: 1 },
        ]);
        let tail = WalManager::encode_record(&WalRecord::Begin { batch: 2 }).unwrap();
        bytes.extend_from_slice(&tail[..tail.len() - 3]);

        let wal = WalManager::new(Box::new(InMemoryBackend::with_data(bytes)), false);
        assert_eq!(replay(&wal, 0).unwrap(), vec![(1, 7)]);
    }

    #[test]
    fn crc_mismatch_is_fatal() {
        let mut bytes = wal_bytes(&[WalRecord::Begin { batch: 1 }, mutation(1, 7)]);
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;

        let wal = WalManager::new(Box::new(InMemoryBackend::with_data(bytes)), false);
        assert!(matches!(
            replay(&wal, 0),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut bytes = wal_bytes(&[WalRecord::Begin { batch: 1 }]);
        bytes[0] = b'X';
        let wal = WalManager::new(Box::new(InMemoryBackend::with_data(bytes)), false);
        assert!(matches!(
            wal.read_all(),
            Err(CoreError::WalCorruption { .. })
        ));
    }
}
