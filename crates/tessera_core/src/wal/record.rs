//! WAL record types and serialization.

use crate::error::{CoreError, CoreResult};

/// Magic bytes identifying a WAL record.
pub const WAL_MAGIC: [u8; 4] = *b"TWAL";

/// Current WAL format version.
pub const WAL_VERSION: u16 = 1;

/// Identifier of a storage batch.
pub type BatchId = u64;

/// Type of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// A batch starts.
    Begin = 1,
    /// One change of a batch.
    Mutation = 2,
    /// The batch committed.
    Commit = 3,
    /// The batch rolled back.
    Abort = 4,
    /// The tables were written to the snapshot.
    Checkpoint = 5,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Mutation),
            3 => Some(Self::Commit),
            4 => Some(Self::Abort),
            5 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A batch starts.
    Begin {
        /// Batch id.
        batch: BatchId,
    },
    /// One change of a batch.
    Mutation {
        /// Batch id.
        batch: BatchId,
        /// CBOR-encoded mutation.
        payload: Vec<u8>,
    },
    /// The batch committed.
    Commit {
        /// Batch id.
        batch: BatchId,
    },
    /// The batch rolled back.
    Abort {
        /// Batch id.
        batch: BatchId,
    },
    /// The tables up to this batch were written to the snapshot.
    Checkpoint {
        /// Last batch contained in the snapshot.
        batch: BatchId,
    },
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Begin { .. } => WalRecordType::Begin,
            Self::Mutation { .. } => WalRecordType::Mutation,
            Self::Commit { .. } => WalRecordType::Commit,
            Self::Abort { .. } => WalRecordType::Abort,
            Self::Checkpoint { .. } => WalRecordType::Checkpoint,
        }
    }

    /// Returns the batch the record belongs to.
    #[must_use]
    pub fn batch(&self) -> BatchId {
        match self {
            Self::Begin { batch }
            | Self::Mutation { batch, .. }
            | Self::Commit { batch }
            | Self::Abort { batch }
            | Self::Checkpoint { batch } => *batch,
        }
    }

    /// Serializes the record payload (without envelope).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&self.batch().to_le_bytes());
        if let Self::Mutation { payload, .. } = self {
            buf.extend_from_slice(payload);
        }
        buf
    }

    /// Deserializes a record from its type and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalCorruption`] if the payload does not fit the
    /// record type.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        if payload.len() < 8 {
            return Err(CoreError::wal_corruption(format!(
                "{record_type:?} record payload too short: {} bytes",
                payload.len()
            )));
        }
        let mut batch_bytes = [0u8; 8];
        batch_bytes.copy_from_slice(&payload[..8]);
        let batch = u64::from_le_bytes(batch_bytes);
        let rest = &payload[8..];

        if record_type != WalRecordType::Mutation && !rest.is_empty() {
            return Err(CoreError::wal_corruption(format!(
                "trailing bytes in {record_type:?} record: {} extra",
                rest.len()
            )));
        }

        Ok(match record_type {
            WalRecordType::Begin => Self::Begin { batch },
            WalRecordType::Mutation => Self::Mutation {
                batch,
                payload: rest.to_vec(),
            },
            WalRecordType::Commit => Self::Commit { batch },
            WalRecordType::Abort => Self::Abort { batch },
            WalRecordType::Checkpoint => Self::Checkpoint { batch },
        })
    }
}

/// Computes a CRC32 (IEEE) checksum.
///
/// Shared by the WAL, snapshot, manifest and backup framings.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_bytes() {
        for t in [
            WalRecordType::Begin,
            WalRecordType::Mutation,
            WalRecordType::Commit,
            WalRecordType::Abort,
            WalRecordType::Checkpoint,
        ] {
            assert_eq!(WalRecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(WalRecordType::from_byte(0), None);
        assert_eq!(WalRecordType::from_byte(9), None);
    }

    #[test]
    fn mutation_keeps_payload() {
        let record = WalRecord::Mutation {
            batch: 12,
            payload: vec![0xA1, 0x61, 0x78, 0x01],
        };
        let payload = record.encode_payload();
        assert_eq!(payload.len(), 12);
        let decoded = WalRecord::decode_payload(WalRecordType::Mutation, &payload).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.batch(), 12);
    }

    #[test]
    fn fixed_records_reject_trailing_bytes() {
        let mut payload = WalRecord::Commit { batch: 3 }.encode_payload();
        payload.push(0);
        assert!(matches!(
            WalRecord::decode_payload(WalRecordType::Commit, &payload),
            Err(CoreError::WalCorruption { .. })
        ));
    }

    #[test]
    fn short_payload_is_corruption() {
        assert!(WalRecord::decode_payload(WalRecordType::Begin, &[1, 2, 3]).is_err());
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }
}
