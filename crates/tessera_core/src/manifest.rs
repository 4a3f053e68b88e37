//! Database manifest.

use crate::error::{CoreError, CoreResult};
use crate::wal::{compute_crc32, BatchId};
use uuid::Uuid;

/// Magic bytes for the manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"TMFN";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

/// Encoded size: magic, version, format version, store id, checkpoint, crc.
const MANIFEST_SIZE: usize = 4 + 2 + 4 + 16 + 8 + 4;

/// Durable database identity and checkpoint position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Format version (major, minor).
    pub format_version: (u16, u16),
    /// Identity of the store, stable across restarts and kept by backups.
    pub store_id: Uuid,
    /// Last batch included in the snapshot.
    pub last_checkpoint: BatchId,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new(Uuid::new_v4())
    }
}

impl Manifest {
    /// Creates a manifest for a new store.
    #[must_use]
    pub fn new(store_id: Uuid) -> Self {
        Self {
            format_version: (1, 0),
            store_id,
            last_checkpoint: 0,
        }
    }

    /// Encodes the manifest to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MANIFEST_SIZE);
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.format_version.0.to_le_bytes());
        buf.extend_from_slice(&self.format_version.1.to_le_bytes());
        buf.extend_from_slice(self.store_id.as_bytes());
        buf.extend_from_slice(&self.last_checkpoint.to_le_bytes());
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a manifest from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] for a foreign or damaged file.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 4 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::invalid_format("invalid manifest magic"));
        }
        if data.len() != MANIFEST_SIZE {
            return Err(CoreError::invalid_format(format!(
                "manifest has {} bytes, expected {MANIFEST_SIZE}",
                data.len()
            )));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > MANIFEST_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }

        let body_end = MANIFEST_SIZE - 4;
        let stored = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        let computed = compute_crc32(&data[..body_end]);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let major = u16::from_le_bytes([data[6], data[7]]);
        let minor = u16::from_le_bytes([data[8], data[9]]);
        let mut id = [0u8; 16];
        id.copy_from_slice(&data[10..26]);
        let mut checkpoint = [0u8; 8];
        checkpoint.copy_from_slice(&data[26..34]);

        Ok(Self {
            format_version: (major, minor),
            store_id: Uuid::from_bytes(id),
            last_checkpoint: u64::from_le_bytes(checkpoint),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let mut manifest = Manifest::default();
        manifest.last_checkpoint = 77;
        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn rejects_foreign_bytes() {
        assert!(Manifest::decode(b"EMFN....").is_err());
        assert!(Manifest::decode(&[]).is_err());
    }

    #[test]
    fn detects_damage() {
        let mut bytes = Manifest::default().encode();
        bytes[12] ^= 1;
        assert!(matches!(
            Manifest::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }
}
