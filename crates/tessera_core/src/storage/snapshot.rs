//! Snapshot framing for checkpointed tables.
//!
//! ```text
//! | magic "TSNP" (4) | version (2) | last batch (8) | length (8) | CBOR tables (N) | crc32 (4) |
//! ```

use crate::error::{CoreError, CoreResult};
use crate::storage::tables::Tables;
use crate::wal::{compute_crc32, BatchId};

/// Magic bytes for snapshot files.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"TSNP";

/// Current snapshot version.
pub const SNAPSHOT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 8 + 8;

/// Encodes the tables as of `last_batch`.
///
/// # Errors
///
/// Returns [`CoreError::Cbor`] if the tables cannot be serialized.
pub fn encode(tables: &Tables, last_batch: BatchId) -> CoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(tables, &mut payload).map_err(CoreError::cbor)?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(&SNAPSHOT_MAGIC);
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buf.extend_from_slice(&last_batch.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Decodes a snapshot into its tables and last batch.
///
/// An empty input is an empty store. Derived orderings are rebuilt.
///
/// # Errors
///
/// Returns [`CoreError::SnapshotCorruption`] or
/// [`CoreError::ChecksumMismatch`] for damaged input.
pub fn decode(bytes: &[u8]) -> CoreResult<(Tables, BatchId)> {
    if bytes.is_empty() {
        return Ok((Tables::default(), 0));
    }
    if bytes.len() < HEADER_SIZE + 4 || bytes[0..4] != SNAPSHOT_MAGIC {
        return Err(CoreError::snapshot_corruption("invalid snapshot header"));
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version > SNAPSHOT_VERSION {
        return Err(CoreError::snapshot_corruption(format!(
            "unsupported snapshot version {version}"
        )));
    }

    let last_batch = read_u64(&bytes[6..14]);
    let len = usize::try_from(read_u64(&bytes[14..22]))
        .map_err(|_| CoreError::snapshot_corruption("snapshot length overflow"))?;
    if bytes.len() != HEADER_SIZE + len + 4 {
        return Err(CoreError::snapshot_corruption(format!(
            "snapshot length {} does not match header length {len}",
            bytes.len()
        )));
    }

    let body_end = HEADER_SIZE + len;
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

    let mut tables: Tables = ciborium::de::from_reader(&bytes[HEADER_SIZE..body_end])
        .map_err(|e| CoreError::snapshot_corruption(format!("undecodable tables: {e}")))?;
    tables.rebuild_derived();
    Ok((tables, last_batch))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etag::Etag;
    use crate::storage::mutation::Mutation;
    use crate::types::{JsonDocument, JsonObject};

    fn tables_with_doc() -> Tables {
        let mut tables = Tables::default();
        tables.apply(Mutation::PutDocument(JsonDocument {
            key: "a".into(),
            data: JsonObject::new(),
            metadata: JsonObject::new(),
            etag: Etag::new(1, 1),
            last_modified_ms: 0,
            non_authoritative_information: false,
        }));
        tables.apply(Mutation::SetIdentity {
            name: "users".into(),
            value: 3,
        });
        tables
    }

    #[test]
    fn decode_rebuilds_etag_order() {
        let bytes = encode(&tables_with_doc(), 42).unwrap();
        let (tables, batch) = decode(&bytes).unwrap();
        assert_eq!(batch, 42);
        assert_eq!(tables.last_document_etag(), Some(Etag::new(1, 1)));
        assert_eq!(tables.identities.get("users"), Some(&3));
    }

    #[test]
    fn empty_input_is_empty_store() {
        let (tables, batch) = decode(&[]).unwrap();
        assert!(tables.documents.is_empty());
        assert_eq!(batch, 0);
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut bytes = encode(&tables_with_doc(), 1).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x40;
        assert!(decode(&bytes).is_err());
    }
}
