//! The on-disk transaction-intent log that makes a block-virtualization swap crash-safe.
//!
//! A commit writes this record to a temp file, fsyncs, atomically renames to the final
//! name, applies it, fsyncs again, then deletes the final file. Recovery on open replays
//! the final file if present (the rename already happened, so the swap is committed) or
//! discards the temp file if present without a final (nothing durable referenced it yet).

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{Error, TransactionError};
use crate::storage::LowLevelStorage;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const MAGIC: u32 = 0x5350_4654; // "SPFT"
const VERSION: u32 = 1;

pub const TEMP_FILE_NAME: &str = "txn.tmp";
pub const FINAL_FILE_NAME: &str = "txn.final";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyFatBlock {
    pub block_index: u32,
    pub bytes: Vec<u8>,
    pub crc32: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionIntent {
    pub new_phys_map: Vec<u32>,
    pub new_scratch_index: u32,
    pub dirty_fat_blocks: Vec<DirtyFatBlock>,
}

impl TransactionIntent {
    fn payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.new_phys_map.len() as u32).to_le_bytes());
        for &p in &self.new_phys_map {
            buf.extend_from_slice(&p.to_le_bytes());
        }
        buf.extend_from_slice(&self.new_scratch_index.to_le_bytes());
        buf.extend_from_slice(&(self.dirty_fat_blocks.len() as u32).to_le_bytes());
        for block in &self.dirty_fat_blocks {
            buf.extend_from_slice(&block.block_index.to_le_bytes());
            buf.extend_from_slice(&block.crc32.to_le_bytes());
            buf.extend_from_slice(&(block.bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(&block.bytes);
        }
        buf
    }

    fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let checksum = CRC32.checksum(&payload);
        let mut out = Vec::with_capacity(payload.len() + 12);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 12 {
            return Err(TransactionError::LogCorrupt("truncated header").into());
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let checksum = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if magic != MAGIC {
            return Err(TransactionError::LogCorrupt("bad magic").into());
        }
        if version != VERSION {
            return Err(TransactionError::LogCorrupt("unsupported version").into());
        }
        let payload = &bytes[12..];
        if CRC32.checksum(payload) != checksum {
            return Err(TransactionError::LogCorrupt("payload crc mismatch").into());
        }

        let mut cursor = 0usize;
        let read_u32 = |buf: &[u8], at: &mut usize| -> Result<u32, Error> {
            if *at + 4 > buf.len() {
                return Err(TransactionError::LogCorrupt("truncated field").into());
            }
            let v = u32::from_le_bytes(buf[*at..*at + 4].try_into().unwrap());
            *at += 4;
            Ok(v)
        };

        let map_len = read_u32(payload, &mut cursor)? as usize;
        let mut new_phys_map = Vec::with_capacity(map_len);
        for _ in 0..map_len {
            new_phys_map.push(read_u32(payload, &mut cursor)?);
        }
        let new_scratch_index = read_u32(payload, &mut cursor)?;
        let block_count = read_u32(payload, &mut cursor)? as usize;
        let mut dirty_fat_blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let block_index = read_u32(payload, &mut cursor)?;
            let crc32 = read_u32(payload, &mut cursor)?;
            let len = read_u32(payload, &mut cursor)? as usize;
            if cursor + len > payload.len() {
                return Err(TransactionError::LogCorrupt("truncated fat block payload").into());
            }
            let bytes = payload[cursor..cursor + len].to_vec();
            cursor += len;
            dirty_fat_blocks.push(DirtyFatBlock { block_index, bytes, crc32 });
        }

        Ok(Self {
            new_phys_map,
            new_scratch_index,
            dirty_fat_blocks,
        })
    }
}

/// Drives the write-temp → fsync → rename → (apply by caller) → fsync → delete protocol
/// over a `LowLevelStorage` that represents the control area.
pub struct TransactionLog<'a> {
    storage: &'a dyn LowLevelStorage,
}

impl<'a> TransactionLog<'a> {
    pub fn new(storage: &'a dyn LowLevelStorage) -> Self {
        Self { storage }
    }

    /// Steps 5-6 of the commit sequence: write the intent to a temp file, fsync, then
    /// atomically rename it to the final name.
    pub fn begin(&self, intent: &TransactionIntent) -> Result<(), Error> {
        let bytes = intent.encode();
        self.storage.pwrite(&bytes, 0)?;
        self.storage.fsync()?;
        self.storage.rename(TEMP_FILE_NAME, FINAL_FILE_NAME)?;
        Ok(())
    }

    /// Step 8: after the caller has applied the intent and fsynced the control file,
    /// the final log file is no longer needed.
    pub fn complete(&self) -> Result<(), Error> {
        self.storage.unlink(FINAL_FILE_NAME)
    }

    /// What to do when opening a volume: `Some(intent)` means the final file exists and
    /// must be (re-)applied; `None` means either nothing is pending or only a temp file
    /// (pre-rename) exists and must be discarded.
    pub fn recover(&self) -> Result<Option<TransactionIntent>, Error> {
        if self.storage.exists(FINAL_FILE_NAME) {
            let len = self.storage.stat(FINAL_FILE_NAME)? as usize;
            let mut bytes = vec![0u8; len];
            self.storage.pread(&mut bytes, 0)?;
            return Ok(Some(TransactionIntent::decode(&bytes)?));
        }
        if self.storage.exists(TEMP_FILE_NAME) {
            self.storage.unlink(TEMP_FILE_NAME)?;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStorage;

    fn sample_intent() -> TransactionIntent {
        TransactionIntent {
            new_phys_map: vec![4, 1, 2, 3],
            new_scratch_index: 0,
            dirty_fat_blocks: vec![DirtyFatBlock {
                block_index: 1,
                bytes: vec![0xAB; 32],
                crc32: 0x1234_5678,
            }],
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let intent = sample_intent();
        let encoded = intent.encode();
        let decoded = TransactionIntent::decode(&encoded).unwrap();
        assert_eq!(intent, decoded);
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let intent = sample_intent();
        let mut encoded = intent.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(TransactionIntent::decode(&encoded).is_err());
    }

    #[test]
    fn final_file_present_means_replay() {
        let storage = MemoryStorage::new(4096);
        let log = TransactionLog::new(&storage);
        let intent = sample_intent();
        log.begin(&intent).unwrap();
        let recovered = log.recover().unwrap();
        assert_eq!(recovered, Some(intent));
    }

    #[test]
    fn temp_only_means_discard() {
        let storage = MemoryStorage::new(4096);
        let intent = sample_intent();
        let bytes = intent.encode();
        storage.pwrite(&bytes, 0).unwrap();
        // No rename performed: temp exists, final does not.
        storage.touch(TEMP_FILE_NAME);
        let log = TransactionLog::new(&storage);
        let recovered = log.recover().unwrap();
        assert_eq!(recovered, None);
    }

    #[test]
    fn complete_removes_final_file() {
        let storage = MemoryStorage::new(4096);
        let log = TransactionLog::new(&storage);
        log.begin(&sample_intent()).unwrap();
        log.complete().unwrap();
        assert!(!storage.exists(FINAL_FILE_NAME));
    }
}
