//! Caches whole FAT blocks read from the control area.
//!
//! Entries are kept in an unbounded LRU map exactly the way the teacher crate's
//! `BlockCacheManager` does for its generic block cache — nothing here is evicted except
//! by an explicit `discard`, since FAT blocks for a 24-block volume are cheap to hold all
//! at once and eviction mid-transaction would complicate the commit protocol.

use std::sync::Arc;

use crc::{Crc, CRC_32_ISO_HDLC};
use lru::LruCache;
use spin::Mutex;

use crate::error::{Error, IntegrityError, UsageError};
use crate::fat_cell::FatCellValue;
use crate::storage::LowLevelStorage;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CELL_BYTES: usize = 8;

struct FatBlockEntry {
    cells: Vec<FatCellValue>,
    dirty: bool,
}

/// One FAT block's worth of cells, serialized as `prev:u32 next:u32` pairs, little-endian.
fn serialize(cells: &[FatCellValue]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cells.len() * CELL_BYTES);
    for cell in cells {
        bytes.extend_from_slice(&cell.raw_prev().to_le_bytes());
        bytes.extend_from_slice(&cell.raw_next().to_le_bytes());
    }
    bytes
}

fn deserialize(bytes: &[u8]) -> Vec<FatCellValue> {
    bytes
        .chunks_exact(CELL_BYTES)
        .map(|chunk| {
            let prev = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
            let next = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
            FatCellValue::new(prev, next)
        })
        .collect()
}

pub fn crc32_of(cells: &[FatCellValue]) -> u32 {
    CRC32.checksum(&serialize(cells))
}

/// Caches FAT blocks from the control area's FAT region, one `LruCache` slot per block
/// index. Callers pass in each block's byte offset and expected CRC-32 on every access;
/// the volume manager owns that layout, this cache only knows how to serialize/verify it.
pub struct FatBlockCache {
    storage: Arc<dyn LowLevelStorage>,
    clusters_per_block: u32,
    entries: Mutex<LruCache<u32, FatBlockEntry>>,
}

impl FatBlockCache {
    pub fn new(storage: Arc<dyn LowLevelStorage>, clusters_per_block: u32) -> Self {
        Self {
            storage,
            clusters_per_block,
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    fn fat_block_len_bytes(&self) -> usize {
        self.clusters_per_block as usize * CELL_BYTES
    }

    fn ensure_loaded(&self, block_index: u32, byte_offset: u64, expected_crc32: u32) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        if entries.contains(&block_index) {
            return Ok(());
        }
        let mut buf = vec![0u8; self.fat_block_len_bytes()];
        self.storage.pread(&mut buf, byte_offset)?;
        let cells = deserialize(&buf);
        let actual_crc32 = crc32_of(&cells);
        if actual_crc32 != expected_crc32 {
            return Err(IntegrityError::FatBlockCrc { block_index }.into());
        }
        entries.put(
            block_index,
            FatBlockEntry {
                cells,
                dirty: false,
            },
        );
        Ok(())
    }

    pub fn get_cell(
        &self,
        block_index: u32,
        local_cluster_index: u32,
        byte_offset: u64,
        expected_crc32: u32,
    ) -> Result<FatCellValue, Error> {
        self.ensure_loaded(block_index, byte_offset, expected_crc32)?;
        let mut entries = self.entries.lock();
        let entry = entries.get(&block_index).expect("just loaded");
        entry
            .cells
            .get(local_cluster_index as usize)
            .copied()
            .ok_or_else(|| UsageError::InvalidClusterIndex(local_cluster_index).into())
    }

    pub fn set_cell(
        &self,
        block_index: u32,
        local_cluster_index: u32,
        value: FatCellValue,
        byte_offset: u64,
        expected_crc32: u32,
    ) -> Result<(), Error> {
        self.ensure_loaded(block_index, byte_offset, expected_crc32)?;
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&block_index).expect("just loaded");
        let slot = entry
            .cells
            .get_mut(local_cluster_index as usize)
            .ok_or(UsageError::InvalidClusterIndex(local_cluster_index))?;
        *slot = value;
        entry.dirty = true;
        Ok(())
    }

    /// Serializes every dirty block and clears its dirty flag, returning
    /// `(block_index, bytes, crc32)` for each so the caller can carry them through the
    /// transaction log and write them to their home offset as part of applying the
    /// commit — this cache never writes FAT bytes to storage itself.
    pub fn flush(&self) -> Vec<(u32, Vec<u8>, u32)> {
        let mut entries = self.entries.lock();
        let mut flushed = Vec::new();
        for (&block_index, entry) in entries.iter_mut() {
            if !entry.dirty {
                continue;
            }
            let bytes = serialize(&entry.cells);
            let crc32 = CRC32.checksum(&bytes);
            entry.dirty = false;
            flushed.push((block_index, bytes, crc32));
        }
        flushed
    }

    /// Drops all cached entries without writing anything back.
    pub fn discard(&self) {
        self.entries.lock().clear();
    }

    pub fn has_dirty_blocks(&self) -> bool {
        self.entries.lock().iter().any(|(_, e)| e.dirty)
    }

    /// Seeds a freshly allocated block's cache entry with all-free cells, without
    /// touching storage — used right after `allocate_block`.
    pub fn seed_empty_block(&self, block_index: u32) {
        let cells = vec![FatCellValue::free_cell_value(); self.clusters_per_block as usize];
        self.entries.lock().put(
            block_index,
            FatBlockEntry {
                cells,
                dirty: true,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStorage;

    fn cache_with(storage: Arc<dyn LowLevelStorage>) -> FatBlockCache {
        FatBlockCache::new(storage, 8)
    }

    #[test]
    fn seeded_block_reads_back_free_cells() {
        let storage: Arc<dyn LowLevelStorage> = Arc::new(MemoryStorage::new(4096));
        let cache = cache_with(storage);
        cache.seed_empty_block(0);
        let cell = cache.get_cell(0, 3, 0, 0).unwrap();
        assert!(cell.is_free_cluster());
    }

    #[test]
    fn set_then_flush_then_reload_roundtrips() {
        let storage: Arc<dyn LowLevelStorage> = Arc::new(MemoryStorage::new(4096));
        let cache = cache_with(Arc::clone(&storage));
        cache.seed_empty_block(0);
        let mut value = FatCellValue::single_element_cluster_chain_value();
        value.encode_crc(0xBEEF);
        cache.set_cell(0, 2, value, 0, 0).unwrap();
        let flushed = cache.flush();
        assert_eq!(flushed.len(), 1);
        let (_, bytes, crc) = &flushed[0];
        // Flushing only serializes; the caller is responsible for writing the bytes to
        // their home offset as part of applying the transaction.
        storage.pwrite(bytes, 0).unwrap();

        let cache2 = cache_with(storage);
        let reloaded = cache2.get_cell(0, 2, 0, *crc).unwrap();
        assert_eq!(reloaded, value);
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let storage: Arc<dyn LowLevelStorage> = Arc::new(MemoryStorage::new(4096));
        let cache = cache_with(storage);
        let err = cache.get_cell(0, 0, 0, 0xDEAD_BEEF).unwrap_err();
        match err {
            Error::Integrity(IntegrityError::FatBlockCrc { block_index }) => assert_eq!(block_index, 0),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
