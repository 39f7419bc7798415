//! `ClusterDataCache` — the single in-memory image of one bulk block.
//!
//! Holds the whole 256 MiB block as one buffer split into 256 KiB chunks, so commit can
//! skip any chunk nothing touched. Only one block is ever resident; switching to a
//! different virtual block requires committing or discarding the current one first
//! (`DataBlockManager` enforces that).

use crate::bitset::BitSet;
use crate::storage::{read_err, LowLevelStorage, Result};

pub struct ClusterDataCache {
    block_size: u32,
    chunk_size: u32,
    cluster_size: u32,
    buffer: Vec<u8>,
    changed_chunks: BitSet,
    cached_block_index: Option<u32>,
    in_sync: bool,
    /// Snapshot, taken at `load_block`, of which clusters in this block were free
    /// *before* the transaction started; defrag needs both this and the final bitmap.
    pub initial_free_clusters: BitSet,
}

impl ClusterDataCache {
    pub fn new(block_size: u32, chunk_size: u32, cluster_size: u32) -> Self {
        let chunks_per_block = block_size / chunk_size;
        let clusters_per_block = block_size / cluster_size;
        Self {
            block_size,
            chunk_size,
            cluster_size,
            buffer: vec![0u8; block_size as usize],
            changed_chunks: BitSet::new(chunks_per_block),
            cached_block_index: None,
            in_sync: true,
            initial_free_clusters: BitSet::new(clusters_per_block),
        }
    }

    pub fn cached_block_index(&self) -> Option<u32> {
        self.cached_block_index
    }

    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn changed_chunks(&self) -> &BitSet {
        &self.changed_chunks
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    fn chunks_per_block(&self) -> u32 {
        self.block_size / self.chunk_size
    }

    /// Loads `block_idx`'s physical data: chunks overlapping any currently-allocated
    /// cluster are read from storage, the rest are filled with a debug pattern
    /// (`0x80 | (block_idx & 0x3F)`) rather than zero, so an unread region is visibly
    /// distinguishable from a genuinely zeroed one while reading a trace.
    pub fn load_block(
        &mut self,
        storage: &dyn LowLevelStorage,
        block_idx: u32,
        physical_block_index: u32,
        currently_free_clusters: BitSet,
    ) -> Result<()> {
        self.initial_free_clusters = currently_free_clusters;
        self.changed_chunks.set_all(false);

        let clusters_per_chunk = self.chunk_size / self.cluster_size;
        let fill_byte = 0x80u8 | ((block_idx & 0x3F) as u8);
        let physical_base = physical_block_index as u64 * self.block_size as u64;

        for chunk_idx in 0..self.chunks_per_block() {
            let chunk_start_cluster = chunk_idx * clusters_per_chunk;
            let needs_read = (0..clusters_per_chunk).any(|i| {
                let cluster = chunk_start_cluster + i;
                cluster < self.initial_free_clusters.size() && !self.initial_free_clusters.get(cluster)
            });
            let byte_start = (chunk_idx * self.chunk_size) as usize;
            let byte_end = byte_start + self.chunk_size as usize;
            if needs_read {
                let offset = physical_base + byte_start as u64;
                storage
                    .pread(&mut self.buffer[byte_start..byte_end], offset)
                    .map_err(|_| read_err(offset, self.chunk_size as usize))?;
            } else {
                self.buffer[byte_start..byte_end].fill(fill_byte);
            }
        }

        self.cached_block_index = Some(block_idx);
        self.in_sync = true;
        Ok(())
    }

    pub fn read_cluster(&self, buf: &mut [u8], local_byte_offset: u32) {
        let start = local_byte_offset as usize;
        let end = start + self.cluster_size as usize;
        buf.copy_from_slice(&self.buffer[start..end]);
    }

    pub fn write_cluster(&mut self, buf: &[u8], local_byte_offset: u32) {
        let start = local_byte_offset as usize;
        let end = start + self.cluster_size as usize;
        self.buffer[start..end].copy_from_slice(buf);
        let chunk_idx = local_byte_offset / self.chunk_size;
        self.changed_chunks.set(chunk_idx, true);
        self.in_sync = false;
    }

    pub fn mark_synced(&mut self) {
        self.in_sync = true;
        self.changed_chunks.set_all(false);
    }

    pub fn discard(&mut self) {
        self.cached_block_index = None;
        self.in_sync = true;
        self.changed_chunks.set_all(false);
    }
}

pub fn local_byte_offset(local_cluster_index: u32, cluster_size: u32) -> u32 {
    local_cluster_index * cluster_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStorage;
    use std::sync::Arc;

    fn small_cache() -> ClusterDataCache {
        ClusterDataCache::new(1024, 256, 64)
    }

    #[test]
    fn write_then_read_roundtrips_in_memory() {
        let mut cache = small_cache();
        cache.cached_block_index = Some(0);
        let payload = vec![0xAAu8; 64];
        cache.write_cluster(&payload, 0);
        let mut out = vec![0u8; 64];
        cache.read_cluster(&mut out, 0);
        assert_eq!(out, payload);
        assert!(!cache.in_sync());
    }

    #[test]
    fn write_marks_correct_chunk_dirty() {
        let mut cache = small_cache();
        cache.write_cluster(&[1u8; 64], 256);
        assert!(cache.changed_chunks().get(1));
        assert!(!cache.changed_chunks().get(0));
    }

    #[test]
    fn load_block_fills_free_regions_with_debug_pattern() {
        let storage = MemoryStorage::new(1024);
        let mut cache = small_cache();
        let mut free = BitSet::new(16); // 1024/64
        free.set_all(true);
        cache.load_block(&storage, 3, 0, free).unwrap();
        let expected = 0x80 | (3 & 0x3F);
        assert!(cache.buffer().iter().all(|&b| b == expected as u8));
    }

    #[test]
    fn load_block_reads_allocated_chunks_from_storage() {
        let storage = Arc::new(MemoryStorage::new(1024));
        storage.pwrite(&[0x11u8; 256], 0).unwrap();
        let mut cache = small_cache();
        let mut free = BitSet::new(16);
        free.set_all(true);
        free.set(0, false); // cluster 0 allocated -> chunk 0 needs a real read
        cache.load_block(storage.as_ref(), 0, 0, free).unwrap();
        assert_eq!(&cache.buffer()[0..256], &[0x11u8; 256][..]);
        let expected_fill = 0x80u8;
        assert_eq!(cache.buffer()[256], expected_fill);
    }
}
