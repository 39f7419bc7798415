//! Per-block control metadata: which clusters are free, and the CRC-32 protecting the
//! block's FAT table against silent corruption.

use crate::bitset::BitSet;
use crate::error::Error;

#[derive(Debug, Clone)]
pub struct BlockControlData {
    pub free_clusters: BitSet,
    pub free_count: u32,
    pub fat_crc32: u32,
}

impl BlockControlData {
    /// A freshly allocated block: every cluster free, CRC not yet computed.
    pub fn new_empty(clusters_per_block: u32) -> Self {
        let mut free_clusters = BitSet::new(clusters_per_block);
        free_clusters.set_all(true);
        Self {
            free_clusters,
            free_count: clusters_per_block,
            fat_crc32: 0,
        }
    }

    pub fn mark_allocated(&mut self, cluster_local_index: u32) {
        if self.free_clusters.get(cluster_local_index) {
            self.free_clusters.set(cluster_local_index, false);
            self.free_count -= 1;
        }
    }

    pub fn mark_free(&mut self, cluster_local_index: u32) {
        if !self.free_clusters.get(cluster_local_index) {
            self.free_clusters.set(cluster_local_index, true);
            self.free_count += 1;
        }
    }

    pub fn is_full(&self) -> bool {
        self.free_count == 0
    }

    /// Byte length of [`serialize`](Self::serialize)'s output for a block with
    /// `clusters_per_block` clusters.
    pub fn serialized_len(clusters_per_block: u32) -> usize {
        BitSet::serialized_len(clusters_per_block) + 4 + 4
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.free_clusters.to_bytes();
        buf.extend_from_slice(&self.free_count.to_le_bytes());
        buf.extend_from_slice(&self.fat_crc32.to_le_bytes());
        buf
    }

    pub fn deserialize(bytes: &[u8], clusters_per_block: u32) -> Result<Self, Error> {
        let bitset_len = BitSet::serialized_len(clusters_per_block);
        if bytes.len() < bitset_len + 8 {
            return Err(Error::Fatal("block control data truncated"));
        }
        let free_clusters =
            BitSet::from_bytes(&bytes[..bitset_len]).ok_or(Error::Fatal("block control free bitmap truncated"))?;
        let free_count = u32::from_le_bytes(bytes[bitset_len..bitset_len + 4].try_into().unwrap());
        let fat_crc32 = u32::from_le_bytes(bytes[bitset_len + 4..bitset_len + 8].try_into().unwrap());
        Ok(Self {
            free_clusters,
            free_count,
            fat_crc32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_block_is_fully_free() {
        let bcd = BlockControlData::new_empty(32768);
        assert_eq!(bcd.free_count, 32768);
        assert!(!bcd.is_full());
    }

    #[test]
    fn allocate_and_free_roundtrip() {
        let mut bcd = BlockControlData::new_empty(16);
        bcd.mark_allocated(3);
        assert_eq!(bcd.free_count, 15);
        assert!(!bcd.free_clusters.get(3));
        bcd.mark_free(3);
        assert_eq!(bcd.free_count, 16);
        assert!(bcd.free_clusters.get(3));
    }

    #[test]
    fn serialize_deserialize_roundtrips() {
        let mut bcd = BlockControlData::new_empty(64);
        bcd.mark_allocated(10);
        bcd.fat_crc32 = 0xCAFE_BABE;
        let bytes = bcd.serialize();
        assert_eq!(bytes.len(), BlockControlData::serialized_len(64));
        let restored = BlockControlData::deserialize(&bytes, 64).unwrap();
        assert_eq!(restored.free_count, bcd.free_count);
        assert_eq!(restored.fat_crc32, bcd.fat_crc32);
        assert_eq!(restored.free_clusters, bcd.free_clusters);
    }
}
