//! Persistent, volume-wide parameters and allocation bookkeeping.
//!
//! `VolumeDescriptor` is written once at `create_volume` and never again.
//! `VolumeControlData` is rewritten on every successful commit.

use crate::bitset::BitSet;
use crate::config::VolumeConfig;
use crate::error::Error;

pub const VOLUME_VERIFICATION_CODE: u32 = 0x5FA7_C0DE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub verification_code: u32,
    pub cluster_size: u32,
    pub block_size: u32,
    pub clusters_per_block: u32,
    pub max_blocks: u32,
    pub first_file_data_block_index: u32,
    pub fdr_record_size: u32,
}

impl VolumeDescriptor {
    pub fn from_config(config: &VolumeConfig, fdr_record_size: u32) -> Self {
        Self {
            verification_code: VOLUME_VERIFICATION_CODE,
            cluster_size: config.cluster_size,
            block_size: config.block_size,
            clusters_per_block: config.clusters_per_block(),
            max_blocks: config.max_blocks,
            first_file_data_block_index: config.first_file_data_block_index,
            fdr_record_size,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verification_code == VOLUME_VERIFICATION_CODE
    }
}

/// Mutable, persistent volume state: which blocks exist, the block-virtualization map,
/// and a pointer to any in-flight transaction.
#[derive(Debug, Clone)]
pub struct VolumeControlData {
    pub allocated_blocks: BitSet,
    pub allocated_count: u32,
    pub generation: u64,
    pub has_pending_transaction: bool,
    /// `phys_map[v]` = physical slot for virtual block `v`; length `max_blocks + 1`,
    /// the last slot is always the scratch index.
    pub phys_map: Vec<u32>,
    pub scratch_index: u32,
}

impl VolumeControlData {
    pub fn new(max_blocks: u32) -> Self {
        let mut phys_map = Vec::with_capacity(max_blocks as usize);
        for i in 0..max_blocks {
            phys_map.push(i);
        }
        Self {
            allocated_blocks: BitSet::new(max_blocks),
            allocated_count: 0,
            generation: 0,
            has_pending_transaction: false,
            phys_map,
            scratch_index: max_blocks,
        }
    }

    pub fn is_block_allocated(&self, virtual_block: u32) -> bool {
        virtual_block < self.allocated_blocks.size() && self.allocated_blocks.get(virtual_block)
    }

    pub fn physical_of(&self, virtual_block: u32) -> Option<u32> {
        self.phys_map.get(virtual_block as usize).copied()
    }

    /// Swaps `scratch_index` into the virtual map at `virtual_block`, and recycles the
    /// block's former physical slot as the new scratch.
    pub fn swap_scratch_into(&mut self, virtual_block: u32) {
        let old_physical = self.phys_map[virtual_block as usize];
        self.phys_map[virtual_block as usize] = self.scratch_index;
        self.scratch_index = old_physical;
        self.generation += 1;
    }

    pub fn mark_allocated(&mut self, virtual_block: u32) {
        if !self.allocated_blocks.get(virtual_block) {
            self.allocated_blocks.set(virtual_block, true);
            self.allocated_count += 1;
        }
    }

    /// Byte length of [`serialize`](Self::serialize)'s output for a volume with
    /// `max_blocks` bulk blocks — used by callers to size a read buffer before the
    /// control data has been loaded.
    pub fn serialized_len(max_blocks: u32) -> usize {
        4 + 8 + 4 + 4 + max_blocks as usize * 4
    }

    /// Persists everything except `allocated_blocks`, which is re-derived from
    /// `allocated_count` on load since blocks are always allocated in index order.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::serialized_len(self.phys_map.len() as u32));
        buf.extend_from_slice(&self.allocated_count.to_le_bytes());
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf.extend_from_slice(&(self.has_pending_transaction as u32).to_le_bytes());
        buf.extend_from_slice(&self.scratch_index.to_le_bytes());
        for &p in &self.phys_map {
            buf.extend_from_slice(&p.to_le_bytes());
        }
        buf
    }

    pub fn deserialize(bytes: &[u8], max_blocks: u32) -> Result<Self, Error> {
        if bytes.len() < Self::serialized_len(max_blocks) {
            return Err(Error::Fatal("volume control data truncated"));
        }
        let allocated_count = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let generation = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let has_pending_transaction = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) != 0;
        let scratch_index = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let mut phys_map = Vec::with_capacity(max_blocks as usize);
        let mut cursor = 20usize;
        for _ in 0..max_blocks {
            phys_map.push(u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()));
            cursor += 4;
        }
        let mut allocated_blocks = BitSet::new(max_blocks);
        for i in 0..allocated_count.min(max_blocks) {
            allocated_blocks.set(i, true);
        }
        Ok(Self {
            allocated_blocks,
            allocated_count,
            generation,
            has_pending_transaction,
            phys_map,
            scratch_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_from_default_config_is_verified() {
        let cfg = VolumeConfig::default();
        let desc = VolumeDescriptor::from_config(&cfg, 64);
        assert!(desc.is_verified());
        assert_eq!(desc.verification_code, 0x5FA7_C0DE);
    }

    #[test]
    fn scratch_swap_recycles_old_physical() {
        let mut control = VolumeControlData::new(4);
        assert_eq!(control.scratch_index, 4);
        let old_physical = control.phys_map[1];
        control.swap_scratch_into(1);
        assert_eq!(control.phys_map[1], 4);
        assert_eq!(control.scratch_index, old_physical);
        assert_eq!(control.generation, 1);
    }

    #[test]
    fn mark_allocated_is_idempotent() {
        let mut control = VolumeControlData::new(4);
        control.mark_allocated(0);
        control.mark_allocated(0);
        assert_eq!(control.allocated_count, 1);
    }

    #[test]
    fn serialize_deserialize_roundtrips() {
        let mut control = VolumeControlData::new(4);
        control.mark_allocated(0);
        control.mark_allocated(1);
        control.swap_scratch_into(0);
        let bytes = control.serialize();
        let restored = VolumeControlData::deserialize(&bytes, 4).unwrap();
        assert_eq!(restored.allocated_count, control.allocated_count);
        assert_eq!(restored.generation, control.generation);
        assert_eq!(restored.scratch_index, control.scratch_index);
        assert_eq!(restored.phys_map, control.phys_map);
        assert!(restored.is_block_allocated(0));
        assert!(restored.is_block_allocated(1));
        assert!(!restored.is_block_allocated(2));
    }
}
