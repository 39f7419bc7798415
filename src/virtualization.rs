//! Physical-block addressing helpers built on top of `VolumeControlData`'s
//! virtual→physical map.
//!
//! Keeping this as free functions over `&VolumeControlData` (rather than a wrapper type)
//! avoids a second mutable owner of the map — `VolumeControlData` already owns
//! `phys_map`/`scratch_index` and is the thing persisted to the control file.

use crate::volume_descriptor::VolumeControlData;

pub fn physical_byte_offset(physical_block_index: u32, block_size: u32) -> u64 {
    physical_block_index as u64 * block_size as u64
}

pub fn physical_of_virtual(control: &VolumeControlData, virtual_block: u32) -> Option<u32> {
    control.physical_of(virtual_block)
}

pub fn scratch_byte_offset(control: &VolumeControlData, block_size: u32) -> u64 {
    physical_byte_offset(control.scratch_index, block_size)
}

/// The last chunk index that contains any currently-allocated cluster, per the *final*
/// free-cluster bitmap — chunks beyond this never need to be written during commit.
pub fn last_used_chunk(final_free_clusters: &crate::bitset::BitSet, clusters_per_chunk: u32) -> Option<u32> {
    let last_allocated_cluster = final_free_clusters.find_last(false, final_free_clusters.size().saturating_sub(1))?;
    Some(last_allocated_cluster / clusters_per_chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::BitSet;

    #[test]
    fn physical_offset_scales_by_block_size() {
        assert_eq!(physical_byte_offset(3, 256 * 1024 * 1024), 3 * 256 * 1024 * 1024);
    }

    #[test]
    fn last_used_chunk_finds_highest_allocated_cluster_chunk() {
        let mut free = BitSet::new(1024);
        free.set_all(true);
        free.set(100, false);
        assert_eq!(last_used_chunk(&free, 32), Some(100 / 32));
    }

    #[test]
    fn last_used_chunk_none_when_block_fully_free() {
        let mut free = BitSet::new(64);
        free.set_all(true);
        assert_eq!(last_used_chunk(&free, 8), None);
    }
}
