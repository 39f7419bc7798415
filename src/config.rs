//! Construction-time configuration surface.
//!
//! Mirrors the original's `DefaultSetupValues` (cluster/chunk/block sizes) while making
//! the policy switches (`enable_defragmentation`, ...) construction-time fields instead
//! of compile-time `#define`s, since the spec calls them out as configurable per volume.

use crate::error::{Error, UsageError};

/// Hard upper bound on `max_blocks`: a FAT cell's cluster-index field is 22 bits wide,
/// so `max_blocks * clusters_per_block` must stay below `1 << 22`.
pub const CLUSTER_INDEX_BITS: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeConfig {
    pub cluster_size: u32,
    pub chunk_size: u32,
    pub block_size: u32,
    pub max_blocks: u32,
    pub first_file_data_block_index: u32,
    pub enable_defragmentation: bool,
    pub enable_per_cluster_crc: bool,
    pub enable_block_initialization_on_alloc: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            cluster_size: 8 * 1024,
            chunk_size: 256 * 1024,
            block_size: 256 * 1024 * 1024,
            max_blocks: 24,
            first_file_data_block_index: 1,
            enable_defragmentation: true,
            enable_per_cluster_crc: true,
            enable_block_initialization_on_alloc: false,
        }
    }
}

impl VolumeConfig {
    pub fn clusters_per_block(&self) -> u32 {
        self.block_size / self.cluster_size
    }

    pub fn chunks_per_block(&self) -> u32 {
        self.block_size / self.chunk_size
    }

    pub fn clusters_per_chunk(&self) -> u32 {
        self.chunk_size / self.cluster_size
    }

    /// Validates internal consistency: power-of-two sizes, divisibility, and that the
    /// configured block/cluster geometry fits inside the 22-bit cluster-index space.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.cluster_size.is_power_of_two() || self.cluster_size == 0 {
            return Err(UsageError::InvalidConfig("cluster_size must be a nonzero power of two").into());
        }
        if !self.chunk_size.is_power_of_two() || self.chunk_size == 0 {
            return Err(UsageError::InvalidConfig("chunk_size must be a nonzero power of two").into());
        }
        if !self.block_size.is_power_of_two() || self.block_size == 0 {
            return Err(UsageError::InvalidConfig("block_size must be a nonzero power of two").into());
        }
        if self.block_size % self.chunk_size != 0 {
            return Err(UsageError::InvalidConfig("block_size must be a multiple of chunk_size").into());
        }
        if self.chunk_size % self.cluster_size != 0 {
            return Err(UsageError::InvalidConfig("chunk_size must be a multiple of cluster_size").into());
        }
        if self.max_blocks == 0 {
            return Err(UsageError::InvalidConfig("max_blocks must be nonzero").into());
        }
        let total_clusters = (self.max_blocks as u64) * (self.clusters_per_block() as u64);
        if total_clusters >= (1u64 << CLUSTER_INDEX_BITS) {
            return Err(UsageError::InvalidConfig(
                "max_blocks * clusters_per_block exceeds the 22-bit cluster index space",
            )
            .into());
        }
        if self.first_file_data_block_index != 1 {
            return Err(UsageError::InvalidConfig(
                "first_file_data_block_index must be 1 (block 0 is the control-area directory block)",
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        VolumeConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_cluster_size() {
        let mut cfg = VolumeConfig::default();
        cfg.cluster_size = 8000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversized_volume() {
        let mut cfg = VolumeConfig::default();
        cfg.max_blocks = u32::MAX;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn geometry_helpers() {
        let cfg = VolumeConfig::default();
        assert_eq!(cfg.clusters_per_block(), 32768);
        assert_eq!(cfg.chunks_per_block(), 1024);
        assert_eq!(cfg.clusters_per_chunk(), 32);
    }
}
