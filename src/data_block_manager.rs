//! Routes cluster reads/writes to either the control-area directory block or the single
//! cached bulk block. Writing to a virtual block other than the one currently cached goes
//! through `ensure_cached`, which the caller uses to commit whatever was dirty before the
//! switch; reading a non-resident block instead bypasses the cache entirely with a direct
//! read against that block's own physical offset (§4.5), since a read has no reason to
//! evict or commit anything.

use std::sync::Arc;

use crate::bitset::BitSet;
use crate::cluster_cache::ClusterDataCache;
use crate::storage::{read_err, write_err, LowLevelStorage, Result};

pub struct DataBlockManager {
    directory_storage: Arc<dyn LowLevelStorage>,
    bulk_storage: Arc<dyn LowLevelStorage>,
    cluster_size: u32,
    clusters_per_block: u32,
    cache: ClusterDataCache,
}

/// Where a global cluster index routes to.
pub enum ClusterLocation {
    /// Cluster lives in block 0, addressed directly in the control area's directory file.
    ControlArea { byte_offset: u64 },
    /// Cluster lives in bulk block `virtual_block`, at this offset within that block.
    Bulk { virtual_block: u32, local_byte_offset: u32 },
}

pub fn locate_cluster(global_cluster_index: u32, clusters_per_block: u32, cluster_size: u32) -> ClusterLocation {
    if global_cluster_index < clusters_per_block {
        return ClusterLocation::ControlArea {
            byte_offset: global_cluster_index as u64 * cluster_size as u64,
        };
    }
    let bulk_cluster_index = global_cluster_index - clusters_per_block;
    let virtual_block = bulk_cluster_index / clusters_per_block;
    let local_cluster = bulk_cluster_index % clusters_per_block;
    ClusterLocation::Bulk {
        virtual_block,
        local_byte_offset: local_cluster * cluster_size,
    }
}

impl DataBlockManager {
    pub fn new(
        directory_storage: Arc<dyn LowLevelStorage>,
        bulk_storage: Arc<dyn LowLevelStorage>,
        block_size: u32,
        chunk_size: u32,
        cluster_size: u32,
    ) -> Self {
        Self {
            directory_storage,
            bulk_storage,
            cluster_size,
            clusters_per_block: block_size / cluster_size,
            cache: ClusterDataCache::new(block_size, chunk_size, cluster_size),
        }
    }

    pub fn cache(&self) -> &ClusterDataCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ClusterDataCache {
        &mut self.cache
    }

    pub fn bulk_storage(&self) -> &dyn LowLevelStorage {
        self.bulk_storage.as_ref()
    }

    /// Ensures `virtual_block` is the resident block, committing whatever was dirty and
    /// loading the new one's physical content if a switch is needed.
    pub fn ensure_cached<F>(
        &mut self,
        virtual_block: u32,
        physical_block_index: u32,
        currently_free_clusters: BitSet,
        mut commit_current: F,
    ) -> Result<()>
    where
        F: FnMut(&mut ClusterDataCache) -> Result<()>,
    {
        if self.cache.cached_block_index() == Some(virtual_block) {
            return Ok(());
        }
        if self.cache.cached_block_index().is_some() && !self.cache.in_sync() {
            commit_current(&mut self.cache)?;
        }
        self.cache
            .load_block(self.bulk_storage.as_ref(), virtual_block, physical_block_index, currently_free_clusters)
    }

    /// Reads a cluster. `physical_block_index` is the bulk block's current physical slot
    /// (ignored for `ControlArea` reads); it's only consulted when the cluster's virtual
    /// block isn't the one currently resident in the cache, in which case this reads
    /// directly from storage rather than forcing that block into the cache (§4.5 — a read
    /// must never evict or commit the resident block).
    pub fn read_cluster(&mut self, buf: &mut [u8], global_cluster_index: u32, physical_block_index: u32) -> Result<()> {
        match locate_cluster(global_cluster_index, self.clusters_per_block, self.cluster_size) {
            ClusterLocation::ControlArea { byte_offset } => self
                .directory_storage
                .pread(buf, byte_offset)
                .map_err(|_| read_err(byte_offset, buf.len())),
            ClusterLocation::Bulk { virtual_block, local_byte_offset } => {
                if self.cache.cached_block_index() == Some(virtual_block) {
                    self.cache.read_cluster(buf, local_byte_offset);
                    return Ok(());
                }
                let block_size = self.clusters_per_block * self.cluster_size;
                let offset = physical_block_index as u64 * block_size as u64 + local_byte_offset as u64;
                self.bulk_storage.pread(buf, offset).map_err(|_| read_err(offset, buf.len()))
            }
        }
    }

    pub fn write_cluster(&mut self, buf: &[u8], global_cluster_index: u32) -> Result<()> {
        match locate_cluster(global_cluster_index, self.clusters_per_block, self.cluster_size) {
            ClusterLocation::ControlArea { byte_offset } => self
                .directory_storage
                .pwrite(buf, byte_offset)
                .map_err(|_| write_err(byte_offset, buf.len())),
            ClusterLocation::Bulk { local_byte_offset, .. } => {
                self.cache.write_cluster(buf, local_byte_offset);
                Ok(())
            }
        }
    }
}
