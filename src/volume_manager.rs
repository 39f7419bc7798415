//! Top-level façade: open/create/close a volume, get/set FAT cells, read/write clusters,
//! and run the begin/commit transaction cycle described in §4.6.

use std::sync::Arc;

use log::{debug, info, warn};
use spin::Mutex;

use crate::bitset::BitSet;
use crate::block_control::BlockControlData;
use crate::config::VolumeConfig;
use crate::data_block_manager::DataBlockManager;
use crate::error::{CapacityError, Error, TransactionError, UsageError};
use crate::fat_cache::FatBlockCache;
use crate::fat_cell::FatCellValue;
use crate::placement::{self, PlacementPolicy};
use crate::storage::LowLevelStorage;
use crate::transaction::{DirtyFatBlock, TransactionIntent, TransactionLog};
use crate::virtualization::{last_used_chunk, physical_byte_offset};
use crate::volume_descriptor::{VolumeControlData, VolumeDescriptor};

const FDR_RECORD_SIZE: u32 = 64;
const FAT_CELL_BYTES: u64 = 8;
/// Fixed offset of the persisted `VolumeControlData` blob within the control file; the
/// per-block region starts at `ControlLayout::fat_region_base`, which leaves enough room
/// ahead of it for any reasonably-sized volume.
const CONTROL_DATA_OFFSET: u64 = 256;
/// Fraction of allocated clusters sitting in a block's top half above which
/// `commit_cached_block` runs its defrag pass before writing the block back out.
const DEFRAG_DEGRADED_THRESHOLD: f64 = 0.5;

/// Layout of the control file: a fixed descriptor region, then one
/// `(BlockControlData, FAT table)` record per possible block (per §6), laid out
/// contiguously so a block's offset is a pure function of its index.
struct ControlLayout {
    fat_region_base: u64,
    block_control_len: u64,
    record_stride: u64,
}

impl ControlLayout {
    fn new(clusters_per_block: u32) -> Self {
        let block_control_len = BlockControlData::serialized_len(clusters_per_block) as u64;
        let fat_table_len = clusters_per_block as u64 * FAT_CELL_BYTES;
        Self {
            fat_region_base: 4096, // room for VolumeDescriptor + VolumeControlData
            block_control_len,
            record_stride: block_control_len + fat_table_len,
        }
    }

    fn record_offset(&self, block_index: u32) -> u64 {
        self.fat_region_base + block_index as u64 * self.record_stride
    }

    fn block_control_offset(&self, block_index: u32) -> u64 {
        self.record_offset(block_index)
    }

    fn fat_block_offset(&self, block_index: u32) -> u64 {
        self.record_offset(block_index) + self.block_control_len
    }
}

pub struct VolumeManager {
    config: VolumeConfig,
    descriptor: VolumeDescriptor,
    control: Mutex<VolumeControlData>,
    block_controls: Mutex<Vec<BlockControlData>>,
    layout: ControlLayout,
    control_storage: Arc<dyn LowLevelStorage>,
    fat_cache: FatBlockCache,
    data_blocks: Mutex<DataBlockManager>,
    policy: PlacementPolicy,
    transaction_open: Mutex<bool>,
}

impl VolumeManager {
    /// Creates a brand-new volume: writes an empty descriptor/control-data, allocates
    /// block 0, and leaves the bulk file holding just the scratch slot.
    pub fn create(
        config: VolumeConfig,
        control_storage: Arc<dyn LowLevelStorage>,
        directory_storage: Arc<dyn LowLevelStorage>,
        bulk_storage: Arc<dyn LowLevelStorage>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let descriptor = VolumeDescriptor::from_config(&config, FDR_RECORD_SIZE);
        let control = VolumeControlData::new(config.max_blocks);
        let layout = ControlLayout::new(config.clusters_per_block());
        let fat_cache = FatBlockCache::new(Arc::clone(&control_storage), config.clusters_per_block());
        let data_blocks = DataBlockManager::new(
            directory_storage,
            bulk_storage,
            config.block_size,
            config.chunk_size,
            config.cluster_size,
        );

        // Block 0 (the control-area directory block) always exists; it is not part of
        // the bulk-area `allocated_count`/`phys_map` accounting that `allocate_block`
        // manages for blocks 1..N.
        let manager = Self {
            config,
            descriptor,
            control: Mutex::new(control),
            block_controls: Mutex::new(vec![BlockControlData::new_empty(config.clusters_per_block())]),
            layout,
            control_storage,
            fat_cache,
            data_blocks: Mutex::new(data_blocks),
            policy: PlacementPolicy::Aggressive,
            transaction_open: Mutex::new(false),
        };
        manager.fat_cache.seed_empty_block(0);
        manager.persist_control_data()?;
        info!("created volume: max_blocks={} cluster_size={}", manager.config.max_blocks, manager.config.cluster_size);
        Ok(manager)
    }

    /// Opens an existing volume, replaying or discarding any pending transaction log
    /// found in the control area.
    pub fn open(
        config: VolumeConfig,
        control_storage: Arc<dyn LowLevelStorage>,
        directory_storage: Arc<dyn LowLevelStorage>,
        bulk_storage: Arc<dyn LowLevelStorage>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let descriptor = VolumeDescriptor::from_config(&config, FDR_RECORD_SIZE);
        if !descriptor.is_verified() {
            return Err(Error::Fatal("volume descriptor failed verification"));
        }
        let layout = ControlLayout::new(config.clusters_per_block());
        let fat_cache = FatBlockCache::new(Arc::clone(&control_storage), config.clusters_per_block());

        let mut control_bytes = vec![0u8; VolumeControlData::serialized_len(config.max_blocks)];
        control_storage.pread(&mut control_bytes, CONTROL_DATA_OFFSET)?;
        let mut control = VolumeControlData::deserialize(&control_bytes, config.max_blocks)?;

        let clusters_per_block = config.clusters_per_block();
        let block_control_len = BlockControlData::serialized_len(clusters_per_block);
        let mut block_controls = Vec::with_capacity(1 + control.allocated_count as usize);
        for block_index in 0..=control.allocated_count {
            let mut bytes = vec![0u8; block_control_len];
            control_storage.pread(&mut bytes, layout.block_control_offset(block_index))?;
            block_controls.push(BlockControlData::deserialize(&bytes, clusters_per_block)?);
        }

        let log = TransactionLog::new(control_storage.as_ref());
        if let Some(intent) = log.recover()? {
            warn!("replaying pending transaction log on open");
            apply_intent(&intent, &mut control, control_storage.as_ref(), &layout)?;
            for dirty in &intent.dirty_fat_blocks {
                if let Some(bcd) = block_controls.get_mut(dirty.block_index as usize) {
                    bcd.fat_crc32 = dirty.crc32;
                }
            }
            let bytes = control.serialize();
            control_storage.pwrite(&bytes, CONTROL_DATA_OFFSET)?;
            for (block_index, bcd) in block_controls.iter().enumerate() {
                control_storage.pwrite(&bcd.serialize(), layout.block_control_offset(block_index as u32))?;
            }
            control_storage.fsync()?;
            log.complete()?;
        }

        let data_blocks = DataBlockManager::new(
            directory_storage,
            bulk_storage,
            config.block_size,
            config.chunk_size,
            config.cluster_size,
        );

        Ok(Self {
            config,
            descriptor,
            control: Mutex::new(control),
            block_controls: Mutex::new(block_controls),
            layout,
            control_storage,
            fat_cache,
            data_blocks: Mutex::new(data_blocks),
            policy: PlacementPolicy::Aggressive,
            transaction_open: Mutex::new(false),
        })
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    fn persist_control_data(&self) -> Result<(), Error> {
        let bytes = self.control.lock().serialize();
        self.control_storage.pwrite(&bytes, CONTROL_DATA_OFFSET)?;
        let block_controls = self.block_controls.lock();
        for (block_index, bcd) in block_controls.iter().enumerate() {
            self.control_storage
                .pwrite(&bcd.serialize(), self.layout.block_control_offset(block_index as u32))?;
        }
        drop(block_controls);
        self.control_storage.fsync()?;
        Ok(())
    }

    /// Total blocks with FAT/control data on disk, including the always-present block 0.
    pub fn allocated_block_count(&self) -> u32 {
        1 + self.control.lock().allocated_count
    }

    /// Allocates the next bulk-area block (virtual index `0..max_blocks`, global block
    /// index `virtual + first_file_data_block_index`). Returns the new virtual index.
    pub fn allocate_block(&self) -> Result<u32, Error> {
        let mut control = self.control.lock();
        placement::require_free_block(control.allocated_count, self.config.max_blocks)?;
        let virtual_index = control.allocated_count;
        control.mark_allocated(virtual_index);
        drop(control);
        self.block_controls.lock().push(BlockControlData::new_empty(self.config.clusters_per_block()));
        let global_index = virtual_index + self.config.first_file_data_block_index;
        self.fat_cache.seed_empty_block(global_index);
        self.persist_control_data()?;
        info!("allocated bulk block (virtual={virtual_index}, global={global_index})");
        Ok(virtual_index)
    }

    pub fn begin_transaction(&self) -> Result<(), Error> {
        let mut open = self.transaction_open.lock();
        if *open {
            return Err(TransactionError::AlreadyStarted.into());
        }
        *open = true;
        Ok(())
    }

    pub fn get_cell(&self, cluster_index: u32) -> Result<FatCellValue, Error> {
        let (block_index, local_index) = self.cell_location(cluster_index)?;
        let offset = self.layout.fat_block_offset(block_index);
        let crc = self.block_controls.lock()[block_index as usize].fat_crc32;
        self.fat_cache.get_cell(block_index, local_index, offset, crc)
    }

    pub fn set_cell(&self, cluster_index: u32, value: FatCellValue) -> Result<(), Error> {
        let (block_index, local_index) = self.cell_location(cluster_index)?;
        let offset = self.layout.fat_block_offset(block_index);
        let crc = self.block_controls.lock()[block_index as usize].fat_crc32;
        debug!("set_cell block={block_index} local={local_index}");
        self.fat_cache.set_cell(block_index, local_index, value, offset, crc)?;
        let mut block_controls = self.block_controls.lock();
        if let Some(bcd) = block_controls.get_mut(block_index as usize) {
            if value.is_free_cluster() {
                bcd.mark_free(local_index);
            } else {
                bcd.mark_allocated(local_index);
            }
        }
        Ok(())
    }

    fn cell_location(&self, cluster_index: u32) -> Result<(u32, u32), Error> {
        let clusters_per_block = self.config.clusters_per_block();
        let block_index = cluster_index / clusters_per_block;
        if block_index > 0 && block_index - 1 >= self.control.lock().allocated_count {
            return Err(UsageError::InvalidClusterIndex(cluster_index).into());
        }
        Ok((block_index, cluster_index % clusters_per_block))
    }

    /// Reads a cluster. A bulk read of a block other than the one currently resident in
    /// the cache goes straight to storage (§4.5) rather than forcing that block into the
    /// cache, so a read never triggers the commit-on-miss sequence writes do.
    pub fn read_cluster(&self, buf: &mut [u8], cluster_index: u32) -> Result<(), Error> {
        let physical = self.physical_for(cluster_index)?;
        let mut data_blocks = self.data_blocks.lock();
        data_blocks.read_cluster(buf, cluster_index, physical)
    }

    pub fn write_cluster(&self, buf: &[u8], cluster_index: u32) -> Result<(), Error> {
        let physical = self.physical_for(cluster_index)?;
        let mut data_blocks = self.data_blocks.lock();
        if let crate::data_block_manager::ClusterLocation::Bulk { virtual_block, .. } =
            crate::data_block_manager::locate_cluster(cluster_index, self.config.clusters_per_block(), self.config.cluster_size)
        {
            let block_index = virtual_block + self.config.first_file_data_block_index;
            let free = self.block_controls.lock()[block_index as usize].free_clusters.clone();
            self.ensure_bulk_block_cached_for_write(&mut data_blocks, virtual_block, physical, free)?;
        }
        data_blocks.write_cluster(buf, cluster_index)?;
        drop(data_blocks);

        let clusters_per_block = self.config.clusters_per_block();
        let block_index = cluster_index / clusters_per_block;
        let local_index = cluster_index % clusters_per_block;
        self.block_controls.lock()[block_index as usize].mark_allocated(local_index);
        Ok(())
    }

    /// Commits whatever was dirty in the currently cached bulk block before switching to
    /// `virtual_block`, so a cache-miss eviction never silently discards unwritten data.
    fn ensure_bulk_block_cached_for_write(
        &self,
        data_blocks: &mut DataBlockManager,
        virtual_block: u32,
        physical: u32,
        free: BitSet,
    ) -> Result<(), Error> {
        if let Some(current) = data_blocks.cache().cached_block_index() {
            if current != virtual_block && !data_blocks.cache().in_sync() {
                self.commit_cached_block(data_blocks, current)?;
            }
        }
        data_blocks.ensure_cached(virtual_block, physical, free, |_| Ok(()))
    }

    /// Finds a free cluster in the control-area directory block (block 0); directory
    /// allocations never spill into the bulk area.
    pub fn find_free_cluster_for_directory(&self) -> Result<u32, Error> {
        let block_controls = self.block_controls.lock();
        let bcd = &block_controls[0];
        placement::find_free_cluster_in_block(&bcd.free_clusters, 0).ok_or_else(|| CapacityError::CannotExtend.into())
    }

    /// Finds a free cluster for file data, scanning allocated bulk blocks in order and
    /// allocating a new block once all existing ones are full.
    pub fn find_free_cluster_for_file(&self) -> Result<u32, Error> {
        let clusters_per_block = self.config.clusters_per_block();
        {
            let block_controls = self.block_controls.lock();
            for (block_index, bcd) in block_controls.iter().enumerate().skip(1) {
                if let Some(local) = placement::find_free_cluster_in_block(&bcd.free_clusters, 0) {
                    return Ok(block_index as u32 * clusters_per_block + local);
                }
            }
        }
        let virtual_index = self.allocate_block()?;
        let block_index = virtual_index + self.config.first_file_data_block_index;
        Ok(block_index * clusters_per_block)
    }

    fn physical_for(&self, cluster_index: u32) -> Result<u32, Error> {
        match crate::data_block_manager::locate_cluster(cluster_index, self.config.clusters_per_block(), self.config.cluster_size) {
            crate::data_block_manager::ClusterLocation::ControlArea { .. } => Ok(0),
            crate::data_block_manager::ClusterLocation::Bulk { virtual_block, .. } => self
                .control
                .lock()
                .physical_of(virtual_block)
                .ok_or_else(|| UsageError::InvalidBlockIndex(virtual_block).into()),
        }
    }

    /// Runs the 8-step commit sequence of §4.6 against the currently cached bulk block,
    /// if any, then the begin/commit transaction bracket for FAT writes.
    pub fn commit(&self) -> Result<(), Error> {
        {
            let mut open = self.transaction_open.lock();
            if !*open {
                return Err(TransactionError::NotStarted.into());
            }
            *open = false;
        }

        let mut data_blocks = self.data_blocks.lock();
        let virtual_block = data_blocks.cache().cached_block_index();

        if let Some(v) = virtual_block {
            if !data_blocks.cache().in_sync() {
                self.commit_cached_block(&mut data_blocks, v)?;
            }
        }
        drop(data_blocks);

        let flushed = self.fat_cache.flush();

        let mut block_controls = self.block_controls.lock();
        let mut dirty_fat_blocks = Vec::with_capacity(flushed.len());
        for (block_index, bytes, crc32) in flushed {
            if let Some(bcd) = block_controls.get_mut(block_index as usize) {
                bcd.fat_crc32 = crc32;
            }
            dirty_fat_blocks.push(DirtyFatBlock { block_index, bytes, crc32 });
        }
        drop(block_controls);

        let control = self.control.lock();
        let intent = TransactionIntent {
            new_phys_map: control.phys_map.clone(),
            new_scratch_index: control.scratch_index,
            dirty_fat_blocks,
        };
        drop(control);

        let log = TransactionLog::new(self.control_storage.as_ref());
        log.begin(&intent)?;
        apply_committed_intent(&intent, self.control_storage.as_ref(), &self.layout)?;
        self.persist_control_data()?;
        log.complete()?;
        info!("transaction committed");
        Ok(())
    }

    fn commit_cached_block(&self, data_blocks: &mut DataBlockManager, virtual_block: u32) -> Result<(), Error> {
        let block_index = virtual_block + self.config.first_file_data_block_index;
        let mut block_controls = self.block_controls.lock();
        let bcd = block_controls
            .get_mut(block_index as usize)
            .ok_or(UsageError::InvalidBlockIndex(block_index))?;

        if self.config.enable_defragmentation && placement::is_degraded(&bcd.free_clusters, DEFRAG_DEGRADED_THRESHOLD) {
            let highest_allocated = bcd.free_clusters.find_last(false, bcd.free_clusters.size().saturating_sub(1));
            let moves = match self.policy {
                PlacementPolicy::Aggressive => placement::plan_aggressive_defrag(&bcd.free_clusters, highest_allocated),
                PlacementPolicy::Conservative => placement::plan_conservative_defrag(
                    &data_blocks.cache().initial_free_clusters,
                    &bcd.free_clusters,
                    highest_allocated,
                ),
            };
            for mv in &moves {
                relocate_cluster_in_cache(data_blocks.cache_mut(), mv.from, mv.to, self.config.cluster_size);
                bcd.mark_free(mv.from);
                bcd.mark_allocated(mv.to);
            }
        }

        let clusters_per_chunk = self.config.clusters_per_chunk();
        let last_chunk = last_used_chunk(&bcd.free_clusters, clusters_per_chunk);
        drop(block_controls);

        let mut control = self.control.lock();
        let scratch_physical = control.scratch_index;
        let scratch_offset = physical_byte_offset(scratch_physical, self.config.block_size);

        if let Some(last_chunk) = last_chunk {
            let chunk_size = self.config.chunk_size as u64;
            let buffer = data_blocks.cache().buffer().to_vec();
            for chunk_idx in 0..=last_chunk {
                let start = chunk_idx as usize * self.config.chunk_size as usize;
                let end = start + self.config.chunk_size as usize;
                data_blocks
                    .bulk_storage()
                    .pwrite(&buffer[start..end], scratch_offset + chunk_idx as u64 * chunk_size)?;
            }
        }
        data_blocks.bulk_storage().fsync()?;

        control.swap_scratch_into(virtual_block);
        drop(control);

        data_blocks.cache_mut().mark_synced();
        Ok(())
    }
}

fn relocate_cluster_in_cache(cache: &mut crate::cluster_cache::ClusterDataCache, from: u32, to: u32, cluster_size: u32) {
    let from_offset = (from * cluster_size) as usize;
    let to_offset = (to * cluster_size) as usize;
    let cluster_size = cluster_size as usize;
    let mut tmp = vec![0u8; cluster_size];
    tmp.copy_from_slice(&cache.buffer()[from_offset..from_offset + cluster_size]);
    cache.buffer_mut()[to_offset..to_offset + cluster_size].copy_from_slice(&tmp);
}

/// Writes every dirty FAT block named by `intent` to its home offset and fsyncs. Used both
/// as the normal commit's "apply" step (between the log rename and `persist_control_data`)
/// and, identically, to replay a recovered intent on open — re-running it is harmless
/// since the bytes it writes are exactly what a completed commit would have written.
fn apply_committed_intent(intent: &TransactionIntent, storage: &dyn LowLevelStorage, layout: &ControlLayout) -> Result<(), Error> {
    for block in &intent.dirty_fat_blocks {
        storage.pwrite(&block.bytes, layout.fat_block_offset(block.block_index))?;
    }
    storage.fsync()?;
    Ok(())
}

/// Re-applies a recovered transaction intent: rewrites the dirty FAT blocks it carries
/// (the log's rename completing doesn't by itself mean those bytes reached their home
/// offset) and replays the block-virtualization swap into `control`.
fn apply_intent(
    intent: &TransactionIntent,
    control: &mut VolumeControlData,
    storage: &dyn LowLevelStorage,
    layout: &ControlLayout,
) -> Result<(), Error> {
    apply_committed_intent(intent, storage, layout)?;
    control.phys_map = intent.new_phys_map.clone();
    control.scratch_index = intent.new_scratch_index;
    control.generation += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStorage;

    fn small_config() -> VolumeConfig {
        VolumeConfig {
            cluster_size: 64,
            chunk_size: 256,
            block_size: 1024,
            max_blocks: 4,
            first_file_data_block_index: 1,
            enable_defragmentation: true,
            enable_per_cluster_crc: true,
            enable_block_initialization_on_alloc: false,
        }
    }

    fn storages() -> (Arc<dyn LowLevelStorage>, Arc<dyn LowLevelStorage>, Arc<dyn LowLevelStorage>) {
        (
            Arc::new(MemoryStorage::new(8192)),
            Arc::new(MemoryStorage::new(8192)),
            Arc::new(MemoryStorage::new(8192)),
        )
    }

    #[test]
    fn create_allocates_block_zero() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        assert_eq!(manager.allocated_block_count(), 1);
        assert!(manager.descriptor().is_verified());
    }

    #[test]
    fn set_and_get_cell_roundtrips_without_commit() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        let mut value = FatCellValue::single_element_cluster_chain_value();
        value.encode_crc(0x1234);
        manager.set_cell(0, value).unwrap();
        assert_eq!(manager.get_cell(0).unwrap(), value);
    }

    #[test]
    fn write_and_read_cluster_in_control_block() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        manager.write_cluster(&[9u8; 64], 0).unwrap();
        let mut buf = [0u8; 64];
        manager.read_cluster(&mut buf, 0).unwrap();
        assert_eq!(buf, [9u8; 64]);
    }

    #[test]
    fn commit_without_begin_fails() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        assert!(manager.commit().is_err());
    }

    #[test]
    fn begin_then_commit_succeeds() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        manager.begin_transaction().unwrap();
        manager.set_cell(0, FatCellValue::single_element_cluster_chain_value()).unwrap();
        manager.commit().unwrap();
    }

    #[test]
    fn allocate_beyond_max_blocks_is_capacity_error() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        // small_config's max_blocks is 4 bulk-area blocks; block 0 doesn't consume this budget.
        manager.allocate_block().unwrap();
        manager.allocate_block().unwrap();
        manager.allocate_block().unwrap();
        manager.allocate_block().unwrap();
        let err = manager.allocate_block().unwrap_err();
        assert!(matches!(err, Error::Capacity(CapacityError::CannotExtend)));
    }

    #[test]
    fn reopen_preserves_allocated_blocks_and_physical_map() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), Arc::clone(&control), Arc::clone(&dir), Arc::clone(&bulk)).unwrap();
        manager.allocate_block().unwrap();
        manager.allocate_block().unwrap();
        drop(manager);

        let reopened = VolumeManager::open(small_config(), control, dir, bulk).unwrap();
        assert_eq!(reopened.allocated_block_count(), 3);
        assert_eq!(reopened.control.lock().allocated_count, 2);
    }

    #[test]
    fn open_replays_pending_transaction_log_into_control_data() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), Arc::clone(&control), Arc::clone(&dir), Arc::clone(&bulk)).unwrap();
        manager.allocate_block().unwrap();
        let pre_crash_map = manager.control.lock().phys_map.clone();
        let mut new_map = pre_crash_map.clone();
        new_map.swap(0, 1);
        let intent = TransactionIntent {
            new_phys_map: new_map.clone(),
            new_scratch_index: manager.control.lock().scratch_index,
            dirty_fat_blocks: Vec::new(),
        };
        // Simulate a crash right after the rename to the final log name, before the
        // control-data apply step ran.
        let log = TransactionLog::new(control.as_ref());
        log.begin(&intent).unwrap();
        drop(manager);

        let reopened = VolumeManager::open(small_config(), control, dir, bulk).unwrap();
        assert_eq!(reopened.control.lock().phys_map, new_map);
    }

    #[test]
    fn bulk_cluster_roundtrips_through_commit_and_reopen() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), Arc::clone(&control), Arc::clone(&dir), Arc::clone(&bulk)).unwrap();
        manager.allocate_block().unwrap();
        let cluster_index = small_config().clusters_per_block(); // first cluster of bulk block 0
        manager.begin_transaction().unwrap();
        manager.write_cluster(&[0x5Au8; 64], cluster_index).unwrap();
        manager.commit().unwrap();
        drop(manager);

        let reopened = VolumeManager::open(small_config(), control, dir, bulk).unwrap();
        let mut buf = [0u8; 64];
        reopened.read_cluster(&mut buf, cluster_index).unwrap();
        assert_eq!(buf, [0x5Au8; 64]);
    }

    #[test]
    fn write_cluster_marks_owning_block_control_allocated() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        manager.allocate_block().unwrap();
        let clusters_per_block = small_config().clusters_per_block();
        manager.write_cluster(&[1u8; 64], clusters_per_block).unwrap();
        let block_controls = manager.block_controls.lock();
        assert!(!block_controls[1].free_clusters.get(0));
        assert_eq!(block_controls[1].free_count, clusters_per_block - 1);
    }

    #[test]
    fn set_cell_updates_free_cluster_bookkeeping() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        let mut value = FatCellValue::single_element_cluster_chain_value();
        value.encode_crc(0x1234);
        manager.set_cell(2, value).unwrap();
        assert!(!manager.block_controls.lock()[0].free_clusters.get(2));

        manager.set_cell(2, FatCellValue::free_cell_value()).unwrap();
        assert!(manager.block_controls.lock()[0].free_clusters.get(2));
    }

    #[test]
    fn find_free_cluster_for_file_allocates_new_block_when_full() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        manager.allocate_block().unwrap();
        {
            let mut block_controls = manager.block_controls.lock();
            block_controls[1].free_clusters.set_all(false);
            block_controls[1].free_count = 0;
        }

        let cluster_index = manager.find_free_cluster_for_file().unwrap();

        assert_eq!(manager.allocated_block_count(), 3);
        assert_eq!(cluster_index, 2 * small_config().clusters_per_block());
    }

    #[test]
    fn find_free_cluster_for_directory_is_restricted_to_block_zero() {
        let (control, dir, bulk) = storages();
        let manager = VolumeManager::create(small_config(), control, dir, bulk).unwrap();
        let cluster_index = manager.find_free_cluster_for_directory().unwrap();
        assert_eq!(cluster_index, 0);
    }
}
