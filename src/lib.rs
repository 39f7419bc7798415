//! SplitFAT: a FAT-style storage engine for a two-tier storage medium — a small,
//! randomly-writable control area and a large bulk area that is only efficient to write
//! in whole 256 MiB blocks.
//!
//! Reads/writes go through [`VolumeManager`], which owns a [`FatBlockCache`] for FAT
//! metadata and a [`DataBlockManager`] for cluster payloads, and coordinates both through
//! a scratch-block transaction on [`commit`](VolumeManager::commit).

pub mod bitset;
pub mod block_control;
pub mod cluster_cache;
pub mod config;
pub mod data_block_manager;
pub mod error;
pub mod fat_cache;
pub mod fat_cell;
pub mod placement;
pub mod storage;
pub mod transaction;
pub mod virtualization;
pub mod volume_descriptor;
pub mod volume_manager;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::VolumeConfig;
pub use error::{Error, Result};
pub use fat_cell::FatCellValue;
pub use storage::LowLevelStorage;
pub use volume_manager::VolumeManager;

/// Cluster index reserved as the free-cluster sentinel and the root directory's start
/// cluster; nothing may point to it as a chain successor.
pub const ROOT_START_CLUSTER_INDEX: u32 = fat_cell::ROOT_START_CLUSTER_INDEX;
