//! Free-cluster search and intra-block defragmentation.
//!
//! Two policies share the same skeleton. The aggressive ("Berwick") policy is free to
//! move a live cluster into any lower-indexed free slot because the scratch-block swap
//! makes the whole block update atomic; the conservative policy, used when no scratch
//! block can be spared, may only use slots that were free both before and after the
//! transaction, and may never touch a cluster that was allocated before the transaction
//! began.

use crate::bitset::BitSet;
use crate::error::{CapacityError, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// Relies on block virtualization's scratch-block swap for crash safety.
    Aggressive,
    /// No scratch block available; moves are restricted to doubly-free slots.
    Conservative,
}

/// A planned in-block cluster move: `from` is the higher, currently-live index; `to` is
/// the lower, free index it should relocate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterMove {
    pub from: u32,
    pub to: u32,
}

/// Finds the lowest-indexed free cluster at or above `search_from` in `free_clusters`.
/// Directory allocation (block 0) and file allocation share this helper; the caller picks
/// which block's bitmap to pass in, matching the "directory data only considers block 0"
/// rule.
pub fn find_free_cluster_in_block(free_clusters: &BitSet, search_from: u32) -> Option<u32> {
    free_clusters.find_first(true, search_from)
}

pub fn block_is_full(free_clusters: &BitSet) -> bool {
    free_clusters.count_ones() == 0
}

pub fn require_free_block(allocated_count: u32, max_blocks: u32) -> Result<(), Error> {
    if allocated_count >= max_blocks {
        return Err(CapacityError::CannotExtend.into());
    }
    Ok(())
}

/// Plans the moves `optimize_block_content` (Berwick strategy) should perform: for every
/// allocated cluster `c`, from the highest index downward, if a smaller-indexed cluster is
/// free in `final_free_set`, relocate `c` there. No restriction on which free cluster may
/// be used.
pub fn plan_aggressive_defrag(final_free_set: &BitSet, highest_allocated: Option<u32>) -> Vec<ClusterMove> {
    plan_defrag(final_free_set, highest_allocated, |candidate, _initial, final_set| final_set.get(candidate))
}

/// Plans moves for the conservative policy: a target slot must be free in both
/// `initial_free_set` and `final_free_set`.
pub fn plan_conservative_defrag(
    initial_free_set: &BitSet,
    final_free_set: &BitSet,
    highest_allocated: Option<u32>,
) -> Vec<ClusterMove> {
    plan_defrag(final_free_set, highest_allocated, |candidate, initial_set, final_set| {
        initial_set.get(candidate) && final_set.get(candidate)
    })
}

fn plan_defrag(
    final_free_set: &BitSet,
    highest_allocated: Option<u32>,
    is_usable_target: impl Fn(u32, &BitSet, &BitSet) -> bool,
) -> Vec<ClusterMove> {
    // plan_aggressive_defrag passes final_free_set twice where `initial` is unused;
    // both closures only read the `final_set` argument they need.
    let mut moves = Vec::new();
    let Some(mut c) = highest_allocated else {
        return moves;
    };
    // `occupied` tracks slots we've already committed to as move targets this pass, so
    // two live clusters never get planned onto the same destination.
    let mut reserved = BitSet::new(final_free_set.size());
    loop {
        if !final_free_set.get(c) {
            // c is allocated; look for a lower free target.
            if let Some(target) = (0..c).rev().find(|&t| {
                !reserved.get(t) && is_usable_target(t, final_free_set, final_free_set)
            }) {
                moves.push(ClusterMove { from: c, to: target });
                reserved.set(target, true);
            }
        }
        if c == 0 {
            break;
        }
        c -= 1;
    }
    moves
}

/// Heuristic "degraded block" score used by the single-block-per-transaction defrag
/// optimizer: the fraction of allocated clusters that sit in the top half of the block.
/// A block is a defrag candidate when this exceeds `threshold`.
pub fn degraded_block_score(free_clusters: &BitSet) -> f64 {
    let size = free_clusters.size();
    if size == 0 {
        return 0.0;
    }
    let half = size / 2;
    let allocated_in_top_half = half..size;
    let allocated_count = allocated_in_top_half.filter(|&i| !free_clusters.get(i)).count();
    let top_half_len = (size - half).max(1);
    allocated_count as f64 / top_half_len as f64
}

pub fn is_degraded(free_clusters: &BitSet, threshold: f64) -> bool {
    degraded_block_score(free_clusters) > threshold
}
