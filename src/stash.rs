// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM stash: client-side storage for blocks that are not currently in the tree.

use crate::{
    block::{BlockId, PathOramBlock},
    bucket::Bucket,
    physical_memory::PhysicalMemory,
    position_map::PositionMap,
    storage::Storage,
    tree_index::TreeGeometry,
    BucketSize, LeafIndex, Operation, OramError, StashSize, TreeHeight,
};
use rand::{CryptoRng, RngCore};
use std::collections::BTreeMap;

/// Real blocks held by the client, keyed by identifier.
///
/// A block lives either in the stash or in exactly one bucket on the path to its assigned leaf.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stash {
    blocks: BTreeMap<BlockId, Vec<u8>>,
}

impl Stash {
    /// Returns an empty stash.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of real blocks in the stash.
    pub fn occupancy(&self) -> StashSize {
        self.blocks.len()
    }

    /// Whether the stash holds `block_id`.
    pub fn contains(&self, block_id: &BlockId) -> bool {
        self.blocks.contains_key(block_id)
    }

    /// Iterates over the stashed blocks in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&BlockId, &Vec<u8>)> {
        self.blocks.iter()
    }

    /// Adds a real block. If the stash already holds `block_id`, the stashed payload is kept.
    pub fn add_block(&mut self, block: PathOramBlock) {
        if block.is_dummy() {
            return;
        }

        if self.blocks.contains_key(&block.id) {
            log::warn!(
                "Block {} found in the tree while already stashed; keeping the stashed copy",
                block.id
            );
            return;
        }
        self.blocks.insert(block.id, block.payload);
    }

    /// Moves every real block on the path to `leaf` into the stash.
    /// Nothing is added unless every bucket on the path was fetched successfully.
    ///
    /// Blocks missing from `position_map` were forgotten by a reset that did not reach
    /// their bucket. They are dropped, and the path is written back without them.
    pub fn read_from_path<S: Storage, const Z: BucketSize>(
        &mut self,
        physical_memory: &mut PhysicalMemory<S, Z>,
        position_map: &PositionMap,
        leaf: LeafIndex,
    ) -> Result<(), OramError> {
        let buckets = physical_memory.read_path(leaf)?;
        for bucket in buckets {
            for block in bucket.into_real_blocks() {
                if !position_map.contains(&block.id) {
                    log::warn!("Dropping block {} that has no position", block.id);
                    continue;
                }
                self.add_block(block);
            }
        }
        Ok(())
    }

    /// Serves `operation` on `block_id`, returning the payload the block held before.
    pub fn access(&mut self, block_id: &BlockId, operation: Operation) -> Option<Vec<u8>> {
        match operation {
            Operation::Read => self.blocks.get(block_id).cloned(),
            Operation::Write(payload) => self.blocks.insert(block_id.clone(), payload),
        }
    }

    /// Decides which stashed blocks go into which bucket on the path to `leaf`.
    ///
    /// Returns, for every depth from the root (index 0) to the leaf, the identifiers placed there.
    /// Buckets are filled from the leaf upwards. A block may go into the bucket at depth `d`
    /// only if its own path passes through that bucket; among eligible blocks, those whose paths
    /// share the most of `leaf`'s path are placed first, with ties broken by identifier.
    pub fn plan_eviction<const Z: BucketSize>(
        &self,
        geometry: &TreeGeometry,
        position_map: &PositionMap,
        leaf: LeafIndex,
    ) -> Vec<Vec<BlockId>> {
        let mut candidates: Vec<(TreeHeight, &BlockId)> = self
            .blocks
            .keys()
            .filter_map(|block_id| match position_map.get(block_id) {
                Some(position) => Some((geometry.common_prefix_length(position, leaf), block_id)),
                None => {
                    log::error!("Stashed block {} has no position", block_id);
                    None
                }
            })
            .collect();
        candidates.sort_by(|(depth_a, id_a), (depth_b, id_b)| {
            depth_b.cmp(depth_a).then_with(|| id_a.cmp(id_b))
        });

        let mut placed = vec![false; candidates.len()];
        let mut plan = vec![Vec::new(); geometry.path_length()];
        for depth in (0..=geometry.height()).rev() {
            let bucket = &mut plan[depth as usize];
            for (index, (deepest, block_id)) in candidates.iter().enumerate() {
                if bucket.len() == Z || *deepest < depth {
                    break;
                }
                if !placed[index] {
                    placed[index] = true;
                    bucket.push((*block_id).clone());
                }
            }
        }
        plan
    }

    /// Writes back every bucket on the path to `leaf`, leaf first, filled greedily from the stash.
    ///
    /// Placed blocks leave the stash only once the whole path has been stored,
    /// so a failure part way through never loses a block.
    pub fn write_to_path<S: Storage, R: RngCore + CryptoRng, const Z: BucketSize>(
        &mut self,
        physical_memory: &mut PhysicalMemory<S, Z>,
        position_map: &PositionMap,
        leaf: LeafIndex,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let geometry = *physical_memory.geometry();
        let plan = self.plan_eviction::<Z>(&geometry, position_map, leaf);

        for depth in (0..=geometry.height()).rev() {
            let blocks = plan[depth as usize]
                .iter()
                .filter_map(|block_id| {
                    self.blocks
                        .get(block_id)
                        .map(|payload| PathOramBlock::new(block_id.clone(), payload.clone()))
                })
                .collect();
            let slot = geometry.node_on_path(leaf, depth);
            physical_memory.write_bucket(slot, &Bucket::<Z>::from_blocks(blocks), rng)?;
        }

        for block_id in plan.iter().flatten() {
            self.blocks.remove(block_id);
        }
        Ok(())
    }
}

impl FromIterator<(BlockId, Vec<u8>)> for Stash {
    fn from_iter<I: IntoIterator<Item = (BlockId, Vec<u8>)>>(iter: I) -> Self {
        Self {
            blocks: iter.into_iter().collect(),
        }
    }
}
