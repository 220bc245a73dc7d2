// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM position map: the leaf each block is currently assigned to.

use crate::{block::BlockId, LeafIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maps block identifiers to leaves. Blocks that have never been written have no entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionMap(BTreeMap<BlockId, LeafIndex>);

impl PositionMap {
    /// Returns the leaf `block_id` is assigned to.
    pub fn get(&self, block_id: &BlockId) -> Option<LeafIndex> {
        self.0.get(block_id).copied()
    }

    /// Assigns `block_id` to `leaf`, returning its previous leaf.
    pub fn insert(&mut self, block_id: BlockId, leaf: LeafIndex) -> Option<LeafIndex> {
        self.0.insert(block_id, leaf)
    }

    /// Whether `block_id` has ever been written.
    pub fn contains(&self, block_id: &BlockId) -> bool {
        self.0.contains_key(block_id)
    }

    /// The number of blocks written so far.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no block has been written.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the entries in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&BlockId, &LeafIndex)> {
        self.0.iter()
    }

    /// Whether every assigned leaf is below `num_leaves`.
    pub fn fits_tree(&self, num_leaves: u64) -> bool {
        self.0.values().all(|leaf| *leaf < num_leaves)
    }
}
