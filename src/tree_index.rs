// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Geometry of the complete binary tree underlying Path ORAM.
//!
//! Buckets are numbered in heap order: the root is slot 0 and the children of slot `s` are `2s + 1` and `2s + 2`.
//! The leaf with index `x` is therefore slot `2^height - 1 + x`.

use crate::{LeafIndex, OramError, SlotId, TreeHeight};
use rand::{CryptoRng, Rng, RngCore};

/// The largest supported tree height.
pub const MAXIMUM_TREE_HEIGHT: TreeHeight = 32;

/// Maps leaves to root-to-leaf paths of bucket slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeGeometry {
    height: TreeHeight,
}

impl TreeGeometry {
    /// Returns the geometry of a tree with `2^height` leaves.
    pub fn new(height: TreeHeight) -> Result<Self, OramError> {
        if height > MAXIMUM_TREE_HEIGHT {
            return Err(OramError::InvalidConfigurationError {
                parameter_name: "tree_height".to_string(),
                parameter_value: height.to_string(),
            });
        }
        Ok(Self { height })
    }

    /// The height `L` of the tree.
    pub fn height(&self) -> TreeHeight {
        self.height
    }

    /// The number of leaves, `2^L`.
    pub fn num_leaves(&self) -> u64 {
        1u64 << self.height
    }

    /// The number of buckets in the whole tree, `2^(L+1) - 1`.
    pub fn num_buckets(&self) -> u64 {
        (1u64 << (self.height + 1)) - 1
    }

    /// The number of buckets on every root-to-leaf path, `L + 1`.
    pub fn path_length(&self) -> usize {
        self.height as usize + 1
    }

    /// Returns the slot of the bucket at `depth` on the path to `leaf`. The root has depth 0.
    ///
    /// # Panics
    ///
    /// Panics if `leaf` is not a leaf of this tree or `depth` exceeds the tree height.
    pub fn node_on_path(&self, leaf: LeafIndex, depth: TreeHeight) -> SlotId {
        assert!(self.is_leaf(leaf), "leaf {leaf} out of range");
        assert!(depth <= self.height);

        let shift = self.height - depth;
        (1u64 << depth) - 1 + (leaf >> shift)
    }

    /// Returns the slots of the buckets on the path to `leaf`, from the root to the leaf.
    ///
    /// # Panics
    ///
    /// Panics if `leaf` is not a leaf of this tree.
    pub fn path_slots(&self, leaf: LeafIndex) -> Vec<SlotId> {
        (0..=self.height)
            .map(|depth| self.node_on_path(leaf, depth))
            .collect()
    }

    /// Draws a leaf uniformly at random.
    pub fn random_leaf<R: RngCore + CryptoRng>(&self, rng: &mut R) -> LeafIndex {
        rng.gen_range(0..self.num_leaves())
    }

    /// Returns the depth of the deepest bucket shared by the paths to `a` and `b`.
    /// Every two paths share at least the root, so the result is at least 0; it is `L` exactly when `a == b`.
    ///
    /// # Panics
    ///
    /// Panics if either argument is not a leaf of this tree.
    pub fn common_prefix_length(&self, a: LeafIndex, b: LeafIndex) -> TreeHeight {
        assert!(self.is_leaf(a) && self.is_leaf(b));

        // Leaf indices are the path's branching decisions, most significant bit first.
        let differing_bits = 64 - (a ^ b).leading_zeros();
        self.height - differing_bits
    }

    /// Whether `leaf` is a valid leaf index.
    pub fn is_leaf(&self, leaf: LeafIndex) -> bool {
        leaf < self.num_leaves()
    }

    /// The depth of `slot` in the tree.
    pub fn depth_of(&self, slot: SlotId) -> TreeHeight {
        let leading_zeroes = (slot + 1).leading_zeros();
        64 - leading_zeroes - 1
    }
}
