// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An implementation of Path ORAM over an untrusted bucket store.

use crate::{
    block::BlockId,
    config::OramConfig,
    crypto::{BlockCipher, EncryptionKey},
    physical_memory::PhysicalMemory,
    position_map::PositionMap,
    snapshot::{Snapshot, SnapshotStore},
    stash::Stash,
    storage::Storage,
    tree_index::TreeGeometry,
    BucketSize, LeafIndex, Operation, Oram, OramError, StashSize,
};
use rand::{CryptoRng, RngCore};

/// The parameter "Z" from the Path ORAM literature that sets the number of blocks per bucket; typical values are 3 or 4.
/// Here we adopt the more conservative setting of 4.
pub const DEFAULT_BLOCKS_PER_BUCKET: BucketSize = 4;

/// A Path ORAM client.
///
/// ## Parameters
///
/// - Storage `S`: the untrusted bucket store.
/// - Snapshot store `P`: where the position map and stash are persisted after every access.
/// - Bucket size `Z`: the number of blocks per Path ORAM bucket.
///     Must be at least 2. Along with `max_stash_size`, this value affects the probability
///     of a `CapacityFault` and should be set with care.
/// - `OramConfig`: the tree height, the block payload size, the stash bound and the retry policy.
///
/// ## Security
///
/// Every access fetches each bucket on one root-to-leaf path, root first,
/// and then stores each bucket on the same path, leaf first. The path is the accessed block's
/// current leaf, or a fresh random leaf if the block has never been written, and the block
/// is moved to a fresh random leaf before the path is written back.
/// Every bucket is re-sealed under fresh nonces, so the provider cannot tell which blocks moved.
///
/// The stash is not hidden from the client's own memory and is iterated in the clear:
/// this type protects against the storage provider, not against a co-located observer.
///
/// ## Durability
///
/// Before writing a path back, the engine saves a snapshot that records the path as pending.
/// If the write-back fails or the process dies part way through, the next access
/// (possibly by a new engine loaded from the same snapshot) first writes that path again.
/// A `reset` is recorded the same way: until every bucket has been rewritten, the snapshot
/// marks the reset as in progress and the next access finishes it before touching the tree.
#[derive(Debug)]
pub struct PathOram<S: Storage, P: SnapshotStore, const Z: BucketSize = DEFAULT_BLOCKS_PER_BUCKET>
{
    // The fields below are not meant to be exposed to clients. They are visible to the crate for testing purposes.
    /// The sealed tree held by the storage provider.
    pub(crate) physical_memory: PhysicalMemory<S, Z>,
    /// The Path ORAM stash.
    pub(crate) stash: Stash,
    /// The Path ORAM position map.
    pub(crate) position_map: PositionMap,
    snapshots: P,
    config: OramConfig,
    pending_eviction: Option<LeafIndex>,
    reset_in_progress: bool,
}

impl<S: Storage, P: SnapshotStore, const Z: BucketSize> PathOram<S, P, Z> {
    /// Opens an ORAM over `storage`, resuming from the snapshot in `snapshots` if there is one.
    /// Otherwise every bucket of the tree is initialized with sealed dummy blocks.
    ///
    /// `key` must be the key the tree was created with; the caller is responsible for keeping it.
    pub fn new<R: RngCore + CryptoRng>(
        storage: S,
        mut snapshots: P,
        key: &EncryptionKey,
        config: OramConfig,
        rng: &mut R,
    ) -> Result<Self, OramError> {
        log::debug!(
            "PathOram::new -- (L = {}, Z = {}, B = {})",
            config.tree_height,
            Z,
            config.block_size
        );

        config.validate()?;
        if Z < 2 {
            return Err(OramError::InvalidConfigurationError {
                parameter_name: "bucket_capacity".to_string(),
                parameter_value: Z.to_string(),
            });
        }

        let geometry = TreeGeometry::new(config.tree_height)?;
        let mut physical_memory = PhysicalMemory::new(
            storage,
            BlockCipher::new(key),
            geometry,
            config.block_size,
            config.retry,
        );

        match snapshots.load()? {
            Some(snapshot) => {
                snapshot.check_compatible(&config, Z)?;
                log::info!(
                    "Resuming from snapshot: {} blocks, {} stashed",
                    snapshot.position_map.len(),
                    snapshot.stash.len()
                );
                if let Some(leaf) = snapshot.pending_eviction {
                    log::warn!("Eviction of leaf {} was interrupted; it will be redone", leaf);
                }
                if snapshot.reset_in_progress {
                    log::warn!("A reset was interrupted; it will be redone");
                }

                let stash = snapshot.restore_stash();
                Ok(Self {
                    physical_memory,
                    stash,
                    position_map: snapshot.position_map,
                    snapshots,
                    config,
                    pending_eviction: snapshot.pending_eviction,
                    reset_in_progress: snapshot.reset_in_progress,
                })
            }
            None => {
                physical_memory.initialize(rng)?;
                let mut oram = Self {
                    physical_memory,
                    stash: Stash::new(),
                    position_map: PositionMap::default(),
                    snapshots,
                    config,
                    pending_eviction: None,
                    reset_in_progress: false,
                };
                oram.save_snapshot()?;
                Ok(oram)
            }
        }
    }

    /// Forgets every block: clears the snapshot and writes a fresh tree of dummy buckets.
    /// Any name-to-identifier table kept by the caller must be cleared along with it.
    ///
    /// The blocks are forgotten as soon as the empty snapshot is saved. If rewriting the tree
    /// fails after that, the error is returned and the next access finishes the rewrite.
    pub fn reset<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(), OramError> {
        log::info!("Resetting the ORAM");
        self.snapshots.clear()?;
        self.stash = Stash::new();
        self.position_map = PositionMap::default();
        self.pending_eviction = None;
        self.reset_in_progress = true;
        self.save_snapshot()?;

        self.finish_reset(rng)
    }

    /// Whether a `reset` failed before every bucket was rewritten.
    pub fn has_pending_reset(&self) -> bool {
        self.reset_in_progress
    }

    /// The number of blocks currently held in the stash.
    pub fn stash_occupancy(&self) -> StashSize {
        self.stash.occupancy()
    }

    /// The number of distinct blocks written so far.
    pub fn block_count(&self) -> usize {
        self.position_map.len()
    }

    /// The shape of the tree.
    pub fn geometry(&self) -> TreeGeometry {
        *self.physical_memory.geometry()
    }

    /// The configuration the engine was opened with.
    pub fn config(&self) -> &OramConfig {
        &self.config
    }

    /// Whether a path write-back is outstanding from a failed access.
    pub fn has_pending_eviction(&self) -> bool {
        self.pending_eviction.is_some()
    }

    /// The underlying store.
    pub fn storage(&self) -> &S {
        self.physical_memory.storage()
    }

    /// The underlying store, mutably.
    pub fn storage_mut(&mut self) -> &mut S {
        self.physical_memory.storage_mut()
    }

    fn save_snapshot(&mut self) -> Result<(), OramError> {
        let snapshot = Snapshot::capture(
            &self.config,
            Z,
            &self.position_map,
            &self.stash,
            self.pending_eviction,
            self.reset_in_progress,
        );
        log::debug!(
            "Saving snapshot ({} blocks, {} stashed, pending eviction: {:?})",
            self.position_map.len(),
            self.stash.occupancy(),
            self.pending_eviction
        );
        self.snapshots.save(&snapshot)
    }

    /// Writes the path to `leaf` back from the stash.
    /// The snapshot marks the path as pending until every bucket on it has been stored.
    fn evict<R: RngCore + CryptoRng>(
        &mut self,
        leaf: LeafIndex,
        rng: &mut R,
    ) -> Result<(), OramError> {
        self.pending_eviction = Some(leaf);
        self.save_snapshot()?;

        self.stash
            .write_to_path(&mut self.physical_memory, &self.position_map, leaf, rng)?;

        self.pending_eviction = None;
        self.save_snapshot()
    }

    fn finish_reset<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(), OramError> {
        self.physical_memory.initialize(rng)?;
        self.reset_in_progress = false;
        self.save_snapshot()
    }

    fn complete_pending_reset<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<(), OramError> {
        if self.reset_in_progress {
            log::warn!("Completing interrupted reset");
            self.finish_reset(rng)?;
        }
        Ok(())
    }

    fn complete_pending_eviction<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<(), OramError> {
        if let Some(leaf) = self.pending_eviction {
            log::warn!("Completing interrupted eviction of leaf {}", leaf);
            self.evict(leaf, rng)?;
        }
        Ok(())
    }

    /// Checks that the stash is still evictable after writing back the path to `leaf`.
    ///
    /// Only blocks assigned to `leaf` itself are known to be stuck: a leftover block assigned
    /// elsewhere may still fit on its own path later. Those are caught by `max_stash_size` once
    /// they pile up.
    fn check_capacity(&self, leaf: LeafIndex) -> Result<(), OramError> {
        // A leftover block assigned to `leaf` itself means every bucket on its path is full.
        if let Some((block_id, _)) = self
            .stash
            .iter()
            .find(|(block_id, _)| self.position_map.get(block_id) == Some(leaf))
        {
            log::error!("Block {} did not fit on its own path", block_id);
            return Err(OramError::CapacityFault(format!(
                "every bucket on the path of block {block_id} is full"
            )));
        }

        if self.stash.occupancy() > self.config.max_stash_size {
            log::error!(
                "Stash holds {} blocks (limit: {})",
                self.stash.occupancy(),
                self.config.max_stash_size
            );
            return Err(OramError::CapacityFault(format!(
                "stash holds {} blocks, more than the limit of {}",
                self.stash.occupancy(),
                self.config.max_stash_size
            )));
        }
        Ok(())
    }
}

impl<S: Storage, P: SnapshotStore, const Z: BucketSize> Oram for PathOram<S, P, Z> {
    fn access<R: RngCore + CryptoRng>(
        &mut self,
        block_id: &BlockId,
        operation: Operation,
        rng: &mut R,
    ) -> Result<Option<Vec<u8>>, OramError> {
        // Rejected before any storage traffic, so the provider learns nothing from it.
        if let Operation::Write(payload) = &operation {
            if payload.len() > self.config.block_size {
                return Err(OramError::PayloadTooLarge {
                    length: payload.len(),
                    block_size: self.config.block_size,
                });
            }
        }

        self.complete_pending_reset(rng)?;
        self.complete_pending_eviction(rng)?;

        let geometry = self.geometry();
        // A block that has never been written is looked for on a random path,
        // so that its first access looks like any other.
        let leaf = match self.position_map.get(block_id) {
            Some(leaf) => leaf,
            None => geometry.random_leaf(rng),
        };
        let new_leaf = geometry.random_leaf(rng);

        self.stash
            .read_from_path(&mut self.physical_memory, &self.position_map, leaf)?;

        let was_written = self.position_map.contains(block_id);
        let result = self.stash.access(block_id, operation);
        let is_stashed = self.stash.contains(block_id);
        if is_stashed {
            self.position_map.insert(block_id.clone(), new_leaf);
        }

        self.evict(leaf, rng)?;

        if was_written && !is_stashed {
            log::error!("Block {} was not found on its path", block_id);
            return Err(OramError::IntegrityError {
                slot: geometry.node_on_path(leaf, geometry.height()),
                reason: format!("block {block_id} is missing from its path"),
            });
        }
        self.check_capacity(leaf)?;

        Ok(result)
    }
}
