// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common test utilities for the crate's unit tests.

use crate::{
    block::BlockId,
    config::{OramConfig, RetryPolicy, DEFAULT_STASH_OVERFLOW_SIZE},
    crypto::EncryptionKey,
    path_oram::PathOram,
    snapshot::{MemorySnapshotStore, SnapshotStore},
    storage::{CountAccessesStorage, MemoryStorage, Storage, StorageError, StorageOp},
    tree_index::TreeGeometry,
    BlockSize, BucketSize, Oram, OramError, SlotId, TreeHeight,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use simplelog::{Config, WriteLogger};
use std::collections::{HashMap, HashSet};
use std::sync::Once;

static INIT: Once = Once::new();

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

pub(crate) const TEST_BLOCK_SIZE: BlockSize = 16;

pub(crate) type TestOram<const Z: BucketSize> =
    PathOram<CountAccessesStorage<MemoryStorage>, MemorySnapshotStore, Z>;

pub(crate) fn test_config(tree_height: TreeHeight) -> OramConfig {
    OramConfig {
        tree_height,
        block_size: TEST_BLOCK_SIZE,
        max_stash_size: DEFAULT_STASH_OVERFLOW_SIZE,
        retry: RetryPolicy {
            attempts: 3,
            delay_ms: 0,
        },
    }
}

/// A fresh ORAM whose request log starts empty, i.e. does not include initialization.
pub(crate) fn new_test_oram<const Z: BucketSize>(
    tree_height: TreeHeight,
    rng: &mut StdRng,
) -> TestOram<Z> {
    let key = EncryptionKey::generate(rng);
    let mut oram = PathOram::new(
        CountAccessesStorage::new(MemoryStorage::default()),
        MemorySnapshotStore::default(),
        &key,
        test_config(tree_height),
        rng,
    )
    .unwrap();
    oram.storage_mut().clear_requests();
    oram
}

pub(crate) fn block_id(index: usize) -> BlockId {
    BlockId::new(format!("block-{index}")).unwrap()
}

/// A store that fails on demand.
#[derive(Debug, Default)]
pub(crate) struct FlakyStorage<S> {
    inner: S,
    /// The next this many fetches fail transiently.
    pub transient_fetch_failures: usize,
    /// The next this many stores fail transiently.
    pub transient_store_failures: usize,
    /// When set, this many more stores succeed and every later one fails.
    pub stores_before_outage: Option<usize>,
}

impl<S> FlakyStorage<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            transient_fetch_failures: 0,
            transient_store_failures: 0,
            stores_before_outage: None,
        }
    }
}

impl<S: Storage> Storage for FlakyStorage<S> {
    fn fetch_bucket(&mut self, slot: SlotId) -> Result<Vec<u8>, StorageError> {
        if self.transient_fetch_failures > 0 {
            self.transient_fetch_failures -= 1;
            return Err(StorageError::Transient("injected fetch failure".to_string()));
        }
        self.inner.fetch_bucket(slot)
    }

    fn store_bucket(&mut self, slot: SlotId, bytes: Vec<u8>) -> Result<(), StorageError> {
        if self.transient_store_failures > 0 {
            self.transient_store_failures -= 1;
            return Err(StorageError::Transient("injected store failure".to_string()));
        }
        match self.stores_before_outage {
            Some(0) => return Err(StorageError::Transient("storage offline".to_string())),
            Some(remaining) => self.stores_before_outage = Some(remaining - 1),
            None => {}
        }
        self.inner.store_bucket(slot, bytes)
    }
}

/// Checks that `requests` is exactly one access: the path to some leaf fetched root first,
/// then the same path stored leaf first. Returns the path.
pub(crate) fn assert_single_access_shape(
    requests: &[(StorageOp, SlotId)],
    geometry: &TreeGeometry,
) -> Vec<SlotId> {
    let path_length = geometry.path_length();
    assert_eq!(requests.len(), 2 * path_length);

    let (fetches, stores) = requests.split_at(path_length);
    assert!(fetches.iter().all(|(op, _)| *op == StorageOp::Fetch));
    assert!(stores.iter().all(|(op, _)| *op == StorageOp::Store));

    let fetched: Vec<SlotId> = fetches.iter().map(|(_, slot)| *slot).collect();
    let mut stored: Vec<SlotId> = stores.iter().map(|(_, slot)| *slot).collect();
    stored.reverse();
    assert_eq!(fetched, stored);

    let leaf_slot = fetched[path_length - 1];
    let leaf = leaf_slot - geometry.node_on_path(0, geometry.height());
    assert_eq!(fetched, geometry.path_slots(leaf));
    fetched
}

/// Reads every bucket of the tree, returning for each real block the slot holding it.
fn tree_contents<S: Storage, P: SnapshotStore, const Z: BucketSize>(
    oram: &mut PathOram<S, P, Z>,
) -> Vec<(BlockId, SlotId)> {
    let mut result = Vec::new();
    for slot in 0..oram.geometry().num_buckets() {
        let bucket = oram.physical_memory.read_bucket(slot).unwrap();
        for block in bucket.into_real_blocks() {
            result.push((block.id, slot));
        }
    }
    result
}

/// Every written block is in exactly one place, and blocks in the tree lie on the path to their leaf.
pub(crate) fn assert_tree_invariants<S: Storage, P: SnapshotStore, const Z: BucketSize>(
    oram: &mut PathOram<S, P, Z>,
) {
    let geometry = oram.geometry();
    let mut seen = HashSet::new();

    for (block_id, slot) in tree_contents(oram) {
        let leaf = oram
            .position_map
            .get(&block_id)
            .unwrap_or_else(|| panic!("{block_id} in slot {slot} has no position"));
        assert_eq!(
            geometry.node_on_path(leaf, geometry.depth_of(slot)),
            slot,
            "{block_id} is off its path"
        );
        assert!(!oram.stash.contains(&block_id), "{block_id} is duplicated");
        assert!(seen.insert(block_id.clone()), "{block_id} is duplicated");
    }

    for (block_id, _) in oram.stash.iter() {
        assert!(oram.position_map.contains(block_id));
        seen.insert(block_id.clone());
    }

    assert_eq!(seen.len(), oram.position_map.len());
}

/// Every stashed block has a free slot somewhere on the path to its leaf.
pub(crate) fn assert_stash_is_evictable<S: Storage, P: SnapshotStore, const Z: BucketSize>(
    oram: &mut PathOram<S, P, Z>,
) {
    let geometry = oram.geometry();
    let mut occupancy: HashMap<SlotId, usize> = HashMap::new();
    for (_, slot) in tree_contents(oram) {
        *occupancy.entry(slot).or_default() += 1;
    }

    for (block_id, _) in oram.stash.iter() {
        let leaf = oram.position_map.get(block_id).unwrap();
        assert!(
            geometry
                .path_slots(leaf)
                .iter()
                .any(|slot| occupancy.get(slot).copied().unwrap_or(0) < Z),
            "the path of stashed block {block_id} is full"
        );
    }
}

/// Tests the correctness of `PathOram` on a workload of random reads and writes over `num_blocks` identifiers.
pub(crate) fn test_correctness_random_workload<const Z: BucketSize>(
    tree_height: TreeHeight,
    num_blocks: usize,
    num_operations: u32,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);

    let mut oram = new_test_oram::<Z>(tree_height, &mut rng);
    let geometry = oram.geometry();
    let mut mirror: HashMap<BlockId, Vec<u8>> = HashMap::new();

    for _ in 0..num_operations {
        let id = block_id(rng.gen_range(0..num_blocks));
        oram.storage_mut().clear_requests();

        if rng.gen::<bool>() {
            match mirror.get(&id) {
                Some(expected) => assert_eq!(&oram.read_block(&id, &mut rng).unwrap(), expected),
                None => assert!(matches!(
                    oram.read_block(&id, &mut rng),
                    Err(OramError::NotFoundError(_))
                )),
            }
        } else {
            let length = rng.gen_range(0..=TEST_BLOCK_SIZE);
            let payload: Vec<u8> = (0..length).map(|_| rng.gen()).collect();
            oram.write_block(&id, payload.clone(), &mut rng).unwrap();
            mirror.insert(id, payload);
        }

        assert_single_access_shape(&oram.storage().requests, &geometry);
    }

    for (id, expected) in &mirror {
        assert_eq!(&oram.read_block(id, &mut rng).unwrap(), expected, "{id}");
    }

    assert_tree_invariants(&mut oram);
    // With no more than one path worth of blocks, no path can fill up.
    if num_blocks <= Z * geometry.path_length() {
        assert_stash_is_evictable(&mut oram);
    }
}

macro_rules! create_path_oram_correctness_test {
    ($bucket_size: expr, $tree_height: expr, $num_blocks: expr, $iterations_to_test: expr) => {
        paste::paste! {
            #[test]
            fn [<test_correctness_random_workload_z $bucket_size _height $tree_height _blocks $num_blocks _ $iterations_to_test>]() {
                crate::test_utils::test_correctness_random_workload::<$bucket_size>($tree_height, $num_blocks, $iterations_to_test);
            }
        }
    };
}

// Each case keeps `num_blocks` at most Z * (L + 1), except the last, which exercises a realistically loaded tree.
macro_rules! create_path_oram_correctness_tests {
    () => {
        crate::test_utils::create_path_oram_correctness_test!(2, 0, 2, 20);
        crate::test_utils::create_path_oram_correctness_test!(2, 3, 8, 200);
        crate::test_utils::create_path_oram_correctness_test!(3, 2, 9, 200);
        crate::test_utils::create_path_oram_correctness_test!(4, 0, 4, 50);
        crate::test_utils::create_path_oram_correctness_test!(4, 3, 16, 300);
        crate::test_utils::create_path_oram_correctness_test!(4, 5, 24, 300);
        crate::test_utils::create_path_oram_correctness_test!(5, 4, 25, 300);
        crate::test_utils::create_path_oram_correctness_test!(4, 6, 64, 1000);
    };
}

pub(crate) use create_path_oram_correctness_test;
pub(crate) use create_path_oram_correctness_tests;
