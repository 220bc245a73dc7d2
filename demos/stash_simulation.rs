// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Measures how large the stash gets in practice.
//!
//! Fills a tree with one block per leaf, then reads the blocks round-robin and records the stash
//! occupancy after every access. Prints, for every size `k`, the number of accesses after which
//! the stash held at least `k` blocks.
//!
//! Usage: `cargo run --release --example stash_simulation [HEIGHT] [WARMUP_ACCESSES] [RECORDED_ACCESSES]`

use oram_store::{
    BlockId, BucketSize, EncryptionKey, MemorySnapshotStore, MemoryStorage, Oram, OramConfig,
    OramError, PathOram, RetryPolicy, StashSize, TreeHeight,
};
use rand::{rngs::StdRng, SeedableRng};
use std::str::FromStr;

const BUCKET_SIZE: BucketSize = 4;

fn argument<T: FromStr>(position: usize, default: T) -> T {
    std::env::args()
        .nth(position)
        .and_then(|argument| argument.parse().ok())
        .unwrap_or(default)
}

/// Turns a histogram of exact sizes into counts of "at least this size".
fn complementary_cumulative_counts(histogram: &[u64]) -> Vec<u64> {
    let mut result = histogram.to_vec();
    for size in (0..result.len().saturating_sub(1)).rev() {
        result[size] += result[size + 1];
    }
    result
}

fn main() -> Result<(), OramError> {
    let height: TreeHeight = argument(1, 10);
    let warmup_accesses: u64 = argument(2, 20_000);
    let recorded_accesses: u64 = argument(3, 100_000);

    let mut rng = StdRng::seed_from_u64(0);
    let key = EncryptionKey::generate(&mut rng);
    let config = OramConfig {
        tree_height: height,
        block_size: 32,
        // Overflow is what is being measured, so it must not abort the run.
        max_stash_size: StashSize::MAX,
        retry: RetryPolicy {
            attempts: 1,
            delay_ms: 0,
        },
    };
    let mut oram = PathOram::<_, _, BUCKET_SIZE>::new(
        MemoryStorage::default(),
        MemorySnapshotStore::default(),
        &key,
        config,
        &mut rng,
    )?;

    let num_blocks = oram.geometry().num_leaves();
    let block_ids = (0..num_blocks)
        .map(|index| BlockId::new(index.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    println!(
        "Warming up a tree of height {} (Z = {}) with {} writes...",
        height, BUCKET_SIZE, warmup_accesses
    );
    for access in 0..warmup_accesses {
        let block_id = &block_ids[(access % num_blocks) as usize];
        oram.write_block(block_id, access.to_le_bytes().to_vec(), &mut rng)?;
    }

    println!("Recording {} reads...", recorded_accesses);
    let mut histogram: Vec<u64> = Vec::new();
    for access in 0..recorded_accesses {
        let block_id = &block_ids[(access % num_blocks) as usize];
        oram.read_block(block_id, &mut rng)?;

        let occupancy = oram.stash_occupancy();
        if histogram.len() <= occupancy {
            histogram.resize(occupancy + 1, 0);
        }
        histogram[occupancy] += 1;
    }

    println!("stash_size,count");
    for (size, count) in complementary_cumulative_counts(&histogram)
        .into_iter()
        .enumerate()
    {
        println!("{},{}", size, count);
    }
    Ok(())
}
