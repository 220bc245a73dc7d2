// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A handle that lets several threads share one `PathOram`.

use crate::{
    block::BlockId, path_oram::PathOram, snapshot::SnapshotStore, storage::Storage, BucketSize,
    Oram, OramError, StashSize, DEFAULT_BLOCKS_PER_BUCKET,
};
use rand::rngs::OsRng;
use std::sync::{Arc, Mutex, MutexGuard};

/// Serializes accesses from any number of callers through a single engine.
///
/// Each call holds the lock for the whole access, from the first fetch to the last snapshot save,
/// so accesses never interleave. Clones share the same engine.
#[derive(Debug)]
pub struct SharedOram<S: Storage, P: SnapshotStore, const Z: BucketSize = DEFAULT_BLOCKS_PER_BUCKET>(
    Arc<Mutex<PathOram<S, P, Z>>>,
);

impl<S: Storage, P: SnapshotStore, const Z: BucketSize> Clone for SharedOram<S, P, Z> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S: Storage, P: SnapshotStore, const Z: BucketSize> SharedOram<S, P, Z> {
    /// Takes ownership of `oram`.
    pub fn new(oram: PathOram<S, P, Z>) -> Self {
        Self(Arc::new(Mutex::new(oram)))
    }

    /// Obliviously reads `block_id`. See `Oram::read_block`.
    pub fn read_block(&self, block_id: &BlockId) -> Result<Vec<u8>, OramError> {
        self.lock()?.read_block(block_id, &mut OsRng)
    }

    /// Obliviously writes `payload` under `block_id`. See `Oram::write_block`.
    pub fn write_block(&self, block_id: &BlockId, payload: Vec<u8>) -> Result<(), OramError> {
        self.lock()?.write_block(block_id, payload, &mut OsRng)
    }

    /// Resets the shared engine. See `PathOram::reset`.
    pub fn reset(&self) -> Result<(), OramError> {
        self.lock()?.reset(&mut OsRng)
    }

    /// The number of blocks currently held in the stash.
    pub fn stash_occupancy(&self) -> Result<StashSize, OramError> {
        Ok(self.lock()?.stash_occupancy())
    }

    fn lock(&self) -> Result<MutexGuard<'_, PathOram<S, P, Z>>, OramError> {
        self.0.lock().map_err(|_| OramError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::EncryptionKey,
        snapshot::MemorySnapshotStore,
        storage::MemoryStorage,
        test_utils::{block_id, init_logger, test_config},
    };
    use std::thread;

    #[test]
    fn concurrent_writers_are_serialized() {
        init_logger();
        let key = EncryptionKey::generate(&mut OsRng);
        let oram = PathOram::<_, _, 4>::new(
            MemoryStorage::default(),
            MemorySnapshotStore::default(),
            &key,
            test_config(4),
            &mut OsRng,
        )
        .unwrap();
        let shared = SharedOram::new(oram);

        let handles: Vec<_> = (0..4)
            .map(|thread_index| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..5 {
                        let index = thread_index * 5 + i;
                        shared
                            .write_block(&block_id(index), vec![index as u8])
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for index in 0..20 {
            assert_eq!(
                shared.read_block(&block_id(index)).unwrap(),
                vec![index as u8]
            );
        }
        assert!(matches!(
            shared.read_block(&block_id(20)),
            Err(OramError::NotFoundError(_))
        ));
    }

    #[test]
    fn poisoned_lock_is_reported() {
        init_logger();
        let key = EncryptionKey::generate(&mut OsRng);
        let oram = PathOram::<_, _, 4>::new(
            MemoryStorage::default(),
            MemorySnapshotStore::default(),
            &key,
            test_config(2),
            &mut OsRng,
        )
        .unwrap();
        let shared = SharedOram::new(oram);

        let poisoner = shared.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(matches!(
            shared.read_block(&block_id(0)),
            Err(OramError::LockPoisoned)
        ));
    }
}
