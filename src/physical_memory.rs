// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM tree as stored by the untrusted provider: sealed buckets behind a `Storage`.

use crate::{
    bucket::Bucket,
    config::RetryPolicy,
    crypto::BlockCipher,
    storage::{Storage, StorageError},
    tree_index::TreeGeometry,
    BlockSize, BucketSize, OramError, SlotId,
};
use rand::{CryptoRng, RngCore};
use retry::OperationResult;
use std::time::Duration;

/// Reads and writes whole buckets, sealing and opening them on the way.
/// Transient storage errors are retried according to the configured `RetryPolicy`.
#[derive(Debug)]
pub struct PhysicalMemory<S, const Z: BucketSize> {
    storage: S,
    cipher: BlockCipher,
    geometry: TreeGeometry,
    block_size: BlockSize,
    retry_policy: RetryPolicy,
}

impl<S: Storage, const Z: BucketSize> PhysicalMemory<S, Z> {
    /// Wraps `storage`.
    pub fn new(
        storage: S,
        cipher: BlockCipher,
        geometry: TreeGeometry,
        block_size: BlockSize,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            cipher,
            geometry,
            block_size,
            retry_policy,
        }
    }

    /// The shape of the tree.
    pub fn geometry(&self) -> &TreeGeometry {
        &self.geometry
    }

    /// The largest payload a block can hold.
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// The underlying store.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The underlying store, mutably.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Fetches and opens the bucket at `slot`.
    ///
    /// # Errors
    ///
    /// A missing bucket is an `IntegrityError`: once the tree is initialized every slot holds a bucket.
    pub fn read_bucket(&mut self, slot: SlotId) -> Result<Bucket<Z>, OramError> {
        let sealed = self.fetch_with_retries(slot)?;
        Bucket::open(&sealed, slot, &self.cipher, self.block_size).map_err(|error| {
            log::error!("{}", error);
            error
        })
    }

    /// Seals `bucket` for `slot` and stores it.
    pub fn write_bucket<R: RngCore + CryptoRng>(
        &mut self,
        slot: SlotId,
        bucket: &Bucket<Z>,
        rng: &mut R,
    ) -> Result<(), OramError> {
        let sealed = bucket.seal(slot, &self.cipher, self.block_size, rng)?;
        self.store_with_retries(slot, sealed)
    }

    /// Fetches every bucket on the path to `leaf`, root first.
    /// Either every bucket is returned or none is.
    pub fn read_path(&mut self, leaf: u64) -> Result<Vec<Bucket<Z>>, OramError> {
        self.geometry
            .path_slots(leaf)
            .into_iter()
            .map(|slot| self.read_bucket(slot))
            .collect()
    }

    /// Fills every slot of the tree with a bucket of dummy blocks.
    pub fn initialize<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(), OramError> {
        log::info!(
            "Initializing {} buckets (Z = {}, block size = {})",
            self.geometry.num_buckets(),
            Z,
            self.block_size
        );

        // The root is the only slot that may legitimately be missing: it tells us whether this store is fresh.
        match self.storage.fetch_bucket(0) {
            Err(StorageError::NotFound(_)) => {}
            Ok(_) => log::warn!("Overwriting an existing tree"),
            Err(StorageError::Transient(message)) => {
                log::warn!("Could not probe the root bucket: {}", message)
            }
        }

        let empty = Bucket::<Z>::default();
        for slot in 0..self.geometry.num_buckets() {
            self.write_bucket(slot, &empty, rng)?;
        }
        Ok(())
    }

    fn fetch_with_retries(&mut self, slot: SlotId) -> Result<Vec<u8>, OramError> {
        let storage = &mut self.storage;
        let result = retry::retry(self.retry_policy.delays(), || {
            match storage.fetch_bucket(slot) {
                Ok(bytes) => OperationResult::Ok(bytes),
                Err(StorageError::Transient(message)) => {
                    log::warn!("Fetch of slot {} failed, retrying: {}", slot, message);
                    OperationResult::Retry(StorageError::Transient(message))
                }
                Err(error) => OperationResult::Err(error),
            }
        });

        result.map_err(|error| match error {
            retry::Error::Operation {
                error: StorageError::NotFound(_),
                ..
            } => {
                log::error!("Bucket {} is missing", slot);
                OramError::IntegrityError {
                    slot,
                    reason: "bucket is missing".to_string(),
                }
            }
            retry::Error::Operation {
                error: StorageError::Transient(message),
                tries,
                ..
            } => OramError::TransientStorageError {
                slot,
                attempts: tries,
                message,
            },
            retry::Error::Internal(message) => OramError::TransientStorageError {
                slot,
                attempts: 0,
                message,
            },
        })
    }

    fn store_with_retries(&mut self, slot: SlotId, bytes: Vec<u8>) -> Result<(), OramError> {
        let storage = &mut self.storage;
        let result = retry::retry(self.retry_policy.delays(), || {
            match storage.store_bucket(slot, bytes.clone()) {
                Ok(()) => OperationResult::Ok(()),
                Err(StorageError::Transient(message)) => {
                    log::warn!("Store of slot {} failed, retrying: {}", slot, message);
                    OperationResult::Retry(message)
                }
                Err(StorageError::NotFound(_)) => {
                    OperationResult::Err("store reported a missing slot".to_string())
                }
            }
        });

        result.map_err(|error| match error {
            retry::Error::Operation { error, tries, .. } => OramError::TransientStorageError {
                slot,
                attempts: tries,
                message: error,
            },
            retry::Error::Internal(message) => OramError::TransientStorageError {
                slot,
                attempts: 0,
                message,
            },
        })
    }
}

/// Longest pause between two attempts, whatever the configured delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

impl RetryPolicy {
    /// Pauses used by `retry` between attempts: `delay_ms` before the first retry,
    /// doubling for each later one, capped at `MAX_RETRY_DELAY`.
    fn delays(&self) -> impl Iterator<Item = Duration> {
        let retries = self.attempts.saturating_sub(1);
        let base = Duration::from_millis(self.delay_ms);
        (0..retries).map(move |retry_index| {
            let factor = 1u32 << retry_index.min(16);
            base.saturating_mul(factor).min(MAX_RETRY_DELAY)
        })
    }
}
