// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A Path ORAM client for untrusted bucket stores.
//!
//! Every logical read or write of a block is turned into the same shape of physical traffic:
//! one fetch of each bucket on a random root-to-leaf path, followed by one store of each of those buckets.
//! Block contents and metadata are sealed with AES-GCM before they leave the client,
//! and the accessed block is moved to a fresh random leaf after every access,
//! so the storage provider cannot tell which block was requested or whether two requests were for the same block.
//!
//! The main entry point is [`PathOram`], which owns the position map and stash,
//! talks to any [`Storage`] implementation, and persists its client-side state through a [`SnapshotStore`].
//! [`SharedOram`] funnels concurrent callers through a single engine.
//!
//! ```no_run
//! use oram_store::{
//!     BlockId, EncryptionKey, MemorySnapshotStore, MemoryStorage, Oram, OramConfig, PathOram,
//! };
//! use rand::rngs::OsRng;
//!
//! # fn main() -> Result<(), oram_store::OramError> {
//! let mut rng = OsRng;
//! let key = EncryptionKey::generate(&mut rng);
//! let mut oram: PathOram<_, _> = PathOram::new(
//!     MemoryStorage::default(),
//!     MemorySnapshotStore::default(),
//!     &key,
//!     OramConfig::default(),
//!     &mut rng,
//! )?;
//! let id = BlockId::new("photo-1")?;
//! oram.write_block(&id, b"ABC".to_vec(), &mut rng)?;
//! assert_eq!(oram.read_block(&id, &mut rng)?, b"ABC".to_vec());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use rand::{CryptoRng, RngCore};
use std::num::TryFromIntError;
use thiserror::Error;

pub mod block;
pub mod bucket;
pub mod config;
pub mod crypto;
pub mod path_oram;
pub mod physical_memory;
pub mod position_map;
pub mod shared;
pub mod snapshot;
pub mod stash;
pub mod storage;
pub mod tree_index;

#[cfg(test)]
mod test_utils;

pub use crate::block::BlockId;
pub use crate::config::{OramConfig, RetryPolicy};
pub use crate::crypto::{BlockCipher, EncryptionKey};
pub use crate::path_oram::{PathOram, DEFAULT_BLOCKS_PER_BUCKET};
pub use crate::shared::SharedOram;
pub use crate::snapshot::{FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};
pub use crate::storage::{
    CountAccessesStorage, FileStorage, MemoryStorage, Storage, StorageError, StorageOp,
};
pub use crate::tree_index::TreeGeometry;

/// The numeric type used to specify the size of an ORAM block payload in bytes.
pub type BlockSize = usize;
/// The numeric type used to specify the size of an ORAM bucket in blocks.
pub type BucketSize = usize;
/// The numeric type used to specify the size of the stash in blocks.
pub type StashSize = usize;
/// Flat index of a bucket in the tree, which is also the key under which the bucket is stored.
pub type SlotId = u64;
/// Index of a leaf of the tree, in `0..2^height`.
pub type LeafIndex = u64;
/// Height of the tree; a tree of height `L` has `2^L` leaves and `L + 1` buckets per path.
pub type TreeHeight = u32;

/// The operation performed by a single ORAM access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Return the block's payload unchanged.
    Read,
    /// Replace (or create) the block's payload.
    Write(Vec<u8>),
}

/// Represents an oblivious store of byte blocks keyed by caller-chosen `BlockId`s.
pub trait Oram {
    /// Performs one oblivious access to `block_id`.
    ///
    /// Returns the payload the block held before the access,
    /// or `None` if the block had never been written.
    /// The physical traffic is the same in every case.
    fn access<R: RngCore + CryptoRng>(
        &mut self,
        block_id: &BlockId,
        operation: Operation,
        rng: &mut R,
    ) -> Result<Option<Vec<u8>>, OramError>;

    /// Obliviously reads the payload stored under `block_id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFoundError` if `block_id` has never been written.
    fn read_block<R: RngCore + CryptoRng>(
        &mut self,
        block_id: &BlockId,
        rng: &mut R,
    ) -> Result<Vec<u8>, OramError> {
        self.access(block_id, Operation::Read, rng)?
            .ok_or_else(|| OramError::NotFoundError(block_id.clone()))
    }

    /// Obliviously writes `payload` under `block_id`.
    fn write_block<R: RngCore + CryptoRng>(
        &mut self,
        block_id: &BlockId,
        payload: Vec<u8>,
        rng: &mut R,
    ) -> Result<(), OramError> {
        self.access(block_id, Operation::Write(payload), rng)?;
        Ok(())
    }
}

/// Errors returned by the ORAM.
#[derive(Error, Debug)]
pub enum OramError {
    /// The storage provider kept failing after every retry.
    #[error("Storage failure on slot {slot} after {attempts} attempts: {message}")]
    TransientStorageError {
        /// The slot being fetched or stored.
        slot: SlotId,
        /// The number of attempts made.
        attempts: u64,
        /// The last error reported by the storage driver.
        message: String,
    },

    /// A bucket was missing, malformed, relocated, or failed authentication.
    #[error("Integrity failure on slot {slot}: {reason}")]
    IntegrityError {
        /// The slot whose contents could not be trusted.
        slot: SlotId,
        /// What went wrong.
        reason: String,
    },

    /// The requested block has never been written.
    #[error("Block {0} has never been written")]
    NotFoundError(BlockId),

    /// Eviction could not keep the stash within its bounds.
    ///
    /// Raised at once when a block assigned to the evicted leaf is left over, since every
    /// bucket on its path is then full. A leftover block assigned to another leaf is not
    /// an error by itself; it is reported only when the stash grows past `max_stash_size`.
    #[error("Stash capacity fault: {0}")]
    CapacityFault(String),

    /// The ORAM was configured with an invalid parameter.
    #[error("Invalid configuration: {parameter_name} = {parameter_value}")]
    InvalidConfigurationError {
        /// The name of the offending parameter.
        parameter_name: String,
        /// Its value.
        parameter_value: String,
    },

    /// The block identifier is too long to fit in a block header.
    #[error("Block identifier is {length} bytes long (maximum: {maximum})")]
    BlockIdTooLong {
        /// The length of the rejected identifier.
        length: usize,
        /// The maximum identifier length.
        maximum: usize,
    },

    /// Sealing a block with AES-GCM failed.
    #[error("Block encryption failed")]
    EncryptionError,

    /// The payload does not fit in a block.
    #[error("Payload is {length} bytes long (block size: {block_size})")]
    PayloadTooLarge {
        /// The length of the rejected payload.
        length: usize,
        /// The configured block size.
        block_size: BlockSize,
    },

    /// Another caller panicked while holding the engine lock.
    #[error("The ORAM lock was poisoned")]
    LockPoisoned,

    /// Numeric conversion failed.
    #[error("Numeric conversion failed")]
    IntegerConversionError(#[from] TryFromIntError),

    /// A local file (snapshot, key, or configuration) could not be read or written.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A snapshot or configuration file could not be (de)serialized.
    #[error("Malformed snapshot or configuration: {0}")]
    SnapshotFormatError(#[from] serde_json::Error),
}

impl OramError {
    /// Whether retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, OramError::TransientStorageError { .. })
    }
}
