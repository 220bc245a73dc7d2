// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A Path ORAM bucket and its sealed wire format.

use crate::{
    block::PathOramBlock,
    crypto::{AuthenticationError, BlockCipher},
    BlockSize, BucketSize, OramError, SlotId,
};
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;

/// Every sealed block is bound to the slot and the position within the bucket it was written to.
const SLOT_METADATA_LEN: usize = 8 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A Path ORAM bucket of exactly `Z` blocks, each of which may be a dummy.
pub struct Bucket<const Z: BucketSize> {
    /// The Path ORAM blocks stored by this bucket.
    pub blocks: [PathOramBlock; Z],
}

impl<const Z: BucketSize> Default for Bucket<Z> {
    fn default() -> Self {
        Self {
            blocks: std::array::from_fn(|_| PathOramBlock::dummy()),
        }
    }
}

impl<const Z: BucketSize> Bucket<Z> {
    /// Builds a bucket from at most `Z` real blocks, padding the remaining slots with dummies.
    ///
    /// # Panics
    ///
    /// Panics if more than `Z` blocks are given.
    pub fn from_blocks(blocks: Vec<PathOramBlock>) -> Self {
        assert!(blocks.len() <= Z);

        let mut result = Self::default();
        for (slot, block) in result.blocks.iter_mut().zip(blocks) {
            *slot = block;
        }
        result
    }

    /// The number of real blocks in the bucket.
    pub fn occupancy(&self) -> usize {
        self.blocks.iter().filter(|block| !block.is_dummy()).count()
    }

    /// Consumes the bucket, returning its real blocks.
    pub fn into_real_blocks(self) -> impl Iterator<Item = PathOramBlock> {
        self.blocks.into_iter().filter(|block| !block.is_dummy())
    }

    /// The length of a sealed bucket. It depends only on `Z` and `block_size`.
    pub fn sealed_len(block_size: BlockSize) -> usize {
        Z * Self::sealed_block_len(block_size)
    }

    fn sealed_block_len(block_size: BlockSize) -> usize {
        BlockCipher::sealed_len(PathOramBlock::encoded_len(block_size), SLOT_METADATA_LEN)
    }

    fn slot_metadata(slot: SlotId, index: usize) -> Result<[u8; SLOT_METADATA_LEN], OramError> {
        let mut metadata = [0u8; SLOT_METADATA_LEN];
        metadata[..8].copy_from_slice(&slot.to_le_bytes());
        metadata[8..].copy_from_slice(&u32::try_from(index)?.to_le_bytes());
        Ok(metadata)
    }

    /// Encrypts every block, real or dummy, under a fresh nonce, binding it to `slot`.
    pub fn seal<R: RngCore + CryptoRng>(
        &self,
        slot: SlotId,
        cipher: &BlockCipher,
        block_size: BlockSize,
        rng: &mut R,
    ) -> Result<Vec<u8>, OramError> {
        let mut result = Vec::with_capacity(Self::sealed_len(block_size));
        for (index, block) in self.blocks.iter().enumerate() {
            let plaintext = block.encode(block_size)?;
            let metadata = Self::slot_metadata(slot, index)?;
            result.extend(cipher.encrypt_block(&plaintext, &metadata, rng)?);
        }
        Ok(result)
    }

    /// Decrypts and authenticates a bucket sealed by `seal` for the same `slot`.
    ///
    /// # Errors
    ///
    /// Returns an `IntegrityError` if the bytes have the wrong length, fail authentication,
    /// were sealed for a different slot, or do not contain well-formed blocks.
    pub fn open(
        sealed: &[u8],
        slot: SlotId,
        cipher: &BlockCipher,
        block_size: BlockSize,
    ) -> Result<Self, OramError> {
        let integrity_error = |reason: &str| OramError::IntegrityError {
            slot,
            reason: reason.to_string(),
        };

        if sealed.len() != Self::sealed_len(block_size) {
            return Err(integrity_error("unexpected bucket length"));
        }

        let mut result = Self::default();
        for (index, chunk) in sealed
            .chunks_exact(Self::sealed_block_len(block_size))
            .enumerate()
        {
            let (plaintext, metadata) = cipher
                .decrypt_block(chunk)
                .map_err(|AuthenticationError| integrity_error("authentication failed"))?;

            let expected_metadata = Self::slot_metadata(slot, index)?;
            if !bool::from(metadata.as_slice().ct_eq(&expected_metadata[..])) {
                return Err(integrity_error("block was sealed for a different slot"));
            }

            result.blocks[index] = PathOramBlock::decode(&plaintext, block_size)
                .ok_or_else(|| integrity_error("malformed block"))?;
        }
        Ok(result)
    }
}
