// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Path ORAM blocks and their fixed-width plaintext encoding.

use crate::{BlockSize, OramError};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::fmt;
use std::str::FromStr;

/// The maximum length of a block identifier, in bytes.
pub const MAX_BLOCK_ID_LEN: usize = 64;

const_assert!(MAX_BLOCK_ID_LEN <= u8::MAX as usize);

const KIND_DUMMY: u8 = 0;
const KIND_REAL: u8 = 1;

/// The number of bytes preceding the payload in an encoded block:
/// a kind byte, an identifier length byte, the padded identifier, and a 4-byte payload length.
pub const BLOCK_HEADER_LEN: usize = 1 + 1 + MAX_BLOCK_ID_LEN + 4;

/// A caller-chosen identifier of a logical block, at most `MAX_BLOCK_ID_LEN` bytes of UTF-8.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId(String);

impl BlockId {
    /// Returns a new identifier, or `BlockIdTooLong` if `id` does not fit in a block header.
    pub fn new(id: impl Into<String>) -> Result<Self, OramError> {
        let id = id.into();
        if id.len() > MAX_BLOCK_ID_LEN {
            return Err(OramError::BlockIdTooLong {
                length: id.len(),
                maximum: MAX_BLOCK_ID_LEN,
            });
        }
        Ok(Self(id))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl TryFrom<String> for BlockId {
    type Error = OramError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl FromStr for BlockId {
    type Err = OramError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        Self::new(id)
    }
}

impl From<BlockId> for String {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

/// A Path ORAM block: a payload together with the identifier it is stored under.
#[derive(Clone, PartialEq, Eq)]
pub struct PathOramBlock {
    /// The identifier of the block. Empty for dummy blocks.
    pub id: BlockId,
    /// The payload of the block. Empty for dummy blocks.
    pub payload: Vec<u8>,
    is_dummy: bool,
}

impl PathOramBlock {
    /// Returns a real block.
    pub fn new(id: BlockId, payload: Vec<u8>) -> Self {
        Self {
            id,
            payload,
            is_dummy: false,
        }
    }

    /// Returns a padding block carrying no caller-visible data.
    pub fn dummy() -> Self {
        Self {
            id: BlockId::default(),
            payload: Vec::new(),
            is_dummy: true,
        }
    }

    /// Whether this block is padding.
    pub fn is_dummy(&self) -> bool {
        self.is_dummy
    }

    /// The length of an encoded block with payloads of up to `block_size` bytes.
    pub fn encoded_len(block_size: BlockSize) -> usize {
        BLOCK_HEADER_LEN + block_size
    }

    /// Encodes the block into exactly `encoded_len(block_size)` bytes, whatever its kind or payload length.
    pub fn encode(&self, block_size: BlockSize) -> Result<Vec<u8>, OramError> {
        if self.payload.len() > block_size {
            return Err(OramError::PayloadTooLarge {
                length: self.payload.len(),
                block_size,
            });
        }

        let mut result = vec![0u8; Self::encoded_len(block_size)];
        if self.is_dummy {
            result[0] = KIND_DUMMY;
            return Ok(result);
        }

        let id = self.id.as_str().as_bytes();
        let payload_length = u32::try_from(self.payload.len())?;
        result[0] = KIND_REAL;
        result[1] = u8::try_from(id.len())?;
        result[2..2 + id.len()].copy_from_slice(id);
        result[2 + MAX_BLOCK_ID_LEN..BLOCK_HEADER_LEN]
            .copy_from_slice(&payload_length.to_le_bytes());
        result[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + self.payload.len()]
            .copy_from_slice(&self.payload);
        Ok(result)
    }

    /// Decodes a block produced by `encode`. Returns `None` if `bytes` is not a well-formed encoding.
    pub fn decode(bytes: &[u8], block_size: BlockSize) -> Option<Self> {
        if bytes.len() != Self::encoded_len(block_size) {
            return None;
        }

        match bytes[0] {
            KIND_DUMMY => Some(Self::dummy()),
            KIND_REAL => {
                let id_length = usize::from(bytes[1]);
                if id_length > MAX_BLOCK_ID_LEN {
                    return None;
                }
                let id = std::str::from_utf8(&bytes[2..2 + id_length]).ok()?;

                let mut length_bytes = [0u8; 4];
                length_bytes.copy_from_slice(&bytes[2 + MAX_BLOCK_ID_LEN..BLOCK_HEADER_LEN]);
                let payload_length = usize::try_from(u32::from_le_bytes(length_bytes)).ok()?;
                if payload_length > block_size {
                    return None;
                }

                Some(Self::new(
                    BlockId(id.to_string()),
                    bytes[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + payload_length].to_vec(),
                ))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for PathOramBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dummy {
            write!(f, "PathOramBlock::Dummy")
        } else {
            f.debug_struct("PathOramBlock")
                .field("id", &self.id)
                .field("payload_length", &self.payload.len())
                .finish()
        }
    }
}
