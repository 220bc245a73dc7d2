// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Configuration of a `PathOram`.

use crate::{
    tree_index::MAXIMUM_TREE_HEIGHT, BlockSize, OramError, StashSize, TreeHeight,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// The default height of the tree (1024 leaves).
pub const DEFAULT_TREE_HEIGHT: TreeHeight = 10;
/// The default block payload size in bytes.
pub const DEFAULT_BLOCK_SIZE: BlockSize = 4096;
/// The default number of blocks the stash may hold after an access before it is considered to have overflowed.
pub const DEFAULT_STASH_OVERFLOW_SIZE: StashSize = 40;
/// The default number of attempts made for each storage request.
pub const DEFAULT_RETRY_ATTEMPTS: u64 = 3;
/// The default pause before the first retry, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 50;

/// How transient storage failures are retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first. Must be at least 1.
    pub attempts: u64,
    /// Pause before the first retry. Each later retry waits twice as long, up to five seconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

/// Parameters of a `PathOram`. The bucket capacity `Z` is a type parameter of the engine instead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OramConfig {
    /// Height `L` of the tree.
    pub tree_height: TreeHeight,
    /// Largest payload, in bytes, a block can hold.
    pub block_size: BlockSize,
    /// Largest stash occupancy tolerated after an access.
    pub max_stash_size: StashSize,
    /// Retry behaviour for storage requests.
    pub retry: RetryPolicy,
}

impl Default for OramConfig {
    fn default() -> Self {
        Self {
            tree_height: DEFAULT_TREE_HEIGHT,
            block_size: DEFAULT_BLOCK_SIZE,
            max_stash_size: DEFAULT_STASH_OVERFLOW_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl OramConfig {
    /// Reads a configuration from a JSON file. Missing fields take their default values.
    pub fn from_json_file(path: &Path) -> Result<Self, OramError> {
        let config: Self = serde_json::from_slice(&fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every parameter is in range.
    pub fn validate(&self) -> Result<(), OramError> {
        let invalid = |parameter_name: &str, parameter_value: String| {
            Err(OramError::InvalidConfigurationError {
                parameter_name: parameter_name.to_string(),
                parameter_value,
            })
        };

        if self.tree_height > MAXIMUM_TREE_HEIGHT {
            return invalid("tree_height", self.tree_height.to_string());
        }
        if self.block_size == 0 || u32::try_from(self.block_size).is_err() {
            return invalid("block_size", self.block_size.to_string());
        }
        if self.retry.attempts == 0 {
            return invalid("retry.attempts", self.retry.attempts.to_string());
        }
        Ok(())
    }
}
