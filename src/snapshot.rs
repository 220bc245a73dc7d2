// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Persistence of the client-side state: position map, stash, and any eviction in flight.

use crate::{
    block::BlockId, config::OramConfig, position_map::PositionMap, stash::Stash,
    tree_index::TreeGeometry, BlockSize, BucketSize, LeafIndex, OramError, TreeHeight,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// The version written into every snapshot.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A stashed block as it appears in a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBlock {
    /// The block's identifier.
    pub block_id: BlockId,
    /// The block's payload, hex encoded in the file.
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    /// Always `false`: only real blocks are stashed. Kept for readers that expect the flag.
    #[serde(default)]
    pub is_dummy: bool,
}

/// Everything the client needs to resume after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// `SNAPSHOT_FORMAT_VERSION` at the time of writing.
    pub format_version: u32,
    /// Height of the tree the snapshot belongs to.
    pub tree_height: TreeHeight,
    /// Bucket capacity `Z` of that tree.
    pub bucket_capacity: BucketSize,
    /// Block payload size of that tree.
    pub block_size: BlockSize,
    /// Leaf assignment of every block ever written.
    pub position_map: PositionMap,
    /// Blocks that were not in the tree.
    pub stash: Vec<SnapshotBlock>,
    /// The leaf whose path was being written back when the snapshot was taken, if any.
    #[serde(default)]
    pub pending_eviction: Option<LeafIndex>,
    /// Set while the tree is being rewritten with dummy buckets. The position map and stash are
    /// then empty, and the rewrite must be finished before the tree is read again.
    #[serde(default)]
    pub reset_in_progress: bool,
}

impl Snapshot {
    /// Captures the client-side state of an engine.
    pub fn capture(
        config: &OramConfig,
        bucket_capacity: BucketSize,
        position_map: &PositionMap,
        stash: &Stash,
        pending_eviction: Option<LeafIndex>,
        reset_in_progress: bool,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            tree_height: config.tree_height,
            bucket_capacity,
            block_size: config.block_size,
            position_map: position_map.clone(),
            stash: stash
                .iter()
                .map(|(block_id, payload)| SnapshotBlock {
                    block_id: block_id.clone(),
                    payload: payload.clone(),
                    is_dummy: false,
                })
                .collect(),
            pending_eviction,
            reset_in_progress,
        }
    }

    /// Checks that the snapshot was taken by an engine with the same shape, and is internally consistent.
    pub fn check_compatible(
        &self,
        config: &OramConfig,
        bucket_capacity: BucketSize,
    ) -> Result<(), OramError> {
        let mismatch = |parameter_name: &str, parameter_value: String| {
            Err(OramError::InvalidConfigurationError {
                parameter_name: parameter_name.to_string(),
                parameter_value,
            })
        };

        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return mismatch("format_version", self.format_version.to_string());
        }
        if self.tree_height != config.tree_height {
            return mismatch("tree_height", self.tree_height.to_string());
        }
        if self.bucket_capacity != bucket_capacity {
            return mismatch("bucket_capacity", self.bucket_capacity.to_string());
        }
        if self.block_size != config.block_size {
            return mismatch("block_size", self.block_size.to_string());
        }

        let geometry = TreeGeometry::new(self.tree_height)?;
        if !self.position_map.fits_tree(geometry.num_leaves()) {
            return mismatch("position_map", "leaf out of range".to_string());
        }
        if let Some(leaf) = self.pending_eviction {
            if !geometry.is_leaf(leaf) {
                return mismatch("pending_eviction", leaf.to_string());
            }
        }
        if let Some(block) = self.stash.iter().find(|block| {
            block.is_dummy
                || block.payload.len() > self.block_size
                || !self.position_map.contains(&block.block_id)
        }) {
            return mismatch("stash", block.block_id.to_string());
        }
        if self.reset_in_progress
            && (!self.position_map.is_empty()
                || !self.stash.is_empty()
                || self.pending_eviction.is_some())
        {
            return mismatch(
                "reset_in_progress",
                "state left over from before the reset".to_string(),
            );
        }
        Ok(())
    }

    /// Rebuilds the stash recorded in the snapshot.
    pub fn restore_stash(&self) -> Stash {
        self.stash
            .iter()
            .map(|block| (block.block_id.clone(), block.payload.clone()))
            .collect()
    }
}

/// Durable storage for a single `Snapshot`.
///
/// `save` must replace the previous snapshot atomically: after a crash, `load` returns either the
/// old or the new snapshot, never a mixture. `clear` forgets the snapshot; together with clearing
/// the bucket store, it resets the ORAM to empty.
pub trait SnapshotStore {
    /// Returns the most recently saved snapshot, or `None` if there is none.
    fn load(&mut self) -> Result<Option<Snapshot>, OramError>;
    /// Replaces the saved snapshot.
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), OramError>;
    /// Removes the saved snapshot.
    fn clear(&mut self) -> Result<(), OramError>;
}

/// Keeps the snapshot as a JSON file, replaced atomically by renaming a temporary file over it.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Uses the file at `path`. The file is not touched until the first `save`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&mut self) -> Result<Option<Snapshot>, OramError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let snapshot: Snapshot = serde_json::from_slice(&fs::read(&self.path)?)?;
        log::debug!("Loaded snapshot from {}", self.path.display());
        Ok(Some(snapshot))
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), OramError> {
        let file = NamedTempFile::new_in(self.directory())?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush()?;

        let file = writer.into_inner().map_err(|error| error.into_error())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|error| error.error)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), OramError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Keeps the snapshot in memory. Clones share the same snapshot, which lets tests simulate a restart.
#[derive(Clone, Debug, Default)]
pub struct MemorySnapshotStore(Arc<Mutex<Option<Snapshot>>>);

impl MemorySnapshotStore {
    /// The saved snapshot, if any.
    pub fn current(&self) -> Option<Snapshot> {
        self.0.lock().ok()?.clone()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&mut self) -> Result<Option<Snapshot>, OramError> {
        Ok(self.0.lock().map_err(|_| OramError::LockPoisoned)?.clone())
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), OramError> {
        *self.0.lock().map_err(|_| OramError::LockPoisoned)? = Some(snapshot.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), OramError> {
        *self.0.lock().map_err(|_| OramError::LockPoisoned)? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::init_logger, Operation};

    fn sample() -> (OramConfig, Snapshot) {
        let config = OramConfig {
            tree_height: 3,
            block_size: 8,
            ..OramConfig::default()
        };
        let mut position_map = PositionMap::default();
        let mut stash = Stash::new();
        for (name, leaf) in [("photo-1", 2), ("photo-2", 5)] {
            let id = BlockId::new(name).unwrap();
            position_map.insert(id.clone(), leaf);
            stash.access(&id, Operation::Write(name.as_bytes()[..3].to_vec()));
        }
        let snapshot = Snapshot::capture(&config, 4, &position_map, &stash, Some(6), false);
        (config, snapshot)
    }

    #[test]
    fn file_store_round_trips() {
        init_logger();
        let directory = tempfile::tempdir().unwrap();
        let mut store = FileSnapshotStore::new(directory.path().join("state.json"));
        assert_eq!(store.load().unwrap(), None);

        let (config, snapshot) = sample();
        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(loaded.check_compatible(&config, 4).is_ok());
        assert_eq!(loaded.restore_stash().occupancy(), 2);

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn payloads_are_hex_encoded() {
        let (_, snapshot) = sample();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(r#""payload":"70686f""#));
        assert!(json.contains(r#""pending_eviction":6"#));
    }

    #[test]
    fn memory_store_is_shared_between_clones() {
        let (_, snapshot) = sample();
        let mut store = MemorySnapshotStore::default();
        let mut other = store.clone();
        store.save(&snapshot).unwrap();
        assert_eq!(other.load().unwrap(), Some(snapshot));
        other.clear().unwrap();
        assert_eq!(store.current(), None);
    }

    #[test]
    fn mismatched_shape_is_rejected() {
        let (config, snapshot) = sample();
        assert!(matches!(
            snapshot.check_compatible(&config, 2),
            Err(OramError::InvalidConfigurationError { .. })
        ));

        let taller = OramConfig {
            tree_height: 4,
            ..config.clone()
        };
        assert!(snapshot.check_compatible(&taller, 4).is_err());

        let mut corrupted = snapshot.clone();
        corrupted.pending_eviction = Some(8);
        assert!(corrupted.check_compatible(&config, 4).is_err());

        let mut half_reset = snapshot;
        half_reset.reset_in_progress = true;
        assert!(matches!(
            half_reset.check_compatible(&config, 4),
            Err(OramError::InvalidConfigurationError { parameter_name, .. })
                if parameter_name == "reset_in_progress"
        ));
    }

    #[test]
    fn reset_marker_round_trips_and_defaults_to_false() {
        let config = OramConfig {
            tree_height: 3,
            block_size: 8,
            ..OramConfig::default()
        };
        let marker = Snapshot::capture(
            &config,
            4,
            &PositionMap::default(),
            &Stash::new(),
            None,
            true,
        );
        assert!(marker.check_compatible(&config, 4).is_ok());
        let json = serde_json::to_string(&marker).unwrap();
        assert!(json.contains(r#""reset_in_progress":true"#));

        // Snapshots written before the marker existed still load.
        let legacy = json.replace(r#","reset_in_progress":true"#, "");
        let loaded: Snapshot = serde_json::from_str(&legacy).unwrap();
        assert!(!loaded.reset_in_progress);
    }

    #[test]
    fn garbage_file_is_a_format_error() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("state.json");
        fs::write(&path, "{").unwrap();
        assert!(matches!(
            FileSnapshotStore::new(path).load(),
            Err(OramError::SnapshotFormatError(_))
        ));
    }
}
