// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The untrusted bucket store the ORAM talks to, and a few drivers for it.

use crate::SlotId;
use duplicate::duplicate_item;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Errors reported by a storage driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Nothing has ever been stored at the slot.
    #[error("Slot {0} not found")]
    NotFound(SlotId),
    /// A network or I/O problem that may go away if the request is repeated.
    #[error("Transient storage failure: {0}")]
    Transient(String),
}

/// The bucket store as seen by the ORAM: opaque bytes keyed by slot.
///
/// Implementations never see plaintext. Every byte string they are handed
/// has already been sealed, and has the same length for every slot.
pub trait Storage {
    /// Returns the bytes most recently stored at `slot`.
    fn fetch_bucket(&mut self, slot: SlotId) -> Result<Vec<u8>, StorageError>;
    /// Replaces the bytes stored at `slot`.
    fn store_bucket(&mut self, slot: SlotId, bytes: Vec<u8>) -> Result<(), StorageError>;
}

#[duplicate_item(
    wrapper_type;
    [Box<S>];
    [&mut S];
)]
impl<S: Storage + ?Sized> Storage for wrapper_type {
    fn fetch_bucket(&mut self, slot: SlotId) -> Result<Vec<u8>, StorageError> {
        (**self).fetch_bucket(slot)
    }

    fn store_bucket(&mut self, slot: SlotId, bytes: Vec<u8>) -> Result<(), StorageError> {
        (**self).store_bucket(slot, bytes)
    }
}

/// An in-memory store. Clones share the same contents, so a store outlives any engine built on it.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage(Arc<Mutex<HashMap<SlotId, Vec<u8>>>>);

impl MemoryStorage {
    /// Returns the bytes at `slot`, bypassing the ORAM. Used to play the part of the provider.
    pub fn get(&self, slot: SlotId) -> Option<Vec<u8>> {
        self.0.lock().ok()?.get(&slot).cloned()
    }

    /// Overwrites the bytes at `slot`, bypassing the ORAM.
    pub fn insert(&self, slot: SlotId, bytes: Vec<u8>) {
        if let Ok(mut slots) = self.0.lock() {
            slots.insert(slot, bytes);
        }
    }

    /// The number of slots holding data.
    pub fn len(&self) -> usize {
        self.0.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    /// Whether no slot holds data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StorageError {
        StorageError::Transient("memory storage lock poisoned".to_string())
    }
}

impl Storage for MemoryStorage {
    fn fetch_bucket(&mut self, slot: SlotId) -> Result<Vec<u8>, StorageError> {
        let slots = self.0.lock().map_err(|_| Self::poisoned())?;
        slots.get(&slot).cloned().ok_or(StorageError::NotFound(slot))
    }

    fn store_bucket(&mut self, slot: SlotId, bytes: Vec<u8>) -> Result<(), StorageError> {
        let mut slots = self.0.lock().map_err(|_| Self::poisoned())?;
        slots.insert(slot, bytes);
        Ok(())
    }
}

/// A physical request as observed by the storage provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageOp {
    /// A `fetch_bucket` call.
    Fetch,
    /// A `store_bucket` call.
    Store,
}

/// A store that records every request made to an inner store.
#[derive(Debug, Default)]
pub struct CountAccessesStorage<S> {
    inner: S,
    /// Every request made so far, in order.
    pub requests: Vec<(StorageOp, SlotId)>,
}

impl<S> CountAccessesStorage<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            requests: Vec::new(),
        }
    }

    /// Returns the total number of fetches.
    pub fn get_read_count(&self) -> usize {
        self.count(StorageOp::Fetch)
    }

    /// Returns the total number of stores.
    pub fn get_write_count(&self) -> usize {
        self.count(StorageOp::Store)
    }

    /// Forgets the requests recorded so far.
    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn count(&self, op: StorageOp) -> usize {
        self.requests.iter().filter(|(o, _)| *o == op).count()
    }
}

impl<S: Storage> Storage for CountAccessesStorage<S> {
    fn fetch_bucket(&mut self, slot: SlotId) -> Result<Vec<u8>, StorageError> {
        log::debug!("Physical read -- {}", slot);

        self.requests.push((StorageOp::Fetch, slot));
        self.inner.fetch_bucket(slot)
    }

    fn store_bucket(&mut self, slot: SlotId, bytes: Vec<u8>) -> Result<(), StorageError> {
        log::debug!("Physical write -- {}", slot);

        self.requests.push((StorageOp::Store, slot));
        self.inner.store_bucket(slot, bytes)
    }
}

/// A store keeping one file per slot in a local directory.
#[derive(Clone, Debug)]
pub struct FileStorage {
    directory: PathBuf,
}

impl FileStorage {
    /// Opens (creating if necessary) a store in `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> io::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        log::info!("FileStorage::new({})", directory.display());
        Ok(Self { directory })
    }

    /// The directory holding the bucket files.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Deletes every bucket file. Part of a full reset, together with clearing the snapshot.
    pub fn clear(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().map_or(false, |extension| extension == "bucket") {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn slot_path(&self, slot: SlotId) -> PathBuf {
        self.directory.join(format!("{slot}.bucket"))
    }

    fn write_atomically(&self, slot: SlotId, bytes: &[u8]) -> io::Result<()> {
        let mut file = NamedTempFile::new_in(&self.directory)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(self.slot_path(slot))
            .map_err(|error| error.error)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn fetch_bucket(&mut self, slot: SlotId) -> Result<Vec<u8>, StorageError> {
        fs::read(self.slot_path(slot)).map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(slot),
            _ => StorageError::Transient(error.to_string()),
        })
    }

    fn store_bucket(&mut self, slot: SlotId, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.write_atomically(slot, &bytes)
            .map_err(|error| StorageError::Transient(error.to_string()))
    }
}
